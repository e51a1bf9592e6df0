//! Proxy URI parsing
//!
//! A proxy is written as `scheme://[user[:pass]@]host:port`. A missing
//! scheme means `http`. A missing port is always an error.

use crate::error::DialError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use std::fmt;
use std::net::IpAddr;
use url::{Host, Url};

/// Characters escaped in URI credentials; RFC 3986 unreserved ones stay literal
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Environment variables consulted by `proxy_from_env`, in order
const PROXY_ENV_VARS: &[&str] = &[
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// ProxyScheme is the closed set of proxy protocols the dialer speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyScheme {
    /// from_scheme maps a URI scheme to a proxy protocol
    pub fn from_scheme(scheme: &str) -> Result<Self, DialError> {
        match scheme.to_ascii_lowercase().as_str() {
            // schemeless input is normalised to http before it gets here
            "http" | "" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks4" => Ok(ProxyScheme::Socks4),
            "socks4a" => Ok(ProxyScheme::Socks4a),
            "socks5" | "socks5h" => Ok(ProxyScheme::Socks5),
            other => Err(DialError::UnsupportedProxyScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks4a => "socks4a",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UserPass holds proxy credentials
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// ProxyCredential is one parsed proxy URI
///
/// It lives for a single dial attempt. The proxy itself is always reached
/// with a direct plain dial, so proxy traffic never goes back through proxy
/// selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredential {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub auth: Option<UserPass>,
}

impl ProxyCredential {
    /// parse reads a proxy URI, defaulting the scheme to http
    pub fn parse(raw: &str) -> Result<Self, DialError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DialError::InvalidProxy(String::new()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let (scheme, rest) = with_scheme
            .split_once("://")
            .ok_or_else(|| DialError::InvalidProxy(redact(raw)))?;
        let scheme = ProxyScheme::from_scheme(scheme)?;

        // Url drops ports equal to the scheme default, so look for one by hand
        if !authority_has_port(rest) {
            return Err(DialError::InvalidProxy(redact(raw)));
        }

        let url = Url::parse(&with_scheme).map_err(|_| DialError::InvalidProxy(redact(raw)))?;
        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(DialError::InvalidProxy(redact(raw))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DialError::InvalidProxy(redact(raw)))?;

        let auth = if url.username().is_empty() {
            None
        } else {
            Some(UserPass {
                username: percent_decode(url.username()),
                password: url.password().map(percent_decode).unwrap_or_default(),
            })
        };

        Ok(Self {
            scheme,
            host,
            port,
            auth,
        })
    }

    /// host_port renders `host:port`, bracketing IPv6 literals
    pub fn host_port(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// to_uri renders the normalised URI, credentials included
    pub fn to_uri(&self) -> String {
        match &self.auth {
            Some(auth) if auth.password.is_empty() => format!(
                "{}://{}@{}",
                self.scheme,
                percent_encode(&auth.username),
                self.host_port()
            ),
            Some(auth) => format!(
                "{}://{}:{}@{}",
                self.scheme,
                percent_encode(&auth.username),
                percent_encode(&auth.password),
                self.host_port()
            ),
            None => format!("{}://{}", self.scheme, self.host_port()),
        }
    }

    /// redacted renders the URI with credentials masked, for logs and errors
    pub fn redacted(&self) -> String {
        match self.auth {
            Some(_) => format!("{}://***@{}", self.scheme, self.host_port()),
            None => format!("{}://{}", self.scheme, self.host_port()),
        }
    }
}

/// fix_proxy normalises a proxy string, returning `""` when it is unusable
///
/// `"127.0.0.1:1080"` becomes `"http://127.0.0.1:1080"`, while `"127.0.0.1"`
/// and `"socks5://127.0.0.1"` (no port) become `""`.
pub fn fix_proxy(raw: &str) -> String {
    match ProxyCredential::parse(raw) {
        Ok(cred) => cred.to_uri(),
        Err(_) => String::new(),
    }
}

/// proxy_from_env returns the first usable proxy named by the usual
/// environment variables, or `""`
pub fn proxy_from_env() -> String {
    PROXY_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| fix_proxy(&value))
        .find(|fixed| !fixed.is_empty())
        .unwrap_or_default()
}

/// join_host_port renders `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]:{port}"),
        _ => format!("{host}:{port}"),
    }
}

/// split_host_port splits `host:port` and `[v6]:port`
pub fn split_host_port(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        (host, port)
    } else {
        let (host, port) = target.rsplit_once(':')?;
        // a bare IPv6 literal has more than one colon and is ambiguous
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

fn authority_has_port(rest: &str) -> bool {
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);

    let port = if host_port.starts_with('[') {
        host_port.rsplit_once("]:").map(|(_, port)| port)
    } else {
        host_port.rsplit_once(':').map(|(_, port)| port)
    };
    port.is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

fn redact(raw: &str) -> String {
    match raw.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => raw.to_string(),
        },
        None => match raw.rsplit_once('@') {
            Some((_, host)) => format!("***@{host}"),
            None => raw.to_string(),
        },
    }
}

fn percent_encode(s: &str) -> String {
    utf8_percent_encode(s, USERINFO).to_string()
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
