//! Error taxonomy for the dialer
//!
//! `DialError` is what every public entry point returns. `ProxyError` is the
//! handshake-level error produced by the SOCKS and HTTP CONNECT clients and is
//! carried inside `DialError::Proxy`.

use crate::friendly::FriendlyError;
use crate::tls::TlsStrategy;
use std::fmt;
use std::fmt::Write as _;
use std::io;
use thiserror::Error;

/// DialError covers every way a dial call can fail
#[derive(Debug, Error)]
pub enum DialError {
    /// Target is not a usable `host:port`
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// force-proxy was requested but no proxy is configured
    #[error("force proxy is enabled but no proxy is configured")]
    NoProxyConfigured,

    /// Proxy URI without host or port
    #[error("invalid proxy {0:?}: host and port are required")]
    InvalidProxy(String),

    /// Proxy URI with a scheme we do not speak
    #[error("unsupported proxy scheme {0:?}")]
    UnsupportedProxyScheme(String),

    /// TLS parameters that cannot be turned into a handshake
    #[error("invalid tls parameters: {0}")]
    InvalidTlsParams(String),

    /// Client certificate could not be loaded
    #[error("client certificate: {0}")]
    ClientCert(String),

    /// Host or address matched the deny-list
    #[error("address {0} is denied by policy")]
    AddressDenied(String),

    /// DNS collaborator produced no address
    #[error("cannot resolve {0}: no address found")]
    ResolutionFailed(String),

    /// Connect timed out and the retry budget is spent
    #[error(
        "dial {target} timed out (timeout retries: {timeout_retries}, refused retries: {refused_retries}): {source}"
    )]
    Timeout {
        target: String,
        timeout_retries: u32,
        refused_retries: u32,
        #[source]
        source: io::Error,
    },

    /// Connect was refused and the retry budget is spent
    #[error(
        "dial {target} refused (timeout retries: {timeout_retries}, refused retries: {refused_retries}): {source}"
    )]
    Refused {
        target: String,
        timeout_retries: u32,
        refused_retries: u32,
        #[source]
        source: io::Error,
    },

    /// The enclosing deadline expired before the operation could start
    #[error("{op} {target}: deadline exceeded")]
    DeadlineExceeded { op: &'static str, target: String },

    /// Any other I/O failure, wrapped with operation and target
    #[error("{op} {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },

    /// One proxy failed its handshake
    #[error("proxy {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: ProxyError,
    },

    /// Every configured proxy failed
    #[error("{}", render_proxy_exhaustion(.target, .failures, .friendly, .config_summary))]
    NoProxyAvailable {
        target: String,
        failures: Vec<ProxyFailure>,
        friendly: Box<FriendlyError>,
        config_summary: String,
    },

    /// One TLS strategy failed its handshake
    #[error("tls handshake with {target} using {strategy} failed: {reason}")]
    Handshake {
        target: String,
        strategy: TlsStrategy,
        reason: String,
    },

    /// A GM strategy was selected but no GM-TLS runtime is registered
    #[error("gm tls runtime is not available")]
    GmUnavailable,

    /// Every TLS strategy failed
    #[error("{0}")]
    TlsExhausted(Box<TlsFailureReport>),
}

impl DialError {
    pub(crate) fn io(op: &'static str, target: impl Into<String>, source: io::Error) -> Self {
        DialError::Io {
            op,
            target: target.into(),
            source,
        }
    }

    /// is_proxy_auth_failed reports whether a proxy rejected our credentials,
    /// looking through proxy aggregation
    pub fn is_proxy_auth_failed(&self) -> bool {
        match self {
            DialError::Proxy { source, .. } => matches!(source, ProxyError::AuthFailed),
            DialError::NoProxyAvailable { failures, .. } => {
                failures.iter().any(|f| f.error.is_proxy_auth_failed())
            }
            DialError::TlsExhausted(report) => report
                .attempts
                .iter()
                .any(|(_, e)| e.is_proxy_auth_failed()),
            _ => false,
        }
    }

    /// is_terminal_config reports configuration and policy errors, which are never retried
    pub fn is_terminal_config(&self) -> bool {
        matches!(
            self,
            DialError::InvalidTarget { .. }
                | DialError::NoProxyConfigured
                | DialError::InvalidProxy(_)
                | DialError::UnsupportedProxyScheme(_)
                | DialError::InvalidTlsParams(_)
                | DialError::AddressDenied(_)
        )
    }
}

/// ProxyFailure pairs a (redacted) proxy with the reason it was skipped
#[derive(Debug)]
pub struct ProxyFailure {
    pub proxy: String,
    pub error: DialError,
}

fn render_proxy_exhaustion(
    target: &str,
    failures: &[ProxyFailure],
    friendly: &FriendlyError,
    config_summary: &str,
) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = write_proxy_exhaustion(&mut out, target, failures, friendly, config_summary);
    out
}

fn write_proxy_exhaustion(
    out: &mut String,
    target: &str,
    failures: &[ProxyFailure],
    friendly: &FriendlyError,
    config_summary: &str,
) -> fmt::Result {
    writeln!(out, "no proxy available for {target}")?;
    if failures.is_empty() {
        writeln!(out, "  no proxy was tried")?;
    }
    for failure in failures {
        writeln!(out, "  [{}] {}", failure.proxy, failure.error)?;
    }
    write_diagnosis(out, friendly, config_summary)
}

// Shared tail of the aggregated errors: classification, hints, configuration
fn write_diagnosis(
    out: &mut impl fmt::Write,
    friendly: &FriendlyError,
    config_summary: &str,
) -> fmt::Result {
    writeln!(
        out,
        "reason: {} ({})",
        friendly.description, friendly.description_zh
    )?;
    if !friendly.suggestions.is_empty() {
        writeln!(out, "suggestions:")?;
        for s in &friendly.suggestions {
            writeln!(out, "  - {s}")?;
        }
    }
    write!(out, "config: {config_summary}")
}

/// ProxyError is a failed proxy handshake
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The proxy rejected our credentials (HTTP 407, SOCKS5 auth status != 0)
    #[error("proxy authentication failed")]
    AuthFailed,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reply did not follow the protocol
    #[error("unexpected {protocol} reply: {detail}")]
    Protocol {
        protocol: &'static str,
        detail: String,
    },

    /// Credentials or target cannot be framed on the wire
    #[error("cannot encode {0}")]
    Encode(String),

    /// SOCKS4 reply code other than 90
    #[error("socks4 request rejected: {0}")]
    Socks4Rejected(&'static str),

    /// SOCKS5 reply code other than 0
    #[error("socks5 connect failed: {0}")]
    Socks5Rejected(String),

    /// HTTP CONNECT status outside [200, 400)
    #[error("http proxy answered {code}: {status_line}")]
    HttpStatus { code: u16, status_line: String },

    /// CONNECT reply announced a body
    #[error("connect response must not carry a body (content-length: {0})")]
    ResponseBody(u64),

    /// TLS between us and an https proxy
    #[error("tls to proxy: {0}")]
    Tls(String),
}

impl ProxyError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ProxyError::Io { context, source }
    }

    pub(crate) fn protocol(protocol: &'static str, detail: impl Into<String>) -> Self {
        ProxyError::Protocol {
            protocol,
            detail: detail.into(),
        }
    }
}

/// TlsFailureReport is the diagnostic payload returned when every TLS
/// strategy failed
#[derive(Debug)]
pub struct TlsFailureReport {
    pub target: String,
    pub attempts: Vec<(TlsStrategy, DialError)>,
    pub friendly: FriendlyError,
    pub config_summary: String,
}

impl fmt::Display for TlsFailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tls dial {} failed after {} strategies",
            self.target,
            self.attempts.len()
        )?;
        for (strategy, err) in &self.attempts {
            writeln!(f, "  [{strategy}] {err}")?;
        }
        write_diagnosis(f, &self.friendly, &self.config_summary)
    }
}
