//! Plain TCP dial engine
//!
//! Produces a connected plain stream, either directly or tunnelled through
//! the first working proxy of the configured list. When proxies are
//! configured and all of them fail the dial fails. It never falls back to a
//! direct connection.

use crate::backoff::jitter_backoff;
use crate::config::DialConfig;
use crate::conn::{Connection, IoStream};
use crate::error::{DialError, ProxyError, ProxyFailure};
use crate::friendly::classify;
use crate::http_connect::http_connect;
use crate::proxy::{ProxyCredential, ProxyScheme, join_host_port, split_host_port};
use crate::rate;
use crate::resolver::Resolver;
use crate::socks::{socks4_connect, socks4a_connect, socks5_connect};
use crate::tls::select_strategies;
use crate::tls::upgrade::proxy_client_config;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// dial_plain connects to `target` (`host:port`) as configured by `cfg`
pub(crate) async fn dial_plain(
    cfg: &DialConfig,
    resolver: &dyn Resolver,
    target: &str,
) -> Result<Connection, DialError> {
    let started = Instant::now();
    let (host, port) = split_host_port(target).ok_or_else(|| DialError::InvalidTarget {
        target: target.to_string(),
        reason: "expected host:port".into(),
    })?;
    let target = join_host_port(&host, port);

    let proxies = cfg.effective_proxies();
    if cfg.force_proxy && proxies.is_empty() {
        return Err(DialError::NoProxyConfigured);
    }
    if cfg.deny.contains(&host) {
        return Err(DialError::AddressDenied(host));
    }

    let conn = if proxies.is_empty() {
        let ip = resolve(cfg, resolver, &host).await?;
        if cfg.deny.contains_ip(ip) {
            return Err(DialError::AddressDenied(ip.to_string()));
        }
        let stream = dial_direct(cfg, SocketAddr::new(ip, port), &target).await?;
        Connection::new(Box::new(stream), target)
    } else {
        dial_via_proxies(cfg, resolver, &proxies, &host, port, &target).await?
    };

    if let Some(trace) = &cfg.trace {
        trace.record_tcp(started.elapsed());
    }
    Ok(conn)
}

async fn dial_via_proxies(
    cfg: &DialConfig,
    resolver: &dyn Resolver,
    proxies: &[String],
    host: &str,
    port: u16,
    target: &str,
) -> Result<Connection, DialError> {
    let mut failures = Vec::new();
    for raw in proxies {
        let cred = ProxyCredential::parse(raw)?;
        let label = cred.redacted();
        attempt_event!(cfg, proxy = %label, addr = %target, "dialing through proxy");

        match dial_through(cfg, resolver, &cred, host, port, target).await {
            Ok(stream) => {
                return Ok(Connection::new(stream, target).with_proxy(label));
            }
            Err(e) if e.is_terminal_config() => return Err(e),
            Err(e) => {
                attempt_event!(cfg, proxy = %label, addr = %target, error = %e, "proxy failed");
                failures.push(ProxyFailure {
                    proxy: label,
                    error: e,
                });
            }
        }
    }
    // a TLS dial reports the strategies it would have run
    let strategies = if cfg.tls {
        select_strategies(cfg.gm)
    } else {
        Vec::new()
    };
    let raw = failures
        .iter()
        .map(|f| root_cause(&f.error))
        .collect::<Vec<_>>()
        .join("; ");
    Err(DialError::NoProxyAvailable {
        target: target.to_string(),
        friendly: Box::new(classify(&raw, &strategies)),
        config_summary: cfg.summary(&strategies),
        failures,
    })
}

/// root_cause is the innermost message of an error chain
fn root_cause(err: &DialError) -> String {
    let mut cause: &dyn std::error::Error = err;
    while let Some(source) = cause.source() {
        cause = source;
    }
    cause.to_string()
}

/// dial_through opens a tunnel to `host:port` through one proxy
async fn dial_through(
    cfg: &DialConfig,
    resolver: &dyn Resolver,
    cred: &ProxyCredential,
    host: &str,
    port: u16,
    target: &str,
) -> Result<IoStream, DialError> {
    // SOCKS4 carries only an IPv4 address, so resolve before touching the proxy
    let socks4_ip = match cred.scheme {
        ProxyScheme::Socks4 => Some(resolve_ipv4(cfg, resolver, host).await?),
        _ => None,
    };

    let stream = dial_proxy_host(cfg, resolver, cred).await?;
    let proxy_err = |source: ProxyError| DialError::Proxy {
        proxy: cred.redacted(),
        source,
    };
    let timeout = cfg
        .child_timeout(cfg.timeout)
        .ok_or_else(|| DialError::DeadlineExceeded {
            op: "proxy handshake",
            target: target.to_string(),
        })?;

    let handshake = async {
        let user_id = cred.auth.as_ref().map_or("", |a| a.username.as_str());
        let tunnel: IoStream = match cred.scheme {
            ProxyScheme::Http => {
                let mut stream = stream;
                http_connect(&mut stream, target, cred.auth.as_ref()).await?;
                Box::new(stream)
            }
            ProxyScheme::Https => {
                let config = proxy_client_config(cfg.insecure_skip_verify)
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                let name = ServerName::try_from(cred.host.clone())
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                let mut tls = TlsConnector::from(config)
                    .connect(name, stream)
                    .await
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                http_connect(&mut tls, target, cred.auth.as_ref()).await?;
                Box::new(tls)
            }
            ProxyScheme::Socks4 => {
                let mut stream = stream;
                // resolved above for this scheme
                let ip = socks4_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
                socks4_connect(&mut stream, ip, port, user_id).await?;
                Box::new(stream)
            }
            ProxyScheme::Socks4a => {
                let mut stream = stream;
                socks4a_connect(&mut stream, host, port, user_id).await?;
                Box::new(stream)
            }
            ProxyScheme::Socks5 => {
                let mut stream = stream;
                socks5_connect(&mut stream, host, port, cred.auth.as_ref()).await?;
                Box::new(stream)
            }
        };
        Ok::<_, ProxyError>(tunnel)
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(tunnel)) => Ok(tunnel),
        Ok(Err(e)) => Err(proxy_err(e)),
        Err(_) => Err(proxy_err(ProxyError::Io {
            context: "proxy handshake",
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {timeout:?}"),
            ),
        })),
    }
}

/// dial_proxy_host connects directly to the proxy server itself
///
/// Proxy connections never go through proxy selection again.
pub(crate) async fn dial_proxy_host(
    cfg: &DialConfig,
    resolver: &dyn Resolver,
    cred: &ProxyCredential,
) -> Result<TcpStream, DialError> {
    let ip = resolve(cfg, resolver, &cred.host).await?;
    dial_direct(cfg, SocketAddr::new(ip, cred.port), &cred.host_port()).await
}

async fn resolve(cfg: &DialConfig, resolver: &dyn Resolver, host: &str) -> Result<IpAddr, DialError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let timeout = cfg
        .child_timeout(cfg.timeout)
        .ok_or_else(|| DialError::DeadlineExceeded {
            op: "resolve",
            target: host.to_string(),
        })?;
    match tokio::time::timeout(timeout, resolver.lookup_first(host, &cfg.dns)).await {
        Ok(Some(ip)) => Ok(ip),
        _ => Err(DialError::ResolutionFailed(host.to_string())),
    }
}

async fn resolve_ipv4(
    cfg: &DialConfig,
    resolver: &dyn Resolver,
    host: &str,
) -> Result<Ipv4Addr, DialError> {
    let ip = if let Ok(ip) = host.parse::<IpAddr>() {
        ip
    } else {
        let timeout = cfg
            .child_timeout(cfg.timeout)
            .ok_or_else(|| DialError::DeadlineExceeded {
                op: "resolve",
                target: host.to_string(),
            })?;
        let all = tokio::time::timeout(timeout, resolver.lookup_all(host, &cfg.dns))
            .await
            .unwrap_or_default();
        all.into_iter()
            .find(IpAddr::is_ipv4)
            .ok_or_else(|| DialError::ResolutionFailed(host.to_string()))?
    };
    if cfg.deny.contains_ip(ip) {
        return Err(DialError::AddressDenied(ip.to_string()));
    }
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(DialError::Proxy {
            proxy: "socks4".into(),
            source: ProxyError::Encode(format!("ipv6 target {ip} over socks4")),
        }),
    }
}

/// dial_direct connects to `addr`, retrying timeouts and refusals with backoff
async fn dial_direct(cfg: &DialConfig, addr: SocketAddr, label: &str) -> Result<TcpStream, DialError> {
    let mut timeout_retries = 0u32;
    let mut refused_retries = 0u32;

    loop {
        let timeout = cfg
            .child_timeout(cfg.timeout)
            .ok_or_else(|| DialError::DeadlineExceeded {
                op: "dial",
                target: label.to_string(),
            })?;

        let err = match connect_once(cfg, addr, timeout).await {
            Ok(stream) => {
                if let Some(idle) = cfg.keep_alive {
                    let keepalive = TcpKeepalive::new().with_time(idle);
                    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                        warn!("cannot enable keep-alive on {}: {}", label, e);
                    }
                }
                rate::record_connection();
                return Ok(stream);
            }
            Err(e) => e,
        };

        let timed_out = match err.kind() {
            io::ErrorKind::TimedOut => true,
            io::ErrorKind::ConnectionRefused => false,
            _ => return Err(DialError::io("dial", label, err)),
        };
        let attempt = if timed_out { timeout_retries } else { refused_retries };

        if !cfg.retry.enabled || attempt >= cfg.retry.max_retries {
            let target = label.to_string();
            return Err(if timed_out {
                DialError::Timeout {
                    target,
                    timeout_retries,
                    refused_retries,
                    source: err,
                }
            } else {
                DialError::Refused {
                    target,
                    timeout_retries,
                    refused_retries,
                    source: err,
                }
            });
        }

        let wait = jitter_backoff(cfg.retry.min_wait, cfg.retry.max_wait, attempt);
        if timed_out {
            timeout_retries += 1;
        } else {
            refused_retries += 1;
        }
        attempt_event!(cfg, addr = %label, attempt = attempt + 1, wait = ?wait, error = %err, "retrying connect");
        match cfg.child_timeout(wait) {
            Some(wait) => tokio::time::sleep(wait).await,
            None => {
                return Err(DialError::DeadlineExceeded {
                    op: "dial",
                    target: label.to_string(),
                });
            }
        }
    }
}

async fn connect_once(
    cfg: &DialConfig,
    addr: SocketAddr,
    timeout: std::time::Duration,
) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(local) = local_source(cfg, addr).await {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out after {timeout:?}"),
        )),
    }
}

/// local_source picks the address to bind before connecting, if any
///
/// An explicit local address wins over strong host mode.
async fn local_source(cfg: &DialConfig, remote: SocketAddr) -> Option<IpAddr> {
    if let Some(local) = cfg.local_addr {
        if local.is_ipv4() == remote.is_ipv4() {
            return Some(local);
        }
        warn!("local address {} does not match the family of {}, not binding", local, remote);
        return None;
    }
    if cfg.strong_host {
        return route_source(remote).await;
    }
    None
}

// Connecting a UDP socket sends nothing but makes the OS pick a route
async fn route_source(remote: SocketAddr) -> Option<IpAddr> {
    let unspecified: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let source = async {
        let socket = UdpSocket::bind(unspecified).await?;
        socket.connect(remote).await?;
        socket.local_addr()
    };
    match source.await {
        Ok(local) => Some(local.ip()),
        Err(e) => {
            debug!("strong host mode: no route source for {}: {}", remote, e);
            None
        }
    }
}
