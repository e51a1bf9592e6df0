//! Dial orchestrator
//!
//! `Dialer::dial` merges the configuration layers, then either hands the call
//! to the plain dial engine or runs the TLS strategy loop on top of it. Each
//! TLS strategy gets its own fresh plain connection.

use crate::config::{DefaultProfile, DialConfig, DialOption};
use crate::conn::Connection;
use crate::error::{DialError, ProxyError, TlsFailureReport};
use crate::friendly::classify;
use crate::http_connect::http_connect;
use crate::proxy::{ProxyCredential, ProxyScheme, split_host_port};
use crate::resolver::{Resolver, SystemResolver};
use crate::socks::auth::negotiate_auth;
use crate::socks::{socks4_connect, socks4a_connect};
use crate::tcp;
use crate::tls::upgrade::{proxy_client_config, upgrade};
use crate::tls::{ClientCertStore, GmTlsConnector, TlsStrategy, select_strategies};
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

/// Synthetic destination used by `proxy_check`
const PROBE_HOST: &str = "example.com";
const PROBE_IP: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
const PROBE_PORT: u16 = 80;

static GLOBAL: OnceLock<Dialer> = OnceLock::new();

/// Dialer owns the collaborators a dial needs
pub struct Dialer {
    profile: Arc<DefaultProfile>,
    resolver: Arc<dyn Resolver>,
    gm: Option<Arc<dyn GmTlsConnector>>,
    certs: Arc<ClientCertStore>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("profile", &self.profile)
            .field("gm", &self.gm.is_some())
            .field("certs", &self.certs)
            .finish()
    }
}

impl Dialer {
    /// new builds a dialer with the system resolver and no GM-TLS runtime
    pub fn new() -> Self {
        Self {
            profile: Arc::new(DefaultProfile::new()),
            resolver: Arc::new(SystemResolver),
            gm: None,
            certs: Arc::new(ClientCertStore::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_gm_connector(mut self, gm: Arc<dyn GmTlsConnector>) -> Self {
        self.gm = Some(gm);
        self
    }

    pub fn with_profile(mut self, profile: Arc<DefaultProfile>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_cert_store(mut self, certs: Arc<ClientCertStore>) -> Self {
        self.certs = certs;
        self
    }

    /// global is the process-wide dialer behind `dial_x`
    pub fn global() -> &'static Dialer {
        GLOBAL.get_or_init(Dialer::new)
    }

    /// install_global replaces the dialer `global` would build
    ///
    /// Fails, handing the dialer back, once the global dialer exists.
    pub fn install_global(dialer: Dialer) -> Result<(), Dialer> {
        GLOBAL.set(dialer)
    }

    pub fn profile(&self) -> &DefaultProfile {
        &self.profile
    }

    pub fn cert_store(&self) -> &ClientCertStore {
        &self.certs
    }

    /// dial connects to `target` (`host:port`)
    pub async fn dial(&self, target: &str, opts: &[DialOption]) -> Result<Connection, DialError> {
        let started = Instant::now();
        let cfg = self.profile.build(opts);

        let result = if cfg.tls {
            self.dial_tls(&cfg, target).await
        } else {
            tcp::dial_plain(&cfg, self.resolver.as_ref(), target).await
        };

        if let Some(trace) = &cfg.trace {
            trace.record_total(started.elapsed());
        }
        result
    }

    async fn dial_tls(&self, cfg: &DialConfig, target: &str) -> Result<Connection, DialError> {
        let (host, _) = split_host_port(target).ok_or_else(|| DialError::InvalidTarget {
            target: target.to_string(),
            reason: "expected host:port".into(),
        })?;
        let strategies = select_strategies(cfg.gm);
        let mut attempts: Vec<(TlsStrategy, DialError)> = Vec::new();

        for &strategy in &strategies {
            if strategy.is_gm() && self.gm.is_none() {
                attempt_event!(cfg, addr = %target, strategy = %strategy, "no gm tls runtime registered");
                attempts.push((strategy, DialError::GmUnavailable));
                continue;
            }

            // plain dial failures are not strategy failures
            let plain = tcp::dial_plain(cfg, self.resolver.as_ref(), target).await?;
            let (stream, conn_target, proxy) = plain.into_parts();
            let timeout = cfg
                .child_timeout(cfg.tls_timeout)
                .ok_or_else(|| DialError::DeadlineExceeded {
                    op: "tls handshake",
                    target: conn_target.clone(),
                })?;

            attempt_event!(cfg, addr = %conn_target, strategy = %strategy, "tls handshake");
            let handshake_started = Instant::now();
            match upgrade(
                stream,
                strategy,
                cfg,
                &host,
                &conn_target,
                &self.certs,
                self.gm.as_deref(),
                timeout,
            )
            .await
            {
                Ok((stream, alpn)) => {
                    if let Some(trace) = &cfg.trace {
                        trace.record_tls(handshake_started.elapsed());
                    }
                    return Ok(Connection::upgraded(stream, conn_target, proxy, strategy, alpn));
                }
                Err(e) if e.is_terminal_config() => return Err(e),
                Err(e) => {
                    attempt_event!(cfg, addr = %conn_target, strategy = %strategy, error = %e, "tls strategy failed");
                    attempts.push((strategy, e));
                }
            }
        }

        // classify what actually reached the wire; fall back to everything
        let ran: Vec<_> = attempts
            .iter()
            .filter(|(_, e)| !matches!(e, DialError::GmUnavailable))
            .collect();
        let (raw, tried): (Vec<String>, Vec<TlsStrategy>) = if ran.is_empty() {
            attempts.iter().map(|(s, e)| (raw_reason(e), *s)).unzip()
        } else {
            ran.iter().map(|(s, e)| (raw_reason(e), *s)).unzip()
        };
        let friendly = classify(&raw.join("; "), &tried);

        Err(DialError::TlsExhausted(Box::new(TlsFailureReport {
            target: target.to_string(),
            attempts,
            friendly,
            config_summary: cfg.summary(&strategies),
        })))
    }

    /// proxy_check verifies that `proxy` speaks its protocol
    ///
    /// Only the proxy handshake runs, against a synthetic destination that is
    /// never required to be reachable. SOCKS5 stops after method negotiation.
    /// For SOCKS4 and HTTP any well-formed reply counts as alive, except an
    /// authentication rejection.
    pub async fn proxy_check(&self, proxy: &str, timeout: Duration) -> Result<Connection, DialError> {
        let cred = ProxyCredential::parse(proxy)?;
        let label = cred.redacted();
        let cfg = self.profile.build(&[
            DialOption::Timeout(timeout),
            DialOption::DisableProxy(true),
        ]);
        let stream = tcp::dial_proxy_host(&cfg, self.resolver.as_ref(), &cred).await?;
        let probe_target = format!("{PROBE_HOST}:{PROBE_PORT}");

        let probe = async {
            let user_id = cred.auth.as_ref().map_or("", |a| a.username.as_str());
            let stream: crate::conn::IoStream = match cred.scheme {
                ProxyScheme::Socks5 => {
                    let mut stream = stream;
                    negotiate_auth(&mut stream, cred.auth.as_ref()).await?;
                    Box::new(stream)
                }
                ProxyScheme::Socks4 => {
                    let mut stream = stream;
                    alive_on_reply(socks4_connect(&mut stream, PROBE_IP, PROBE_PORT, user_id).await)?;
                    Box::new(stream)
                }
                ProxyScheme::Socks4a => {
                    let mut stream = stream;
                    alive_on_reply(
                        socks4a_connect(&mut stream, PROBE_HOST, PROBE_PORT, user_id).await,
                    )?;
                    Box::new(stream)
                }
                ProxyScheme::Http => {
                    let mut stream = stream;
                    alive_on_reply(
                        http_connect(&mut stream, &probe_target, cred.auth.as_ref())
                            .await
                            .map(drop),
                    )?;
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
                    alive_on_reply(
                        http_connect(&mut tls, &probe_target, cred.auth.as_ref())
                            .await
                            .map(drop),
                    )?;
                    Box::new(tls)
                }
            };
            Ok::<_, ProxyError>(stream)
        };

        let proxy_err = |source| DialError::Proxy {
            proxy: label.clone(),
            source,
        };
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(stream)) => Ok(Connection::new(stream, probe_target).with_proxy(label.clone())),
            Ok(Err(e)) => Err(proxy_err(e)),
            Err(_) => Err(proxy_err(ProxyError::Io {
                context: "proxy check",
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out after {timeout:?}"),
                ),
            })),
        }
    }

    /// is_tls_service reports whether `addr` completes an ordinary TLS handshake
    pub async fn is_tls_service(&self, addr: &str, proxies: &[String]) -> bool {
        self.dial(
            addr,
            &[
                DialOption::Tls(true),
                DialOption::GmSupport(false),
                DialOption::GmOnly(false),
                DialOption::GmPrefer(false),
                DialOption::InsecureSkipVerify(true),
                DialOption::Proxy(proxies.to_vec()),
            ],
        )
        .await
        .is_ok()
    }
}

// A rejection still proves the proxy speaks the protocol
fn alive_on_reply(result: Result<(), ProxyError>) -> Result<(), ProxyError> {
    match result {
        Ok(())
        | Err(ProxyError::Socks4Rejected(_))
        | Err(ProxyError::HttpStatus { .. })
        | Err(ProxyError::ResponseBody(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn raw_reason(err: &DialError) -> String {
    match err {
        DialError::Handshake { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

/// dial_x dials through the global dialer
pub async fn dial_x(target: &str, opts: &[DialOption]) -> Result<Connection, DialError> {
    Dialer::global().dial(target, opts).await
}

/// dial_tcp_timeout opens a plain connection, through `proxies` if any
pub async fn dial_tcp_timeout(
    target: &str,
    timeout: Duration,
    proxies: &[String],
) -> Result<Connection, DialError> {
    dial_x(
        target,
        &[
            DialOption::Timeout(timeout),
            DialOption::Proxy(proxies.to_vec()),
        ],
    )
    .await
}

/// dial_tcp_timeout_force_proxy is `dial_tcp_timeout` that refuses to go direct
pub async fn dial_tcp_timeout_force_proxy(
    target: &str,
    timeout: Duration,
    proxies: &[String],
) -> Result<Connection, DialError> {
    dial_x(
        target,
        &[
            DialOption::Timeout(timeout),
            DialOption::Proxy(proxies.to_vec()),
            DialOption::ForceProxy(true),
        ],
    )
    .await
}

/// dial_tls_timeout opens a TLS connection with the default strategy order
pub async fn dial_tls_timeout(
    target: &str,
    timeout: Duration,
    sni: Option<&str>,
    proxies: &[String],
) -> Result<Connection, DialError> {
    let mut opts = vec![
        DialOption::Tls(true),
        DialOption::Timeout(timeout),
        DialOption::TlsTimeout(timeout),
        DialOption::Proxy(proxies.to_vec()),
    ];
    if let Some(sni) = sni {
        opts.push(DialOption::Sni(sni.to_string()));
    }
    dial_x(target, &opts).await
}

/// proxy_check probes `proxy` with the global dialer
pub async fn proxy_check(proxy: &str, timeout: Duration) -> Result<Connection, DialError> {
    Dialer::global().proxy_check(proxy, timeout).await
}
