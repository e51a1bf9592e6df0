//! Per-strategy TLS handshakes over an established stream
//!
//! Every attempt builds its own client configuration. A caller-supplied
//! override is cloned before strategy-specific changes, so concurrent dials
//! sharing one template never see each other's mutations.

use crate::config::DialConfig;
use crate::conn::IoStream;
use crate::error::DialError;
use crate::tls::certs::ClientCertStore;
use crate::tls::gm::{GmTlsConfig, GmTlsConnector};
use crate::tls::verify::NoVerify;
use crate::tls::TlsStrategy;
use rustls::pki_types::ServerName;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// TlsVersion bounds the ordinary TLS protocol range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn protocol(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &TLS12,
            TlsVersion::Tls13 => &TLS13,
        }
    }
}

/// TlsParams is a full TLS parameter override for one cipher family
///
/// An override only applies to the strategies of its own family. The other
/// family keeps the parameters derived from the dial options.
#[derive(Clone)]
pub enum TlsParams {
    Ordinary(Arc<ClientConfig>),
    Gm(GmTlsConfig),
}

impl fmt::Debug for TlsParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsParams::Ordinary(_) => f.write_str("Ordinary(..)"),
            TlsParams::Gm(cfg) => f.debug_tuple("Gm").field(cfg).finish(),
        }
    }
}

/// The negotiated stream and ALPN protocol of a finished handshake
pub(crate) type Upgraded = (IoStream, Option<Vec<u8>>);

/// server_name_for picks the SNI: the override if set, otherwise the target host
pub(crate) fn server_name_for(cfg: &DialConfig, host: &str) -> String {
    match cfg.sni.as_deref() {
        Some(sni) if !sni.is_empty() => sni.to_string(),
        _ => host.trim_start_matches('[').trim_end_matches(']').to_string(),
    }
}

/// ordinary_config builds the rustls configuration for one ordinary attempt
pub(crate) fn ordinary_config(
    cfg: &DialConfig,
    server_name: &str,
    certs: &ClientCertStore,
) -> Result<Arc<ClientConfig>, DialError> {
    if let Some(TlsParams::Ordinary(base)) = &cfg.tls_params {
        let mut config = ClientConfig::clone(base);
        if !cfg.alpn.is_empty() {
            config.alpn_protocols = alpn_bytes(&cfg.alpn);
        }
        return Ok(Arc::new(config));
    }

    let versions = protocol_versions(cfg.min_tls_version, cfg.max_tls_version)?;
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_protocol_versions(&versions)
            .map_err(|e| DialError::InvalidTlsParams(e.to_string()))?;

    let builder = if cfg.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    };

    let mut config = match certs.resolver_for(server_name) {
        Some(resolver) => builder.with_client_cert_resolver(resolver),
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn_bytes(&cfg.alpn);
    Ok(Arc::new(config))
}

/// proxy_client_config is the TLS configuration towards an https proxy itself
pub(crate) fn proxy_client_config(insecure_skip_verify: bool) -> Result<Arc<ClientConfig>, rustls::Error> {
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?;
    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// gm_config builds the GM-TLS parameters for one GM attempt
pub(crate) fn gm_config(cfg: &DialConfig, server_name: &str, strategy: TlsStrategy) -> GmTlsConfig {
    let mut config = match &cfg.tls_params {
        Some(TlsParams::Gm(base)) => base.clone(),
        _ => GmTlsConfig {
            insecure_skip_verify: cfg.insecure_skip_verify,
            ..Default::default()
        },
    };
    if config.server_name.is_empty() {
        config.server_name = server_name.to_string();
    }
    if !cfg.alpn.is_empty() {
        config.alpn = cfg.alpn.clone();
    }
    config.for_strategy(strategy)
}

/// upgrade performs one strategy's handshake under `timeout`
///
/// The stream is consumed. On failure it is dropped, which closes the socket.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn upgrade(
    stream: IoStream,
    strategy: TlsStrategy,
    cfg: &DialConfig,
    host: &str,
    target: &str,
    certs: &ClientCertStore,
    gm: Option<&dyn GmTlsConnector>,
    timeout: Duration,
) -> Result<Upgraded, DialError> {
    let server_name = server_name_for(cfg, host);
    let handshake_failed = |reason: String| DialError::Handshake {
        target: target.to_string(),
        strategy,
        reason,
    };

    match strategy {
        TlsStrategy::Ordinary => {
            let config = ordinary_config(cfg, &server_name, certs)?;
            let name = ServerName::try_from(server_name.clone()).map_err(|e| {
                DialError::InvalidTlsParams(format!("server name {server_name:?}: {e}"))
            })?;
            debug!(addr = %target, sni = %server_name, "starting ordinary tls handshake");
            let connector = TlsConnector::from(config);
            match tokio::time::timeout(timeout, connector.connect(name, stream)).await {
                Ok(Ok(tls)) => {
                    let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                    let stream: IoStream = Box::new(tls);
                    Ok((stream, alpn))
                }
                Ok(Err(e)) => Err(handshake_failed(e.to_string())),
                Err(_) => Err(handshake_failed(format!(
                    "handshake timed out after {timeout:?}"
                ))),
            }
        }
        TlsStrategy::GmWithSupport | TlsStrategy::GmWithoutSupport => {
            let connector = gm.ok_or(DialError::GmUnavailable)?;
            let config = gm_config(cfg, &server_name, strategy);
            debug!(addr = %target, sni = %server_name, gm_support = config.gm_support, "starting gm tls handshake");
            match tokio::time::timeout(timeout, connector.handshake(stream, config)).await {
                Ok(Ok(upgraded)) => Ok(upgraded),
                Ok(Err(e)) => Err(handshake_failed(e.to_string())),
                Err(_) => Err(handshake_failed(format!(
                    "handshake timed out after {timeout:?}"
                ))),
            }
        }
    }
}

fn protocol_versions(
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Result<Vec<&'static SupportedProtocolVersion>, DialError> {
    let min = min.unwrap_or(TlsVersion::Tls12);
    let max = max.unwrap_or(TlsVersion::Tls13);
    if min > max {
        return Err(DialError::InvalidTlsParams(format!(
            "minimum version {min:?} is above maximum {max:?}"
        )));
    }
    Ok([TlsVersion::Tls12, TlsVersion::Tls13]
        .into_iter()
        .filter(|v| (min..=max).contains(v))
        .map(TlsVersion::protocol)
        .collect())
}

fn alpn_bytes(alpn: &[String]) -> Vec<Vec<u8>> {
    alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}
