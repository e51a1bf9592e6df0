//! GM-TLS (SM2/SM3/SM4) collaborator contract
//!
//! The national-cipher handshake is not implemented here. A runtime that
//! speaks it plugs in through `GmTlsConnector`; without one, GM strategies
//! fail with `DialError::GmUnavailable` and never touch the network.

use crate::conn::IoStream;
use crate::tls::TlsStrategy;
use async_trait::async_trait;
use std::io;

/// GmTlsConfig is what a GM-TLS runtime needs for one handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GmTlsConfig {
    pub server_name: String,
    /// Wire version numbers, e.g. `0x0101` for GMSSL 1.1
    pub min_version: Option<u16>,
    pub max_version: Option<u16>,
    pub insecure_skip_verify: bool,
    /// National-cipher negotiation on (gm-with-support) or off (gm-without-support)
    pub gm_support: bool,
    pub alpn: Vec<String>,
}

impl GmTlsConfig {
    /// for_strategy sets `gm_support` to match a GM strategy
    pub fn for_strategy(mut self, strategy: TlsStrategy) -> Self {
        self.gm_support = strategy == TlsStrategy::GmWithSupport;
        self
    }
}

/// GmTlsConnector performs a GM-TLS client handshake over an established stream
#[async_trait]
pub trait GmTlsConnector: Send + Sync {
    /// handshake returns the encrypted stream and the negotiated ALPN protocol
    async fn handshake(
        &self,
        stream: IoStream,
        config: GmTlsConfig,
    ) -> io::Result<(IoStream, Option<Vec<u8>>)>;
}
