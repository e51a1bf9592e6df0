//! Outbound connection dialer
//!
//! Turns a `host:port` target into a live, optionally proxied, optionally
//! encrypted byte stream.
//!
//! - Direct or proxied routing: HTTP CONNECT, HTTPS CONNECT, SOCKS4, SOCKS4A
//!   and SOCKS5, each with optional credentials
//! - Proxy failures never degrade to a direct connection
//! - TLS across two cipher families: ordinary TLS through rustls and GM-TLS
//!   through a pluggable `GmTlsConnector`, one fresh socket per strategy
//! - Timeout and refusal retries with jittered exponential backoff
//! - Address deny-lists checked before any connection attempt
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use dialx::{DialOption, dial_x};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = dial_x(
//!         "example.com:443",
//!         &[
//!             DialOption::Tls(true),
//!             DialOption::Proxy(vec!["socks5://127.0.0.1:1080".into()]),
//!             DialOption::Timeout(Duration::from_secs(5)),
//!         ],
//!     )
//!     .await?;
//!     println!("connected via {:?} using {:?}", conn.proxy(), conn.tls_strategy());
//!     Ok(())
//! }
//! ```

// per-attempt events, raised to info by the per-call debug flag
macro_rules! attempt_event {
    ($cfg:expr, $($arg:tt)+) => {
        if $cfg.debug {
            ::tracing::info!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}

pub mod backoff;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod filter;
pub mod friendly;
pub mod http_connect;
pub mod proxy;
pub mod rate;
pub mod resolver;
pub mod socks;
mod tcp;
pub mod tls;

pub use backoff::jitter_backoff;
pub use config::{DefaultProfile, DialConfig, DialOption, DialTrace, DialTraceInfo, RetryPolicy};
pub use conn::{Connection, IoStream};
pub use dialer::{
    Dialer, dial_tcp_timeout, dial_tcp_timeout_force_proxy, dial_tls_timeout, dial_x, proxy_check,
};
pub use error::{DialError, ProxyError, ProxyFailure, TlsFailureReport};
pub use filter::AddressFilter;
pub use friendly::{FailureKind, FriendlyError};
pub use proxy::{ProxyCredential, ProxyScheme, fix_proxy, proxy_from_env};
pub use rate::rate_cps;
pub use resolver::{DnsOptions, Resolver, SystemResolver};
pub use tls::{
    ClientCertStore, GmFlags, GmTlsConfig, GmTlsConnector, TlsParams, TlsStrategy, TlsVersion,
};
