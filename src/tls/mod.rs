//! TLS and GM-TLS upgrade engine

pub mod certs;
pub mod gm;
pub mod strategy;
pub mod upgrade;
pub mod verify;

pub use certs::ClientCertStore;
pub use gm::{GmTlsConfig, GmTlsConnector};
pub use strategy::{GmFlags, TlsStrategy, select_strategies};
pub use upgrade::{TlsParams, TlsVersion};
