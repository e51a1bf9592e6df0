//! SOCKS4, SOCKS4A and SOCKS5 client handshakes
//!
//! - [SOCKS4](https://www.openssh.com/txt/socks4.protocol)
//! - [SOCKS4A](https://www.openssh.com/txt/socks4a.protocol)
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! Every function runs over a caller-supplied, already connected stream and
//! leaves closing it to the caller. Any failure is final for that proxy.

pub mod address;
pub mod auth;
pub mod client;
pub mod protocol;

pub use client::{socks4_connect, socks4a_connect, socks5_connect};
