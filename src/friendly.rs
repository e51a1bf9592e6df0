//! Friendly error classification
//!
//! Maps low-level failure text to a short description and remediation hints.
//! The result is advisory text attached to the aggregated TLS error. It
//! never changes control flow.

use crate::tls::TlsStrategy;

/// FailureKind is the coarse cause behind a failed dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Eof,
    PermissionDenied,
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    Dns,
    UnsupportedCurve,
    ProtocolVersion,
    Certificate,
    Handshake,
    NetworkUnreachable,
    NoRouteToHost,
    GmUnavailable,
    Unknown,
}

/// FriendlyError is the classifier's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendlyError {
    pub kind: FailureKind,
    pub description: &'static str,
    pub description_zh: &'static str,
    pub suggestions: Vec<&'static str>,
}

// checked in order; the first matching row wins
const PATTERNS: &[(FailureKind, &[&str])] = &[
    (FailureKind::GmUnavailable, &["gm tls runtime is not available"]),
    (FailureKind::NetworkUnreachable, &["network is unreachable", "network unreachable"]),
    (FailureKind::NoRouteToHost, &["no route to host", "host unreachable"]),
    (FailureKind::PermissionDenied, &["permission denied", "access is denied"]),
    (FailureKind::ConnectionReset, &["connection reset", "reset by peer", "broken pipe"]),
    (FailureKind::ConnectionRefused, &["connection refused", "actively refused"]),
    (FailureKind::Dns, &["cannot resolve", "no such host", "dns", "failed to lookup"]),
    (FailureKind::UnsupportedCurve, &["unsupported curve", "unsupportedcurve", "no supported curve", "nokeyshare"]),
    (
        FailureKind::ProtocolVersion,
        &["protocol version", "protocolversion", "peerincompatible", "unsupported version"],
    ),
    (
        FailureKind::Certificate,
        &["certificate", "x509", "unknownissuer", "unknown issuer", "notvalidforname"],
    ),
    (FailureKind::Timeout, &["timed out", "timeout", "deadline"]),
    (FailureKind::Eof, &["eof", "early end", "unexpected end"]),
    (
        FailureKind::Handshake,
        &["handshake failure", "handshakefailure", "handshake", "corrupt message", "invalidcontenttype"],
    ),
];

/// classify maps the raw failure text of a dial to a `FriendlyError`
///
/// `strategies` are the TLS strategies that were tried. They shape the
/// GM-specific suggestions and are empty for plain dials.
pub fn classify(raw: &str, strategies: &[TlsStrategy]) -> FriendlyError {
    let lower = raw.to_ascii_lowercase();
    let kind = PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map_or(FailureKind::Unknown, |(kind, _)| *kind);

    let (description, description_zh) = describe(kind);
    let mut suggestions = base_suggestions(kind);

    let tried_gm = strategies.iter().any(TlsStrategy::is_gm);
    let tried_ordinary = strategies.contains(&TlsStrategy::Ordinary);
    // no strategies means a plain dial, where TLS hints do not apply
    if !strategies.is_empty()
        && matches!(
            kind,
            FailureKind::Handshake
                | FailureKind::ProtocolVersion
                | FailureKind::UnsupportedCurve
                | FailureKind::Eof
                | FailureKind::ConnectionReset
        )
    {
        if tried_gm && !tried_ordinary {
            suggestions.push(
                "only GM (SM2/SM3/SM4) TLS was tried; the server may speak ordinary TLS only, disable GM-only mode",
            );
        } else if !tried_gm {
            suggestions.push(
                "the server may require GM (SM2/SM3/SM4) TLS; enable GM TLS support or GM-prefer mode",
            );
        }
    }

    FriendlyError {
        kind,
        description,
        description_zh,
        suggestions,
    }
}

fn describe(kind: FailureKind) -> (&'static str, &'static str) {
    match kind {
        FailureKind::Eof => (
            "the peer closed the connection unexpectedly",
            "对端意外关闭了连接",
        ),
        FailureKind::PermissionDenied => (
            "the operating system denied the connection",
            "操作系统拒绝了该连接",
        ),
        FailureKind::ConnectionReset => ("the connection was reset by the peer", "连接被对端重置"),
        FailureKind::ConnectionRefused => ("the connection was refused", "连接被拒绝"),
        FailureKind::Timeout => ("the operation timed out", "操作超时"),
        FailureKind::Dns => ("the host name could not be resolved", "域名解析失败"),
        FailureKind::UnsupportedCurve => (
            "no mutually supported key exchange curve",
            "双方没有共同支持的密钥交换曲线",
        ),
        FailureKind::ProtocolVersion => (
            "the TLS protocol versions do not match",
            "TLS 协议版本不匹配",
        ),
        FailureKind::Certificate => (
            "the server certificate was rejected",
            "服务器证书校验失败",
        ),
        FailureKind::Handshake => ("the TLS handshake failed", "TLS 握手失败"),
        FailureKind::NetworkUnreachable => ("the network is unreachable", "网络不可达"),
        FailureKind::NoRouteToHost => ("there is no route to the host", "没有到达主机的路由"),
        FailureKind::GmUnavailable => (
            "GM TLS was requested but no GM TLS runtime is available",
            "请求了国密 TLS，但没有可用的国密 TLS 实现",
        ),
        FailureKind::Unknown => ("the connection failed", "连接失败"),
    }
}

fn base_suggestions(kind: FailureKind) -> Vec<&'static str> {
    match kind {
        FailureKind::Eof | FailureKind::ConnectionReset => vec![
            "the server or a middlebox may dislike the TLS fingerprint; try a randomized TLS fingerprint",
            "check for proxy or VPN interference",
        ],
        FailureKind::PermissionDenied => vec![
            "check local firewall rules and process privileges",
        ],
        FailureKind::ConnectionRefused => vec![
            "check that the proxy or target address and port are correct",
            "check that the service is running and the port is not filtered",
        ],
        FailureKind::Timeout => vec![
            "raise the connect or TLS handshake timeout",
            "check that the port is open and not filtered",
            "check for proxy or VPN interference",
        ],
        FailureKind::Dns => vec![
            "check the host name",
            "try specific DNS servers",
        ],
        FailureKind::UnsupportedCurve | FailureKind::ProtocolVersion => vec![
            "adjust the minimum/maximum TLS version",
            "try a randomized TLS fingerprint",
        ],
        FailureKind::Certificate => vec![
            "enable insecure-skip-verify if the certificate is self-signed",
            "check the SNI override",
        ],
        FailureKind::Handshake => vec![
            "check the SNI override and ALPN list",
            "try a randomized TLS fingerprint",
        ],
        FailureKind::NetworkUnreachable | FailureKind::NoRouteToHost => vec![
            "check the local network and routing table",
            "check for proxy or VPN interference",
        ],
        FailureKind::GmUnavailable => vec![
            "register a GM TLS connector on the dialer",
            "disable GM-only mode",
        ],
        FailureKind::Unknown => Vec::new(),
    }
}
