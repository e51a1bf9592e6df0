// Wire constants for the SOCKS4, SOCKS4A and SOCKS5 client handshakes
//
// SOCKS5 greeting
// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
//
// SOCKS4 request
// +----+----+----+----+----+----+----+----+----+----+....+----+
// | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
// +----+----+----+----+----+----+----+----+----+----+....+----+
// | 1  | 1  |    2    |         4         | variable     | 1  |
// +----+----+----+----+----+----+----+----+----+----+....+----+

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version of the username/password subnegotiation (RFC 1929)
pub const USERPASS_VERSION: u8 = 0x01;

/// DSTIP used by SOCKS4A to announce that a hostname follows
pub const SOCKS4A_SENTINEL: [u8; 4] = [0, 0, 0, 1];

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS4 = 0x04,
    SOCKS5 = 0x05,
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// AuthMethod represents the SOCKS5 authentication methods the client offers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// Command represents SOCKS protocol commands; the client only issues CONNECT
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
}

/// ReplyCode is the REP field of a SOCKS5 reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyCode::Succeeded),
            0x01 => Some(ReplyCode::ServerFailure),
            0x02 => Some(ReplyCode::ConnectionNotAllowed),
            0x03 => Some(ReplyCode::NetworkUnreachable),
            0x04 => Some(ReplyCode::HostUnreachable),
            0x05 => Some(ReplyCode::ConnectionRefused),
            0x06 => Some(ReplyCode::TtlExpired),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddrTypeUnsupported),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::ServerFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddrTypeUnsupported => "address type not supported",
        }
    }
}

/// Socks4Reply is the CD field of a SOCKS4 reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Socks4Reply {
    Granted = 90,
    Rejected = 91,
    IdentdUnreachable = 92,
    IdentdMismatch = 93,
}

impl Socks4Reply {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            90 => Some(Socks4Reply::Granted),
            91 => Some(Socks4Reply::Rejected),
            92 => Some(Socks4Reply::IdentdUnreachable),
            93 => Some(Socks4Reply::IdentdMismatch),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Socks4Reply::Granted => "request granted",
            Socks4Reply::Rejected => "request rejected or failed",
            Socks4Reply::IdentdUnreachable => "request rejected: server cannot reach client identd",
            Socks4Reply::IdentdMismatch => "request rejected: client identd reported a different user-id",
        }
    }
}
