use crate::error::ProxyError;
use crate::socks::protocol::AddressType;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is a SOCKS5 destination: an IP literal is sent as such, anything
/// else goes to the proxy as a domain name
#[derive(Debug, Clone, PartialEq)]
pub enum TargetAddr {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

impl TargetAddr {
    /// from_host picks the address type by inspecting the host
    pub fn from_host(host: &str) -> Self {
        match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => TargetAddr::IPv4(v4),
            Ok(IpAddr::V6(v6)) => TargetAddr::IPv6(v6),
            Err(_) => TargetAddr::DomainName(host.to_string()),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            TargetAddr::IPv4(_) => AddressType::IPv4,
            TargetAddr::DomainName(_) => AddressType::DomainName,
            TargetAddr::IPv6(_) => AddressType::IPv6,
        }
    }

    /// encode appends ATYP, DST.ADDR and DST.PORT
    pub fn encode(&self, port: u16, buf: &mut Vec<u8>) -> Result<(), ProxyError> {
        buf.push(self.address_type() as u8);
        match self {
            TargetAddr::IPv4(v4) => buf.extend_from_slice(&v4.octets()),
            TargetAddr::IPv6(v6) => buf.extend_from_slice(&v6.octets()),
            TargetAddr::DomainName(name) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = u8::try_from(name.len())
                    .ok()
                    .filter(|len| *len > 0)
                    .ok_or_else(|| {
                        ProxyError::Encode(format!("socks5 domain name of {} bytes", name.len()))
                    })?;
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }
}

/// read_bound_address consumes BND.ADDR and BND.PORT from a SOCKS5 reply
/// whose ATYP byte was already read, returning them as `host:port`
pub async fn read_bound_address<S>(stream: &mut S, atyp: u8) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let io = ProxyError::io("read socks5 bound address");

    let host = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(io)?;
            Ipv4Addr::from(addr).to_string()
        }
        Some(AddressType::DomainName) => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(ProxyError::io("read socks5 bound address"))?;

            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await.map_err(io)?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        Some(AddressType::IPv6) => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await.map_err(io)?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        None => {
            return Err(ProxyError::protocol(
                "socks5",
                format!("unknown bound address type {atyp:#04x}"),
            ));
        }
    };

    //Read port
    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .await
        .map_err(ProxyError::io("read socks5 bound port"))?;
    let port = u16::from_be_bytes(port_buf);

    Ok(format!("{host}:{port}"))
}
