use crate::error::ProxyError;
use crate::proxy::UserPass;
use crate::socks::address::{TargetAddr, read_bound_address};
use crate::socks::auth::negotiate_auth;
use crate::socks::protocol::{
    Command, RSV, ReplyCode, SOCKS4A_SENTINEL, Socks4Reply, Version,
};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// socks5_connect runs the full SOCKS5 client handshake over an established
/// proxy connection and returns the proxy's bound address
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<&UserPass>,
) -> Result<String, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_auth(stream, auth).await?;

    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut request = vec![Version::SOCKS5 as u8, Command::Connect as u8, RSV];
    TargetAddr::from_host(host).encode(port, &mut request)?;

    stream
        .write_all(&request)
        .await
        .map_err(ProxyError::io("send socks5 connect request"))?;

    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(ProxyError::io("read socks5 connect reply"))?;

    if head[0] != Version::SOCKS5 as u8 {
        return Err(ProxyError::protocol(
            "socks5",
            format!("reply version {:#04x}", head[0]),
        ));
    }

    if head[1] != ReplyCode::Succeeded as u8 {
        let reason = ReplyCode::from_byte(head[1])
            .map(|code| code.describe().to_string())
            .unwrap_or_else(|| format!("unknown reply code {:#04x}", head[1]));
        return Err(ProxyError::Socks5Rejected(reason));
    }

    let bound = read_bound_address(stream, head[3]).await?;
    debug!("socks5 tunnel to {}:{} bound at {}", host, port, bound);
    Ok(bound)
}

/// socks4_connect sends a SOCKS4 CONNECT for an already resolved IPv4 address
pub async fn socks4_connect<S>(
    stream: &mut S,
    ip: Ipv4Addr,
    port: u16,
    user_id: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = socks4_request(ip.octets(), port, user_id, None)?;
    socks4_exchange(stream, &request).await
}

/// socks4a_connect sends a SOCKS4A CONNECT, letting the proxy resolve `host`
///
/// An IPv4 literal is sent as plain SOCKS4.
pub async fn socks4a_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    user_id: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match host.parse::<Ipv4Addr>() {
        Ok(ip) => socks4_request(ip.octets(), port, user_id, None)?,
        Err(_) => socks4_request(SOCKS4A_SENTINEL, port, user_id, Some(host))?,
    };
    socks4_exchange(stream, &request).await
}

/// socks4_request frames VN, CD, DSTPORT, DSTIP, USERID and NULL, plus the
/// SOCKS4A hostname and its NULL when one is given
pub fn socks4_request(
    ip: [u8; 4],
    port: u16,
    user_id: &str,
    hostname: Option<&str>,
) -> Result<Vec<u8>, ProxyError> {
    if user_id.as_bytes().contains(&0) || hostname.is_some_and(|h| h.as_bytes().contains(&0)) {
        return Err(ProxyError::Encode("socks4 field containing a NUL byte".into()));
    }

    let mut request = Vec::with_capacity(9 + user_id.len() + hostname.map_or(0, |h| h.len() + 1));
    request.push(Version::SOCKS4 as u8);
    request.push(Command::Connect as u8);
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip);
    request.extend_from_slice(user_id.as_bytes());
    request.push(0x00);

    if let Some(host) = hostname {
        request.extend_from_slice(host.as_bytes());
        request.push(0x00);
    }
    Ok(request)
}

async fn socks4_exchange<S>(stream: &mut S, request: &[u8]) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(request)
        .await
        .map_err(ProxyError::io("send socks4 request"))?;

    // +----+----+----+----+----+----+----+----+
    // | VN | CD | DSTPORT |      DSTIP        |
    // +----+----+----+----+----+----+----+----+
    // | 1  | 1  |    2    |         4         |
    // +----+----+----+----+----+----+----+----+
    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(ProxyError::io("read socks4 reply"))?;

    match Socks4Reply::from_byte(reply[1]) {
        Some(Socks4Reply::Granted) => Ok(()),
        Some(rejected) => Err(ProxyError::Socks4Rejected(rejected.describe())),
        None => Err(ProxyError::Socks4Rejected("unknown error")),
    }
}
