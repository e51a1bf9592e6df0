use crate::error::ProxyError;
use crate::proxy::UserPass;
use crate::socks::protocol::{AuthMethod, USERPASS_VERSION, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// negotiate_auth runs the SOCKS5 method negotiation and, when the proxy picks
/// username/password, the RFC 1929 subnegotiation
///
/// When credentials were offered and the proxy answers "no acceptable
/// method", the greeting is sent once more offering only no-auth. A second
/// refusal is final.
pub async fn negotiate_auth<S>(
    stream: &mut S,
    auth: Option<&UserPass>,
) -> Result<AuthMethod, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = match auth {
        Some(_) => AuthMethod::UserPass,
        None => AuthMethod::NoAuth,
    };

    let selected = match send_greeting(stream, offered).await? {
        AuthMethod::NoAcceptable if offered == AuthMethod::UserPass => {
            warn!("socks5 proxy refused username/password auth, retrying once without credentials");
            match send_greeting(stream, AuthMethod::NoAuth).await? {
                AuthMethod::NoAcceptable => return Err(ProxyError::AuthFailed),
                method => method,
            }
        }
        AuthMethod::NoAcceptable => {
            return Err(ProxyError::protocol(
                "socks5",
                "no acceptable authentication method",
            ));
        }
        method => method,
    };

    if selected == AuthMethod::UserPass {
        // selection of a method we did not offer is a protocol violation
        let auth = auth.ok_or_else(|| {
            ProxyError::protocol("socks5", "proxy selected username/password without an offer")
        })?;
        send_userpass(stream, auth).await?;
    }

    debug!("socks5 auth negotiated: {:?}", selected);
    Ok(selected)
}

/// send_greeting offers a single method and returns the proxy's selection
async fn send_greeting<S>(stream: &mut S, method: AuthMethod) -> Result<AuthMethod, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[Version::SOCKS5 as u8, 1, method as u8])
        .await
        .map_err(ProxyError::io("send socks5 greeting"))?;

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(ProxyError::io("read socks5 method selection"))?;

    if reply[0] != Version::SOCKS5 as u8 {
        return Err(ProxyError::protocol(
            "socks5",
            format!("method selection version {:#04x}", reply[0]),
        ));
    }

    match reply[1] {
        m if m == AuthMethod::NoAuth as u8 => Ok(AuthMethod::NoAuth),
        m if m == AuthMethod::UserPass as u8 => Ok(AuthMethod::UserPass),
        m if m == AuthMethod::NoAcceptable as u8 => Ok(AuthMethod::NoAcceptable),
        m => Err(ProxyError::protocol(
            "socks5",
            format!("unsupported method {m:#04x} selected"),
        )),
    }
}

/// send_userpass performs the username/password subnegotiation
async fn send_userpass<S>(stream: &mut S, auth: &UserPass) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    let ulen = u8::try_from(user.len())
        .map_err(|_| ProxyError::Encode("socks5 username longer than 255 bytes".into()))?;
    let plen = u8::try_from(pass.len())
        .map_err(|_| ProxyError::Encode("socks5 password longer than 255 bytes".into()))?;

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(USERPASS_VERSION);
    req.push(ulen);
    req.extend_from_slice(user);
    req.push(plen);
    req.extend_from_slice(pass);

    stream
        .write_all(&req)
        .await
        .map_err(ProxyError::io("send socks5 credentials"))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(ProxyError::io("read socks5 auth status"))?;

    if reply[1] != 0x00 {
        return Err(ProxyError::AuthFailed);
    }
    Ok(())
}
