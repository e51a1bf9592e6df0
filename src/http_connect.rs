//! HTTP CONNECT tunnel handshake (RFC 9110 §9.3.6)

use crate::error::ProxyError;
use crate::proxy::UserPass;
use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// User-Agent sent with every CONNECT request
pub const CONNECT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Upper bound for a single status or header line
const MAX_LINE: usize = 8 * 1024;

/// Upper bound for the number of response headers
const MAX_HEADERS: usize = 128;

/// build_connect_request renders the CONNECT request for `target` (`host:port`)
pub fn build_connect_request(target: &str, auth: Option<&UserPass>) -> String {
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\n\
         Host: {target}\r\n\
         User-Agent: {CONNECT_USER_AGENT}\r\n"
    );
    if let Some(auth) = auth {
        let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// http_connect asks the proxy on `stream` for a tunnel to `target`
///
/// Any status in `[200, 400)` opens the tunnel. The response is read byte by
/// byte so nothing past the blank line is taken from the tunnel.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &str,
    auth: Option<&UserPass>,
) -> Result<u16, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_connect_request(target, auth);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ProxyError::io("send connect request"))?;
    stream
        .flush()
        .await
        .map_err(ProxyError::io("flush connect request"))?;

    let status_line = read_line(stream).await?;
    let code = parse_status_code(&status_line)?;
    debug!("http proxy answered {} for CONNECT {}", code, target);

    if code == 407 {
        warn!("http proxy requires authentication (407)");
        return Err(ProxyError::AuthFailed);
    }
    if !(200..400).contains(&code) {
        return Err(ProxyError::HttpStatus {
            code,
            status_line,
        });
    }

    let mut headers = 0;
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(ProxyError::protocol("http connect", "too many response headers"));
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value.trim().parse::<u64>().map_err(|_| {
                ProxyError::protocol("http connect", format!("bad content-length {value:?}"))
            })?;
            if len != 0 {
                return Err(ProxyError::ResponseBody(len));
            }
        }
    }

    Ok(code)
}

/// parse_status_code pulls the code out of `HTTP/1.x CODE reason`
pub fn parse_status_code(status_line: &str) -> Result<u16, ProxyError> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::protocol(
            "http connect",
            format!("bad status line {status_line:?}"),
        ));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            ProxyError::protocol("http connect", format!("bad status line {status_line:?}"))
        })
}

/// read_line reads one CRLF (or LF) terminated line without buffering ahead
async fn read_line<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(ProxyError::io("read connect response"))?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_LINE {
            return Err(ProxyError::protocol("http connect", "response line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
