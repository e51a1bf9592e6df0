//! Loopback servers shared by the integration tests
#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use dialx::{DnsOptions, GmTlsConfig, GmTlsConnector, IoStream, Resolver};
use parking_lot::Mutex;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio_rustls::TlsAcceptor;

pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Counter is a shared atomic counter
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// spawn_echo starts a TCP echo server and counts accepted connections
pub async fn spawn_echo() -> Result<(SocketAddr, Counter)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepts = Counter::default();
    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.incr();
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    Ok((addr, accepts))
}

/// spawn_closer accepts connections and drops them straight away
pub async fn spawn_closer() -> Result<(SocketAddr, Counter)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepts = Counter::default();
    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.incr();
            drop(stream);
        }
    });
    Ok((addr, accepts))
}

/// Blackhole is a listener that never accepts and whose queue is full
pub struct Blackhole {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

/// spawn_blackhole returns an address whose SYNs are dropped, so connects hang
pub async fn spawn_blackhole() -> Result<Blackhole> {
    let socket = TcpSocket::new_v4()?;
    socket.bind("127.0.0.1:0".parse()?)?;
    let listener = socket.listen(1)?;
    let addr = listener.local_addr()?;
    let mut queued = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            Ok(Err(e)) => return Err(e.into()),
            // the accept queue is full
            Err(_) => break,
        }
    }
    Ok(Blackhole {
        addr,
        _listener: listener,
        _queued: queued,
    })
}

/// echo_roundtrip writes `msg` and expects it back
pub async fn echo_roundtrip<S>(stream: &mut S, msg: &[u8]) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(msg).await?;
    stream.flush().await?;
    let mut buf = vec![0u8; msg.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await??;
    if buf != msg {
        bail!("echo mismatch: {:?}", String::from_utf8_lossy(&buf));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SOCKS5
// ---------------------------------------------------------------------------

/// Socks5Mode selects how the mock answers method negotiation
#[derive(Debug, Clone)]
pub enum Socks5Mode {
    /// Accept no-auth only
    Open,
    /// Require these credentials
    UserPass { username: String, password: String },
    /// Answer "no acceptable method" to username/password, accept no-auth
    RefuseUserPass,
    /// Answer "no acceptable method" to everything
    RefuseAll,
}

/// Socks5Request is what the mock saw in a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub atyp: u8,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MockLog<T> {
    pub accepts: Counter,
    pub greetings: Counter,
    pub requests: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for MockLog<T> {
    fn default() -> Self {
        Self {
            accepts: Counter::default(),
            greetings: Counter::default(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> MockLog<T> {
    pub fn requests(&self) -> Vec<T> {
        self.requests.lock().clone()
    }
}

/// spawn_socks5 starts a SOCKS5 proxy speaking the server side of RFC 1928/1929
pub async fn spawn_socks5(mode: Socks5Mode) -> Result<(SocketAddr, MockLog<Socks5Request>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let log = MockLog::<Socks5Request>::default();
    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_log.accepts.incr();
            let (mode, log) = (mode.clone(), server_log.clone());
            tokio::spawn(async move {
                let _ = handle_socks5(stream, mode, log).await;
            });
        }
    });
    Ok((addr, log))
}

async fn handle_socks5(
    mut stream: TcpStream,
    mode: Socks5Mode,
    log: MockLog<Socks5Request>,
) -> Result<()> {
    // ClientHello
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let selected = loop {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != 5 {
            bail!("not socks5");
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;
        log.greetings.incr();

        let choice = match &mode {
            Socks5Mode::Open | Socks5Mode::RefuseUserPass if methods.contains(&0) => 0x00,
            Socks5Mode::UserPass { .. } if methods.contains(&2) => 0x02,
            _ => 0xFF,
        };
        stream.write_all(&[5, choice]).await?;
        if choice != 0xFF {
            break choice;
        }
    };

    if selected == 0x02 {
        let mut ver_ulen = [0u8; 2];
        stream.read_exact(&mut ver_ulen).await?;
        let mut user = vec![0u8; ver_ulen[1] as usize];
        stream.read_exact(&mut user).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut pass = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut pass).await?;

        let ok = matches!(&mode, Socks5Mode::UserPass { username, password }
            if username.as_bytes() == user.as_slice() && password.as_bytes() == pass.as_slice());
        stream.write_all(&[1, if ok { 0 } else { 1 }]).await?;
        if !ok {
            return Ok(());
        }
    }

    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let host = match head[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)?
        }
        4 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => bail!("bad atyp {other}"),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);
    log.requests.lock().push(Socks5Request {
        atyp: head[3],
        host: host.clone(),
        port,
    });

    let outbound = match connect_host(&host, port).await {
        Ok(outbound) => outbound,
        Err(_) => {
            // connection refused
            stream.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };
    stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    relay(stream, outbound).await
}

// ---------------------------------------------------------------------------
// SOCKS4 / SOCKS4A
// ---------------------------------------------------------------------------

/// Socks4Request is what the mock saw: destination IP, user id and 4A hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub user_id: String,
    pub hostname: Option<String>,
}

/// spawn_socks4 starts a SOCKS4/4A proxy; with `grant == false` it answers 91
pub async fn spawn_socks4(grant: bool) -> Result<(SocketAddr, MockLog<Socks4Request>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let log = MockLog::<Socks4Request>::default();
    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_log.accepts.incr();
            let log = server_log.clone();
            tokio::spawn(async move {
                let _ = handle_socks4(stream, grant, log).await;
            });
        }
    });
    Ok((addr, log))
}

async fn read_cstring(stream: &mut TcpStream) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            return Ok(String::from_utf8(out)?);
        }
        out.push(b);
    }
}

async fn handle_socks4(mut stream: TcpStream, grant: bool, log: MockLog<Socks4Request>) -> Result<()> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    if head[0] != 4 || head[1] != 1 {
        bail!("not a socks4 connect");
    }
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);
    let user_id = read_cstring(&mut stream).await?;
    let is_4a = head[4..7] == [0, 0, 0] && head[7] != 0;
    let hostname = if is_4a {
        Some(read_cstring(&mut stream).await?)
    } else {
        None
    };
    log.greetings.incr();
    log.requests.lock().push(Socks4Request {
        ip,
        port,
        user_id,
        hostname: hostname.clone(),
    });

    let host = hostname.unwrap_or_else(|| ip.to_string());
    let outbound = if grant { connect_host(&host, port).await.ok() } else { None };
    let Some(outbound) = outbound else {
        stream.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    };
    stream.write_all(&[0, 90, 0, 0, 0, 0, 0, 0]).await?;
    relay(stream, outbound).await
}

// ---------------------------------------------------------------------------
// HTTP CONNECT
// ---------------------------------------------------------------------------

/// HttpMode selects the mock proxy's answer to CONNECT
#[derive(Debug, Clone)]
pub enum HttpMode {
    Tunnel,
    Status(u16),
    /// Answer 200 but announce a body
    BodyOnConnect(u64),
}

/// spawn_http_proxy starts an HTTP CONNECT proxy and records request heads
pub async fn spawn_http_proxy(mode: HttpMode) -> Result<(SocketAddr, MockLog<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let log = MockLog::<String>::default();
    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_log.accepts.incr();
            let (mode, log) = (mode.clone(), server_log.clone());
            tokio::spawn(async move {
                let _ = handle_http(stream, mode, log).await;
            });
        }
    });
    Ok((addr, log))
}

/// spawn_https_proxy is `spawn_http_proxy` behind a TLS listener
pub async fn spawn_https_proxy(
    config: ServerConfig,
    mode: HttpMode,
) -> Result<(SocketAddr, MockLog<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let log = MockLog::<String>::default();
    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_log.accepts.incr();
            let (acceptor, mode, log) = (acceptor.clone(), mode.clone(), server_log.clone());
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let _ = handle_http(tls, mode, log).await;
                }
            });
        }
    });
    Ok((addr, log))
}

async fn handle_http<S>(mut stream: S, mode: HttpMode, log: MockLog<String>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await?);
    }
    let head = String::from_utf8(head)?;
    log.greetings.incr();
    log.requests.lock().push(head.clone());

    match mode {
        HttpMode::Status(code) => {
            let reply = format!("HTTP/1.1 {code} Mock\r\nContent-Length: 0\r\n\r\n");
            stream.write_all(reply.as_bytes()).await?;
            Ok(())
        }
        HttpMode::BodyOnConnect(len) => {
            let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\n\r\n");
            stream.write_all(reply.as_bytes()).await?;
            stream.write_all(&vec![b'x'; len as usize]).await?;
            Ok(())
        }
        HttpMode::Tunnel => {
            let target = head
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or_default()
                .to_string();
            let Some((host, port)) = target.rsplit_once(':') else {
                bail!("bad connect target {target}");
            };
            let outbound = connect_host(host.trim_matches(['[', ']']), port.parse()?).await?;
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            relay(stream, outbound).await
        }
    }
}

async fn connect_host(host: &str, port: u16) -> Result<TcpStream> {
    // localhost may resolve to ::1 first while the echo server is IPv4 only
    let mut last_err = None;
    for addr in lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e.into()),
        None => bail!("cannot resolve {host}"),
    }
}

async fn relay<S>(mut inbound: S, mut outbound: TcpStream) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// TlsServer is a self-signed TLS echo server for `localhost`
pub struct TlsServer {
    pub addr: SocketAddr,
    /// Plain TCP accepts, one per dial attempt
    pub accepts: Counter,
    /// Completed handshakes
    pub handshakes: Counter,
}

pub fn self_signed_server_config(alpn: &[&str]) -> Result<ServerConfig> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

pub async fn spawn_tls_server(config: ServerConfig) -> Result<TlsServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let accepts = Counter::default();
    let handshakes = Counter::default();
    let (a, h) = (accepts.clone(), handshakes.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            a.incr();
            let (acceptor, h) = (acceptor.clone(), h.clone());
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    h.incr();
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tls.read(&mut buf).await {
                        if n == 0 || tls.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = tls.flush().await;
                    }
                }
            });
        }
    });
    Ok(TlsServer {
        addr,
        accepts,
        handshakes,
    })
}

/// MutualTls is a CA plus a client certificate it issued
pub struct MutualTls {
    pub server_config: ServerConfig,
    pub client_chain: Vec<CertificateDer<'static>>,
    pub client_key: PrivateKeyDer<'static>,
}

/// mutual_tls builds a server that requires a client certificate from a test CA
pub fn mutual_tls() -> Result<MutualTls> {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "dialx test ca");
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut client_params = CertificateParams::new(vec!["client.test".to_string()])?;
    client_params
        .distinguished_name
        .push(DnType::CommonName, "dialx test client");
    let client_key = KeyPair::generate()?;
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_cert.der().clone())?;
    let verifier =
        rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()?;

    let server = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let server_key = PrivateKeyDer::Pkcs8(server.key_pair.serialize_der().into());
    let server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![server.cert.der().clone()], server_key)?;

    Ok(MutualTls {
        server_config,
        client_chain: vec![client_cert.der().clone()],
        client_key: PrivateKeyDer::Pkcs8(client_key.serialize_der().into()),
    })
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// CountingResolver answers from a fixed table and counts lookups
#[derive(Debug, Default)]
pub struct CountingResolver {
    pub table: HashMap<String, IpAddr>,
    pub lookups: Counter,
}

impl CountingResolver {
    pub fn with(entries: &[(&str, IpAddr)]) -> Arc<Self> {
        Arc::new(Self {
            table: entries
                .iter()
                .map(|(host, ip)| (host.to_string(), *ip))
                .collect(),
            lookups: Counter::default(),
        })
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn lookup_all(&self, host: &str, _opts: &DnsOptions) -> Vec<IpAddr> {
        self.lookups.incr();
        self.table.get(host).copied().into_iter().collect()
    }
}

/// FailingGm sends a fake GM hello and always reports a handshake failure
#[derive(Debug, Default)]
pub struct FailingGm {
    pub calls: Counter,
    pub gm_support: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl GmTlsConnector for FailingGm {
    async fn handshake(
        &self,
        mut stream: IoStream,
        config: GmTlsConfig,
    ) -> io::Result<(IoStream, Option<Vec<u8>>)> {
        self.calls.incr();
        self.gm_support.lock().push(config.gm_support);
        // record header with the GMSSL 1.1 version
        stream.write_all(&[0x16, 0x01, 0x01, 0x00, 0x04, 1, 0, 0, 0]).await?;
        let mut buf = [0u8; 64];
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
        Err(io::Error::other(
            "gm handshake failure: server does not speak sm2 cipher suites",
        ))
    }
}

/// PassthroughGm pretends the handshake succeeded and hands the stream back
#[derive(Debug, Default)]
pub struct PassthroughGm {
    pub calls: Counter,
}

#[async_trait]
impl GmTlsConnector for PassthroughGm {
    async fn handshake(
        &self,
        stream: IoStream,
        config: GmTlsConfig,
    ) -> io::Result<(IoStream, Option<Vec<u8>>)> {
        self.calls.incr();
        let alpn = config.alpn.first().map(|p| p.as_bytes().to_vec());
        Ok((stream, alpn))
    }
}
