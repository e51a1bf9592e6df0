use anyhow::{Context, Result, bail};
use clap::Parser;
use dialx::{DialOption, Dialer};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dial a host:port directly or through proxies, optionally over TLS", long_about = None)]
struct Args {
    /// Target address (host:port)
    target: Option<String>,

    /// Proxy URI, may be repeated (http, https, socks4, socks4a, socks5)
    #[arg(short, long)]
    proxy: Vec<String>,

    /// Fail instead of dialing directly when no proxy is configured
    #[arg(long)]
    force_proxy: bool,

    /// Use the proxy named by HTTPS_PROXY/HTTP_PROXY/ALL_PROXY when none is given
    #[arg(long)]
    env_proxy: bool,

    /// Upgrade the connection to TLS
    #[arg(long)]
    tls: bool,

    /// Only try GM (SM2/SM3/SM4) TLS
    #[arg(long, conflicts_with = "gm_prefer")]
    gm_only: bool,

    /// Try GM TLS before ordinary TLS
    #[arg(long)]
    gm_prefer: bool,

    /// Never try GM TLS
    #[arg(long, conflicts_with_all = ["gm_only", "gm_prefer"])]
    no_gm: bool,

    /// TLS server name override
    #[arg(long)]
    sni: Option<String>,

    /// ALPN protocol, may be repeated
    #[arg(long)]
    alpn: Vec<String>,

    /// Verify the server certificate
    #[arg(long)]
    verify: bool,

    /// Retry timed-out and refused connects
    #[arg(long)]
    retry: bool,

    /// Connect and handshake timeout in seconds
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Only check that this proxy answers its handshake
    #[arg(long, value_name = "URI")]
    check_proxy: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let timeout = Duration::from_secs(args.timeout);
    let dialer = Dialer::new();

    if let Some(uri) = &args.check_proxy {
        let conn = dialer
            .proxy_check(uri, timeout)
            .await
            .with_context(|| format!("proxy check failed for {}", dialx::fix_proxy(uri)))?;
        info!("proxy {} is alive", conn.proxy().unwrap_or(uri));
        return Ok(());
    }

    let Some(target) = args.target.as_deref() else {
        bail!("[ERR] a target is required unless --check-proxy is given");
    };

    let mut opts = vec![
        DialOption::Timeout(timeout),
        DialOption::TlsTimeout(timeout),
        DialOption::Proxy(args.proxy.clone()),
        DialOption::ForceProxy(args.force_proxy),
        DialOption::SystemProxyFromEnv(args.env_proxy),
        DialOption::Tls(args.tls),
        DialOption::GmOnly(args.gm_only),
        DialOption::GmPrefer(args.gm_prefer),
        DialOption::GmSupport(!args.no_gm),
        DialOption::Alpn(args.alpn.clone()),
        DialOption::InsecureSkipVerify(!args.verify),
        DialOption::TimeoutRetry(args.retry),
        DialOption::Debug(args.verbose),
    ];
    if let Some(sni) = &args.sni {
        opts.push(DialOption::Sni(sni.clone()));
    }

    let conn = dialer.dial(target, &opts).await.map_err(|e| {
        // the aggregated error carries the full diagnostic report
        anyhow::anyhow!("{e}")
    })?;

    info!("connected to {}", conn.target());
    if let Some(proxy) = conn.proxy() {
        info!("via proxy {}", proxy);
    }
    if let Some(strategy) = conn.tls_strategy() {
        info!("tls strategy {}", strategy);
    }
    if let Some(alpn) = conn.negotiated_alpn() {
        info!("alpn {}", String::from_utf8_lossy(alpn));
    }
    Ok(())
}
