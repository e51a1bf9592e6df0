//! Dial configuration
//!
//! A `DialConfig` is built fresh for every call by layering the compiled
//! defaults, the process-wide `DefaultProfile` and the per-call options, in
//! that order. Each call owns its copy.

use crate::filter::AddressFilter;
use crate::proxy::{ProxyCredential, proxy_from_env};
use crate::resolver::DnsOptions;
use crate::tls::{GmFlags, TlsParams, TlsStrategy, TlsVersion};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MIN_RETRY_WAIT: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(2);

/// RetryPolicy bounds the timeout and refusal retry loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry timed-out and refused connects at all
    pub enabled: bool,
    /// Retries per kind; timeouts and refusals are counted separately
    pub max_retries: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: DEFAULT_MAX_RETRIES,
            min_wait: DEFAULT_MIN_RETRY_WAIT,
            max_wait: DEFAULT_MAX_RETRY_WAIT,
        }
    }
}

/// DialConfig is the fully merged configuration of one dial call
#[derive(Debug, Clone)]
pub struct DialConfig {
    pub timeout: Duration,
    pub tls_timeout: Duration,
    /// Parent deadline; every child operation is capped to what is left of it
    pub deadline: Option<Instant>,
    pub proxies: Vec<String>,
    pub disable_proxy: bool,
    pub force_proxy: bool,
    pub system_proxy_from_env: bool,
    pub tls: bool,
    pub gm: GmFlags,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub tls_params: Option<TlsParams>,
    pub insecure_skip_verify: bool,
    pub min_tls_version: Option<TlsVersion>,
    pub max_tls_version: Option<TlsVersion>,
    pub retry: RetryPolicy,
    pub deny: AddressFilter,
    pub local_addr: Option<IpAddr>,
    pub strong_host: bool,
    pub keep_alive: Option<Duration>,
    /// Raise per-attempt events from debug to info
    pub debug: bool,
    pub dns: DnsOptions,
    pub trace: Option<Arc<DialTrace>>,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            tls_timeout: DEFAULT_TLS_TIMEOUT,
            deadline: None,
            proxies: Vec::new(),
            disable_proxy: false,
            force_proxy: false,
            system_proxy_from_env: false,
            tls: false,
            gm: GmFlags::default(),
            sni: None,
            alpn: Vec::new(),
            tls_params: None,
            insecure_skip_verify: true,
            min_tls_version: None,
            max_tls_version: None,
            retry: RetryPolicy::default(),
            deny: AddressFilter::default(),
            local_addr: None,
            strong_host: false,
            keep_alive: None,
            debug: false,
            dns: DnsOptions::default(),
            trace: None,
        }
    }
}

impl DialConfig {
    /// from_options applies `opts` on top of the compiled defaults
    pub fn from_options<'a, I>(opts: I) -> Self
    where
        I: IntoIterator<Item = &'a DialOption>,
    {
        let mut cfg = Self::default();
        for opt in opts {
            opt.clone().apply(&mut cfg);
        }
        cfg
    }

    /// effective_proxies is the ordered proxy list this call will use
    pub fn effective_proxies(&self) -> Vec<String> {
        if self.disable_proxy {
            return Vec::new();
        }
        let mut proxies: Vec<String> = self
            .proxies
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if proxies.is_empty() && self.system_proxy_from_env {
            let from_env = proxy_from_env();
            if !from_env.is_empty() {
                proxies.push(from_env);
            }
        }
        proxies
    }

    /// child_timeout caps `timeout` to the time left before the deadline
    ///
    /// Returns `None` once the deadline has passed.
    pub fn child_timeout(&self, timeout: Duration) -> Option<Duration> {
        match self.deadline {
            None => Some(timeout),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    None
                } else {
                    Some(timeout.min(left))
                }
            }
        }
    }

    /// summary renders the effective configuration for diagnostics
    pub fn summary(&self, strategies: &[TlsStrategy]) -> String {
        let proxies = self.effective_proxies();
        let proxy_mode = if self.disable_proxy {
            "disabled".to_string()
        } else if proxies.is_empty() {
            "direct".to_string()
        } else {
            let list = proxies
                .iter()
                .map(|p| {
                    ProxyCredential::parse(p)
                        .map(|c| c.redacted())
                        .unwrap_or_else(|_| "<invalid>".to_string())
                })
                .collect::<Vec<_>>()
                .join(", ");
            if self.force_proxy {
                format!("forced [{list}]")
            } else {
                format!("[{list}]")
            }
        };
        let override_kind = match &self.tls_params {
            None => "none",
            Some(TlsParams::Ordinary(_)) => "ordinary",
            Some(TlsParams::Gm(_)) => "gm",
        };
        let strategies = if strategies.is_empty() {
            "plain tcp".to_string()
        } else {
            strategies
                .iter()
                .map(TlsStrategy::as_str)
                .collect::<Vec<_>>()
                .join(" -> ")
        };
        format!(
            "proxy: {}, sni: {}, alpn: [{}], tls override: {}, strategies: {}, insecure: {}",
            proxy_mode,
            self.sni.as_deref().unwrap_or("<target host>"),
            self.alpn.join(", "),
            override_kind,
            strategies,
            self.insecure_skip_verify
        )
    }
}

/// DialOption sets one `DialConfig` field
#[derive(Debug, Clone)]
pub enum DialOption {
    Timeout(Duration),
    TlsTimeout(Duration),
    Deadline(Instant),
    /// Appends proxies; empty strings are ignored
    Proxy(Vec<String>),
    DisableProxy(bool),
    ForceProxy(bool),
    SystemProxyFromEnv(bool),
    Tls(bool),
    GmSupport(bool),
    GmOnly(bool),
    GmPrefer(bool),
    Sni(String),
    Alpn(Vec<String>),
    TlsParams(TlsParams),
    InsecureSkipVerify(bool),
    MinTlsVersion(TlsVersion),
    MaxTlsVersion(TlsVersion),
    TimeoutRetry(bool),
    MaxRetries(u32),
    RetryWait { min: Duration, max: Duration },
    /// Appends deny-list entries: IPs, CIDRs, hosts or `*.suffix`
    Deny(Vec<String>),
    LocalAddr(IpAddr),
    StrongHostMode(bool),
    KeepAlive(Duration),
    Debug(bool),
    Dns(DnsOptions),
    Trace(Arc<DialTrace>),
}

impl DialOption {
    pub fn apply(self, cfg: &mut DialConfig) {
        match self {
            DialOption::Timeout(d) => cfg.timeout = d,
            DialOption::TlsTimeout(d) => cfg.tls_timeout = d,
            DialOption::Deadline(at) => cfg.deadline = Some(at),
            DialOption::Proxy(list) => cfg
                .proxies
                .extend(list.into_iter().filter(|p| !p.trim().is_empty())),
            DialOption::DisableProxy(b) => cfg.disable_proxy = b,
            DialOption::ForceProxy(b) => cfg.force_proxy = b,
            DialOption::SystemProxyFromEnv(b) => cfg.system_proxy_from_env = b,
            DialOption::Tls(b) => cfg.tls = b,
            DialOption::GmSupport(b) => cfg.gm.support = b,
            DialOption::GmOnly(b) => cfg.gm.only = b,
            DialOption::GmPrefer(b) => cfg.gm.prefer = b,
            DialOption::Sni(sni) => cfg.sni = Some(sni).filter(|s| !s.is_empty()),
            DialOption::Alpn(alpn) => cfg.alpn = alpn,
            DialOption::TlsParams(params) => cfg.tls_params = Some(params),
            DialOption::InsecureSkipVerify(b) => cfg.insecure_skip_verify = b,
            DialOption::MinTlsVersion(v) => cfg.min_tls_version = Some(v),
            DialOption::MaxTlsVersion(v) => cfg.max_tls_version = Some(v),
            DialOption::TimeoutRetry(b) => cfg.retry.enabled = b,
            DialOption::MaxRetries(n) => cfg.retry.max_retries = n,
            DialOption::RetryWait { min, max } => {
                cfg.retry.min_wait = min;
                cfg.retry.max_wait = max;
            }
            DialOption::Deny(entries) => {
                for entry in entries {
                    cfg.deny.insert(&entry);
                }
            }
            DialOption::LocalAddr(ip) => cfg.local_addr = Some(ip),
            DialOption::StrongHostMode(b) => cfg.strong_host = b,
            DialOption::KeepAlive(d) => cfg.keep_alive = Some(d),
            DialOption::Debug(b) => cfg.debug = b,
            DialOption::Dns(dns) => cfg.dns = dns,
            DialOption::Trace(trace) => cfg.trace = Some(trace),
        }
    }
}

/// DefaultProfile is the process-wide option list applied before per-call options
///
/// Reads copy the list under the lock. Writes replace it wholesale. The lock
/// is never held across a dial.
#[derive(Debug, Default)]
pub struct DefaultProfile {
    options: Mutex<Vec<DialOption>>,
}

impl DefaultProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, options: Vec<DialOption>) {
        *self.options.lock() = options;
    }

    pub fn snapshot(&self) -> Vec<DialOption> {
        self.options.lock().clone()
    }

    /// build merges defaults, this profile and `per_call`
    pub fn build(&self, per_call: &[DialOption]) -> DialConfig {
        let defaults = self.snapshot();
        DialConfig::from_options(defaults.iter().chain(per_call))
    }
}

/// DialTraceInfo holds phase durations of one dial
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialTraceInfo {
    pub total: Duration,
    /// Plain TCP phase of the winning attempt, proxy handshake included
    pub tcp: Duration,
    pub tls_handshake: Duration,
}

/// DialTrace is a caller-supplied record the dialer fills in
#[derive(Debug, Default)]
pub struct DialTrace {
    info: Mutex<DialTraceInfo>,
}

impl DialTrace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> DialTraceInfo {
        *self.info.lock()
    }

    pub(crate) fn record_total(&self, d: Duration) {
        self.info.lock().total = d;
    }

    pub(crate) fn record_tcp(&self, d: Duration) {
        self.info.lock().tcp = d;
    }

    pub(crate) fn record_tls(&self, d: Duration) {
        self.info.lock().tls_handshake = d;
    }
}
