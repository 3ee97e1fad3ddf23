use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsOptions,
    #[serde(default)]
    pub resolver: ResolverOptions,
    /// Hosts sources, folded in declaration order.
    #[serde(default)]
    pub hosts: Vec<HostsSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsOptions {
    /// Listening address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Wire protocols to serve.
    #[serde(default = "default_protocol")]
    pub protocol: ListenProtocol,
    /// Response cache capacity. 0 disables caching.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Serve stale entries and refresh them in the background.
    #[serde(default)]
    pub cache_prefetch: bool,
    /// Mirror the cache into the database.
    #[serde(default)]
    pub cache_persist: bool,
    #[serde(default = "default_hijack_mode")]
    pub hijack_mode: HijackMode,
    /// How often hosts sources are refreshed. 0 disables the ticker.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub hosts_refresh_interval: Duration,
    /// Upstream addresses, raced in parallel.
    #[serde(default)]
    pub resolvers: Vec<String>,
    /// SQLite path for the request log and persistent cache. Empty disables
    /// both.
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_log_mode")]
    pub log_mode: LogModeOption,
    /// Persisted log entries older than this are pruned. 0 keeps everything.
    #[serde(default, with = "humantime_serde")]
    pub log_ttl: Duration,
    /// Address for the read-only inspection API. Empty disables it.
    #[serde(default)]
    pub listen_http: String,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol: default_protocol(),
            cache_size: default_cache_size(),
            cache_prefetch: false,
            cache_persist: false,
            hijack_mode: default_hijack_mode(),
            hosts_refresh_interval: default_refresh_interval(),
            resolvers: Vec::new(),
            database: String::new(),
            log_mode: default_log_mode(),
            log_ttl: Duration::ZERO,
            listen_http: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverOptions {
    #[serde(default = "default_resolver_protocol")]
    pub protocol: ResolverProtocol,
    #[serde(default = "default_resolver_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            protocol: default_resolver_protocol(),
            timeout: default_resolver_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsSource {
    /// `file://` or `http(s)://` URL. Exactly one of `url` and `entries`
    /// must be set.
    #[serde(default)]
    pub url: Option<String>,
    /// Inline hosts lines.
    #[serde(default)]
    pub entries: Option<Vec<String>>,
    /// true adds the source's names, false removes them from earlier sources.
    #[serde(default)]
    pub hijack: bool,
    /// Fetch timeout, http(s) sources only. 0 means no limit.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenProtocol {
    Udp,
    Tcp,
    #[serde(rename = "udp+tcp")]
    UdpTcp,
}

impl ListenProtocol {
    pub fn udp(self) -> bool {
        matches!(self, Self::Udp | Self::UdpTcp)
    }

    pub fn tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::UdpTcp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HijackMode {
    /// Answer A with 0.0.0.0 and AAAA with ::.
    Zero,
    /// Answer NOERROR with an empty answer section.
    Empty,
    /// Answer with the addresses from the hosts entry.
    Hosts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverProtocol {
    Udp,
    Tcp,
    #[serde(rename = "tcp-tls")]
    TcpTls,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogModeOption {
    #[serde(alias = "")]
    Disabled,
    All,
    Hijacked,
}

fn default_listen() -> String {
    "127.0.0.1:53".to_string()
}

fn default_protocol() -> ListenProtocol {
    ListenProtocol::UdpTcp
}

fn default_cache_size() -> usize {
    1024
}

fn default_hijack_mode() -> HijackMode {
    HijackMode::Zero
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(48 * 3600)
}

fn default_resolver_protocol() -> ResolverProtocol {
    ResolverProtocol::Udp
}

fn default_resolver_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_mode() -> LogModeOption {
    LogModeOption::Disabled
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg =
        parse_config(&raw).with_context(|| format!("parse config file: {}", path.display()))?;
    info!(
        listen = %cfg.dns.listen,
        resolvers = cfg.dns.resolvers.len(),
        hosts_sources = cfg.hosts.len(),
        "config loaded"
    );
    Ok(cfg)
}

pub fn parse_config(raw: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(raw)?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    fn validate(&self) -> Result<()> {
        self.dns
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listening address: {}", self.dns.listen))?;
        if !self.dns.listen_http.is_empty() {
            self.dns
                .listen_http
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid http address: {}", self.dns.listen_http))?;
        }
        for resolver in &self.dns.resolvers {
            validate_resolver(resolver, self.resolver.protocol)?;
        }
        for source in &self.hosts {
            source.validate()?;
        }
        if self.dns.log_mode != LogModeOption::Disabled && self.dns.database.is_empty() {
            bail!("log_mode requires a database");
        }
        if self.dns.cache_persist && self.dns.database.is_empty() {
            bail!("cache_persist requires a database");
        }
        Ok(())
    }
}

fn validate_resolver(addr: &str, protocol: ResolverProtocol) -> Result<()> {
    match protocol {
        ResolverProtocol::Https => {
            if !addr.starts_with("https://") {
                bail!(
                    "invalid resolver: {}: https protocol requires an https:// url",
                    addr
                );
            }
        }
        ResolverProtocol::TcpTls => {
            // host:port with an optional =servername suffix
            let host_port = addr.split_once('=').map_or(addr, |(hp, _)| hp);
            host_port
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid resolver: {}", addr))?;
        }
        ResolverProtocol::Udp | ResolverProtocol::Tcp => {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid resolver: {}", addr))?;
        }
    }
    Ok(())
}

impl HostsSource {
    fn validate(&self) -> Result<()> {
        match (&self.url, &self.entries) {
            (Some(_), Some(_)) | (None, None) => {
                bail!("exactly one of url or entries must be set")
            }
            (Some(url), None) => {
                let scheme = url.split_once("://").map(|(s, _)| s);
                match scheme {
                    Some("file") => {
                        if self.timeout > Duration::ZERO {
                            bail!("{}: timeout cannot be set for a file url", url);
                        }
                    }
                    Some("http") | Some("https") => {}
                    _ => bail!("{}: unsupported scheme", url),
                }
            }
            (None, Some(_)) => {
                if self.timeout > Duration::ZERO {
                    bail!("timeout cannot be set for inline hosts");
                }
            }
        }
        Ok(())
    }
}
