use std::io::BufReader;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::HostsSource;
use crate::hosts::{self, Hosts, Matcher};

// Backoff for http(s) sources: doubling sleeps capped at BACKOFF_MAX_INTERVAL,
// giving up after BACKOFF_MAX_ELAPSED.
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// Loads hosts sources and installs the merged table into the matcher.
/// Sources are folded in declaration order; a failing source is logged and
/// skipped without aborting the load.
pub struct HostsLoader {
    sources: Vec<HostsSource>,
    matcher: Matcher,
    http: reqwest::Client,
}

impl HostsLoader {
    pub fn new(sources: Vec<HostsSource>, matcher: Matcher) -> Result<HostsLoader> {
        let http = reqwest::Client::builder()
            .build()
            .context("build hosts http client")?;
        Ok(HostsLoader {
            sources,
            matcher,
            http,
        })
    }

    /// Fetches every source and atomically swaps the merged result in.
    pub async fn load(&self) {
        let mut layers = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let loaded = match self.fetch(source).await {
                Ok(hosts) => hosts,
                Err(err) => {
                    warn!(source = %describe(source), error = %err, "failed to load hosts source");
                    continue;
                }
            };
            info!(
                source = %describe(source),
                hosts = loaded.len(),
                hijack = source.hijack,
                "loaded hosts source"
            );
            layers.push((loaded, source.hijack));
        }
        let merged = hosts::merge(layers);
        info!(hosts = merged.len(), "installed hosts table");
        self.matcher.install(merged);
    }

    async fn fetch(&self, source: &HostsSource) -> Result<Hosts> {
        if let Some(entries) = &source.entries {
            let buf = entries.join("\n");
            return hosts::parse(buf.as_bytes());
        }
        let url = source.url.as_deref().unwrap_or_default();
        if let Some(path) = url.strip_prefix("file://") {
            let file = std::fs::File::open(path).with_context(|| format!("open {path}"))?;
            return hosts::parse(BufReader::new(file));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            let body = self.get_with_backoff(url, source.timeout).await?;
            return hosts::parse(body.as_ref());
        }
        bail!("unsupported url scheme: {url}")
    }

    /// GET with exponential backoff on transient errors (network failures
    /// and non-success statuses).
    async fn get_with_backoff(&self, url: &str, timeout: Duration) -> Result<bytes::Bytes> {
        let started = Instant::now();
        let mut interval = BACKOFF_INITIAL;
        loop {
            let result = self.get(url, timeout).await;
            match result {
                Ok(body) => return Ok(body),
                Err(err) => {
                    if started.elapsed() + interval > BACKOFF_MAX_ELAPSED {
                        return Err(err);
                    }
                    warn!(url, error = %err, retry_in_ms = interval.as_millis() as u64, "hosts fetch failed, retrying");
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(BACKOFF_MAX_INTERVAL);
                }
            }
        }
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<bytes::Bytes> {
        let mut request = self.http.get(url);
        if timeout > Duration::ZERO {
            request = request.timeout(timeout);
        }
        let response = request.send().await.context("request failed")?;
        if !response.status().is_success() {
            bail!("server returned HTTP {}", response.status());
        }
        response.bytes().await.context("read body")
    }
}

fn describe(source: &HostsSource) -> &str {
    source.url.as_deref().unwrap_or("<inline>")
}

/// Re-runs the load at every tick until shutdown.
pub fn spawn_refresh(
    loader: std::sync::Arc<HostsLoader>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the initial load already ran.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => loader.load().await,
            }
        }
    })
}
