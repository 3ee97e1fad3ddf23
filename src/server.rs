use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{Backend, Cache};
use crate::client::{Exchanger, Mux, Resolver};
use crate::config::Config;
use crate::hosts::Matcher;
use crate::loader::{self, HostsLoader};
use crate::persist::SqlBackend;
use crate::proxy::Proxy;
use crate::querylog::QueryLog;
use crate::sql::Store;

/// Wires the components together and owns their lifecycle: hosts refresh
/// ticker, cache and log workers, and the store.
pub struct Server {
    pub config: Config,
    pub proxy: Arc<Proxy>,
    cache: Arc<Cache>,
    querylog: Arc<QueryLog>,
    backend: Option<Arc<SqlBackend>>,
    loader: Arc<HostsLoader>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Server> {
        let store = if config.dns.database.is_empty() {
            None
        } else {
            Some(Arc::new(
                Store::open(&config.dns.database).context("open database")?,
            ))
        };

        let mut resolvers = Vec::with_capacity(config.dns.resolvers.len());
        for addr in &config.dns.resolvers {
            resolvers.push(Arc::new(Resolver::new(
                addr,
                config.resolver.protocol,
                config.resolver.timeout,
            )?));
        }
        let mux: Arc<dyn Exchanger> = Arc::new(Mux::new(resolvers));

        let prefetch_client = config.dns.cache_prefetch.then(|| Arc::clone(&mux));
        let backend = match (&store, config.dns.cache_persist) {
            (Some(store), true) => Some(Arc::new(SqlBackend::new(Arc::clone(store)))),
            _ => None,
        };
        let cache = match &backend {
            Some(backend) => {
                let backend: Arc<dyn Backend> = Arc::clone(backend) as Arc<dyn Backend>;
                Arc::new(
                    Cache::with_backend(config.dns.cache_size, prefetch_client, backend).await,
                )
            }
            None => Arc::new(Cache::new(config.dns.cache_size, prefetch_client)),
        };

        let querylog = Arc::new(QueryLog::new(
            store.clone(),
            config.dns.log_mode.into(),
            config.dns.log_ttl,
        ));

        let matcher = Matcher::empty();
        let loader = Arc::new(HostsLoader::new(config.hosts.clone(), matcher.clone())?);
        loader.load().await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ticker = if config.dns.hosts_refresh_interval > Duration::ZERO {
            Some(loader::spawn_refresh(
                Arc::clone(&loader),
                config.dns.hosts_refresh_interval,
                shutdown_rx,
            ))
        } else {
            None
        };

        let proxy = Arc::new(Proxy::new(
            config.dns.hijack_mode,
            matcher,
            Arc::clone(&cache),
            mux,
            Arc::clone(&querylog),
        ));

        Ok(Server {
            config,
            proxy,
            cache,
            querylog,
            backend,
            loader,
            shutdown,
            ticker: Mutex::new(ticker),
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn querylog(&self) -> &Arc<QueryLog> {
        &self.querylog
    }

    /// Reloads the hosts sources immediately.
    pub async fn reload(&self) {
        info!("reloading hosts sources");
        self.loader.load().await;
    }

    /// Stops the refresh ticker, cancels cache work, flushes the query log
    /// and drains the persistence queue.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(ticker) = self.ticker.lock().await.take() {
            let _ = ticker.await;
        }
        self.cache.close().await;
        self.querylog.close().await;
        if let Some(backend) = &self.backend {
            backend.close().await;
        }
        info!("server closed");
    }
}
