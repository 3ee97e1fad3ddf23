use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::{self, Backend, Value};
use crate::sql::Store;

const QUEUE_SIZE: usize = 1024;

enum Op {
    Set(Box<Value>),
    Evict(u32),
    Reset,
    /// Barrier: acknowledged once every earlier write has been applied.
    Flush(oneshot::Sender<()>),
}

/// A persistent cache backend. Writes are queued and applied to the SQL
/// store by a single drain worker; reads flush the queue first so they
/// observe every earlier write.
pub struct SqlBackend {
    store: Arc<Store>,
    queue: std::sync::Mutex<Option<mpsc::Sender<Op>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SqlBackend {
    pub fn new(store: Arc<Store>) -> SqlBackend {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let worker = tokio::spawn(drain(Arc::clone(&store), rx));
        SqlBackend {
            store,
            queue: std::sync::Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn enqueue(&self, op: Op) {
        let sender = self.queue.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(op).await;
        }
    }

    /// Applies any outstanding writes and stops the worker.
    pub async fn close(&self) {
        self.queue.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn set(&self, value: Value) {
        self.enqueue(Op::Set(Box::new(value))).await;
    }

    async fn evict(&self, key: u32) {
        self.enqueue(Op::Evict(key)).await;
    }

    async fn reset(&self) {
        self.enqueue(Op::Reset).await;
    }

    async fn read(&self) -> Vec<Value> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Op::Flush(tx)).await;
        let _ = rx.await;
        let entries = match self.store.read_cache().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to read persisted cache");
                return Vec::new();
            }
        };
        let mut values = Vec::with_capacity(entries.len());
        for entry in entries {
            match cache::unpack(&entry) {
                Ok(value) => values.push(value),
                Err(err) => warn!(error = %err, "skipping invalid cache entry"),
            }
        }
        values
    }
}

async fn drain(store: Arc<Store>, mut rx: mpsc::Receiver<Op>) {
    while let Some(op) = rx.recv().await {
        match op {
            Op::Set(value) => {
                let packed = match value.pack() {
                    Ok(packed) => packed,
                    Err(err) => {
                        warn!(key = value.key, error = %err, "failed to pack cache value");
                        continue;
                    }
                };
                if let Err(err) = store.write_cache(value.key, &packed).await {
                    warn!(key = value.key, error = %err, "failed to write cache value");
                }
            }
            Op::Evict(key) => {
                if let Err(err) = store.remove_cache(key).await {
                    warn!(key, error = %err, "failed to remove cache value");
                }
            }
            Op::Reset => {
                if let Err(err) = store.truncate_cache().await {
                    warn!(error = %err, "failed to truncate cache");
                }
            }
            Op::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
