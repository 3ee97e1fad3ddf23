use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::LogModeOption;
use crate::sql::Store;

const QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Recording is a no-op.
    Discard,
    All,
    /// Record only hijacked requests.
    Hijacked,
}

impl From<LogModeOption> for LogMode {
    fn from(opt: LogModeOption) -> Self {
        match opt {
            LogModeOption::Disabled => LogMode::Discard,
            LogModeOption::All => LogMode::All,
            LogModeOption::Hijacked => LogMode::Hijacked,
        }
    }
}

/// A request log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub time: SystemTime,
    pub remote_addr: IpAddr,
    pub hijacked: bool,
    pub qtype: u16,
    pub question: String,
    pub answers: Vec<String>,
}

/// Records DNS requests to the store without blocking the request path.
/// Entries go onto a bounded queue consumed by a single drain worker; when a
/// TTL is configured the worker also prunes entries older than the TTL after
/// each write.
pub struct QueryLog {
    mode: LogMode,
    store: Option<Arc<Store>>,
    queue: std::sync::Mutex<Option<mpsc::Sender<Entry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    now: fn() -> SystemTime,
}

impl QueryLog {
    pub fn new(store: Option<Arc<Store>>, mode: LogMode, ttl: Duration) -> QueryLog {
        let mut queue = None;
        let mut worker = None;
        // Discard mode never starts the drain worker.
        if mode != LogMode::Discard {
            if let Some(store) = store.clone() {
                let (tx, rx) = mpsc::channel(QUEUE_SIZE);
                queue = Some(tx);
                worker = Some(tokio::spawn(drain(store, rx, ttl)));
            }
        }
        QueryLog {
            mode,
            store,
            queue: std::sync::Mutex::new(queue),
            worker: Mutex::new(worker),
            dropped: AtomicU64::new(0),
            now: SystemTime::now,
        }
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Queues a request for recording. Never blocks; when the queue is full
    /// the record is dropped and counted.
    pub fn record(
        &self,
        remote_addr: IpAddr,
        hijacked: bool,
        qtype: u16,
        question: String,
        answers: Vec<String>,
    ) {
        if self.mode == LogMode::Discard {
            return;
        }
        if self.mode == LogMode::Hijacked && !hijacked {
            return;
        }
        let sender = self.queue.lock().unwrap().clone();
        let Some(sender) = sender else {
            return;
        };
        let entry = Entry {
            time: (self.now)(),
            remote_addr,
            hijacked,
            qtype,
            question,
            answers,
        };
        if sender.try_send(entry).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "log queue full, dropping record");
        }
    }

    /// The n most recent persisted entries. Rows sharing a log id are folded
    /// back into one entry, preserving store order.
    pub async fn read(&self, n: usize) -> Result<Vec<Entry>> {
        let Some(store) = self.store.as_ref() else {
            return Ok(Vec::new());
        };
        let rows = store.read_log(n).await?;
        let mut entries: Vec<Entry> = Vec::with_capacity(rows.len());
        let mut by_id: FxHashMap<i64, usize> = FxHashMap::default();
        for row in rows {
            let idx = match by_id.get(&row.id) {
                Some(idx) => *idx,
                None => {
                    entries.push(Entry {
                        time: UNIX_EPOCH + Duration::from_secs(row.time.max(0) as u64),
                        remote_addr: row.remote_addr,
                        hijacked: row.hijacked,
                        qtype: row.qtype,
                        question: row.question.clone(),
                        answers: Vec::new(),
                    });
                    by_id.insert(row.id, entries.len() - 1);
                    entries.len() - 1
                }
            };
            if let Some(answer) = row.answer {
                entries[idx].answers.push(answer);
            }
        }
        Ok(entries)
    }

    /// Flushes the queue and stops the worker.
    pub async fn close(&self) {
        self.queue.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

async fn drain(store: Arc<Store>, mut rx: mpsc::Receiver<Entry>, ttl: Duration) {
    while let Some(entry) = rx.recv().await {
        let time = entry
            .time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Err(err) = store
            .write_log(
                time,
                entry.remote_addr,
                entry.hijacked,
                entry.qtype,
                &entry.question,
                &entry.answers,
            )
            .await
        {
            warn!(question = %entry.question, error = %err, "log write failed");
        }
        if ttl > Duration::ZERO {
            let cutoff = time - ttl.as_secs() as i64;
            if let Err(err) = store.delete_log_before(cutoff).await {
                warn!(cutoff, error = %err, "log pruning failed");
            }
        }
    }
}
