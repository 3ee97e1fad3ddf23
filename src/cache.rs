use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::Exchanger;
use crate::dnsutil;

const TASK_QUEUE_SIZE: usize = 1024;

/// Write operations of a cache are mirrored into a backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn set(&self, value: Value);
    async fn evict(&self, key: u32);
    async fn reset(&self);
    /// All persisted values in insertion order.
    async fn read(&self) -> Vec<Value>;
}

/// A DNS message stored in the cache.
#[derive(Debug, Clone)]
pub struct Value {
    pub key: u32,
    pub created_at: SystemTime,
    pub msg: Message,
}

impl Value {
    pub fn answers(&self) -> Vec<String> {
        dnsutil::answers(&self.msg)
    }

    pub fn ttl(&self) -> Duration {
        dnsutil::min_ttl(&self.msg)
    }

    /// Persistence form: `"<key> <unix_seconds> <hex wire bytes>"`. This
    /// string is the on-disk contract, independent of the message library's
    /// internal representation.
    pub fn pack(&self) -> Result<String> {
        let secs = self
            .created_at
            .duration_since(UNIX_EPOCH)
            .context("created_at before epoch")?
            .as_secs();
        let wire = self.msg.to_vec().context("encode cached message")?;
        Ok(format!("{} {} {}", self.key, secs, hex::encode(wire)))
    }
}

/// Parses a value previously produced by [`Value::pack`].
pub fn unpack(value: &str) -> Result<Value> {
    let mut fields = value.split_whitespace();
    let (Some(key), Some(secs), Some(data)) = (fields.next(), fields.next(), fields.next()) else {
        bail!("invalid number of fields: {:?}", value);
    };
    let key: u32 = key.parse().context("invalid key")?;
    let secs: u64 = secs.parse().context("invalid timestamp")?;
    let wire = hex::decode(data).context("invalid hex data")?;
    let msg = Message::from_vec(&wire).context("invalid message")?;
    Ok(Value {
        key,
        created_at: UNIX_EPOCH + Duration::from_secs(secs),
        msg,
    })
}

/// Whether a reply may be cached at all: only NOERROR and NXDOMAIN replies
/// with a non-zero effective TTL.
fn cacheable(msg: &Message) -> bool {
    if dnsutil::min_ttl(msg) == Duration::ZERO {
        return false;
    }
    matches!(
        msg.response_code(),
        ResponseCode::NoError | ResponseCode::NXDomain
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub size: usize,
    pub capacity: usize,
    pub pending_tasks: usize,
}

enum Task {
    Refresh(u32),
    Evict(u32),
}

/// Backend writes collected inside the lock and applied after it is
/// released, so no send happens in the critical section.
enum BackendOp {
    Set(Value),
    Evict(u32),
    Reset,
}

struct State {
    values: HashMap<u32, Value>,
    /// Keys in insertion order, front = oldest. A re-set key moves to the
    /// back.
    keys: VecDeque<u32>,
}

struct Inner {
    capacity: usize,
    client: Option<Arc<dyn Exchanger>>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    state: RwLock<State>,
    /// Keys with a refresh task queued or running.
    refreshing: DashSet<u32>,
    next_id: AtomicU16,
    now: fn() -> SystemTime,
}

/// An in-memory cache of DNS messages keyed by request fingerprint.
///
/// With a client attached, expired entries are served stale and refreshed in
/// the background. With a backend attached, every write is mirrored into it
/// and the cache is pre-populated from it on startup.
pub struct Cache {
    inner: Arc<Inner>,
    tasks: mpsc::Sender<Task>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(capacity: usize, client: Option<Arc<dyn Exchanger>>) -> Cache {
        Self::with_now(capacity, client, SystemTime::now)
    }

    /// Creates a cache pre-populated from `backend`; later writes are
    /// forwarded to it.
    pub async fn with_backend(
        capacity: usize,
        client: Option<Arc<dyn Exchanger>>,
        backend: Arc<dyn Backend>,
    ) -> Cache {
        let cache = Self::new(capacity, client);
        cache.load(backend).await;
        cache
    }

    fn with_now(
        capacity: usize,
        client: Option<Arc<dyn Exchanger>>,
        now: fn() -> SystemTime,
    ) -> Cache {
        let inner = Arc::new(Inner {
            capacity,
            client,
            backend: RwLock::new(None),
            state: RwLock::new(State {
                values: HashMap::with_capacity(capacity),
                keys: VecDeque::with_capacity(capacity),
            }),
            refreshing: DashSet::new(),
            next_id: AtomicU16::new(1),
            now,
        });
        let (tx, rx) = mpsc::channel(TASK_QUEUE_SIZE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(drain_tasks(Arc::clone(&inner), rx, shutdown_rx));
        Cache {
            inner,
            tasks: tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Installs persisted entries, newest-capacity-many of them, and evicts
    /// the rest from the backend so both sides agree.
    async fn load(&self, backend: Arc<dyn Backend>) {
        if self.inner.capacity == 0 {
            backend.reset().await;
            *self.inner.backend.write().unwrap() = Some(backend);
            return;
        }
        let values = backend.read().await;
        let skip = values.len().saturating_sub(self.inner.capacity);
        {
            // The backend is attached after installation, so these writes are
            // not echoed back to it.
            let mut state = self.inner.state.write().unwrap();
            for value in values.iter().skip(skip) {
                set_value(&self.inner, &mut state, value.clone());
            }
        }
        for value in &values[..skip] {
            backend.evict(value.key).await;
        }
        *self.inner.backend.write().unwrap() = Some(backend);
    }

    /// Looks up the message for `key`. An expired entry is served stale when
    /// prefetching is enabled (a background refresh is queued), otherwise it
    /// is queued for eviction and reported as a miss.
    pub fn get(&self, key: u32) -> Option<Message> {
        let (msg, expired) = {
            let state = self.inner.state.read().unwrap();
            let value = state.values.get(&key)?;
            (value.msg.clone(), is_expired(&self.inner, value))
        };
        if !expired {
            return Some(msg);
        }
        if self.inner.client.is_some() {
            if self.inner.refreshing.insert(key) {
                if self.tasks.try_send(Task::Refresh(key)).is_err() {
                    self.inner.refreshing.remove(&key);
                }
            }
            return Some(msg);
        }
        let _ = self.tasks.try_send(Task::Evict(key));
        None
    }

    /// Associates `key` with `msg`. A message that is not cacheable is
    /// skipped. Inserting into a full cache evicts the oldest entry by
    /// insertion order.
    pub async fn set(&self, key: u32, msg: Message) {
        let value = Value {
            key,
            created_at: (self.inner.now)(),
            msg,
        };
        let ops = {
            let mut state = self.inner.state.write().unwrap();
            set_value(&self.inner, &mut state, value)
        };
        forward(&self.inner, ops).await;
    }

    /// The n most recent values, newest first.
    pub fn list(&self, n: usize) -> Vec<Value> {
        let state = self.inner.state.read().unwrap();
        state
            .keys
            .iter()
            .rev()
            .take(n)
            .filter_map(|key| state.values.get(key).cloned())
            .collect()
    }

    /// Removes every entry.
    pub async fn reset(&self) {
        {
            let mut state = self.inner.state.write().unwrap();
            state.values.clear();
            state.keys.clear();
        }
        forward(&self.inner, vec![BackendOp::Reset]).await;
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.state.read().unwrap();
        Stats {
            size: state.values.len(),
            capacity: self.inner.capacity,
            pending_tasks: TASK_QUEUE_SIZE - self.tasks.capacity(),
        }
    }

    /// Stops the background worker. Queued refreshes are dropped, not
    /// committed.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

fn is_expired(inner: &Inner, value: &Value) -> bool {
    let expires_at = value.created_at + value.ttl();
    (inner.now)() > expires_at
}

/// Applies a set under the lock and reports the backend writes it caused.
/// Returns an empty list when the message was not cacheable.
fn set_value(inner: &Inner, state: &mut State, value: Value) -> Vec<BackendOp> {
    if inner.capacity == 0 || !cacheable(&value.msg) {
        return Vec::new();
    }
    let mut ops = Vec::with_capacity(2);
    if !state.values.contains_key(&value.key) && state.values.len() == inner.capacity {
        if let Some(oldest) = state.keys.pop_front() {
            state.values.remove(&oldest);
            ops.push(BackendOp::Evict(oldest));
        }
    }
    state.keys.retain(|k| *k != value.key);
    state.keys.push_back(value.key);
    ops.push(BackendOp::Set(value.clone()));
    state.values.insert(value.key, value);
    ops
}

fn evict_value(state: &mut State, key: u32) -> Vec<BackendOp> {
    state.values.remove(&key);
    state.keys.retain(|k| *k != key);
    vec![BackendOp::Evict(key)]
}

async fn forward(inner: &Inner, ops: Vec<BackendOp>) {
    let backend = inner.backend.read().unwrap().clone();
    let Some(backend) = backend else {
        return;
    };
    for op in ops {
        match op {
            BackendOp::Set(value) => backend.set(value).await,
            BackendOp::Evict(key) => backend.evict(key).await,
            BackendOp::Reset => backend.reset().await,
        }
    }
}

async fn drain_tasks(inner: Arc<Inner>, mut rx: mpsc::Receiver<Task>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            task = rx.recv() => match task {
                Some(task) => task,
                None => return,
            },
        };
        match task {
            Task::Refresh(key) => {
                // Shutdown cancels an in-flight refresh rather than letting
                // it commit.
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    _ = refresh(&inner, key) => {}
                }
                inner.refreshing.remove(&key);
            }
            Task::Evict(key) => {
                let ops = {
                    let mut state = inner.state.write().unwrap();
                    evict_value(&mut state, key)
                };
                forward(&inner, ops).await;
            }
        }
    }
}

/// Re-resolves the question behind `key` and replaces the stored entry; a
/// reply that is no longer cacheable evicts the key instead.
async fn refresh(inner: &Arc<Inner>, key: u32) {
    let Some(client) = inner.client.as_ref() else {
        return;
    };
    let question = {
        let state = inner.state.read().unwrap();
        state
            .values
            .get(&key)
            .and_then(|v| v.msg.queries().first().cloned())
    };
    let Some(question) = question else { return };
    let mut msg = Message::new();
    msg.set_id(inner.next_id.fetch_add(1, Ordering::Relaxed));
    msg.set_recursion_desired(true);
    msg.add_query(question);
    match client.exchange(&msg).await {
        Ok(reply) => {
            let value = Value {
                key,
                created_at: (inner.now)(),
                msg: reply,
            };
            let cacheable_reply = cacheable(&value.msg);
            let ops = {
                let mut state = inner.state.write().unwrap();
                if cacheable_reply {
                    set_value(inner, &mut state, value)
                } else {
                    evict_value(&mut state, key)
                }
            };
            forward(inner, ops).await;
        }
        Err(err) => {
            // Retry on the next stale read
            debug!(key, error = %err, "cache refresh failed");
        }
    }
}

/// Computes the cache key for a question.
pub fn new_key(name: &str, qtype: u16, qclass: u16) -> u32 {
    dnsutil::fingerprint(name, qtype, qclass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    fn reply(name: &str, ip: &str, ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1111);
        msg.set_message_type(MessageType::Response);
        msg.set_recursion_available(true);
        let qname = Name::from_utf8(name).unwrap();
        let mut q = Query::new();
        q.set_name(qname.clone());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg.add_answer(Record::from_rdata(
            qname,
            ttl,
            RData::A(A(ip.parse().unwrap())),
        ));
        msg
    }

    fn key_of(msg: &Message) -> u32 {
        let q = msg.queries().first().unwrap();
        new_key(
            &q.name().to_string().to_ascii_lowercase(),
            u16::from(q.query_type()),
            u16::from(q.query_class()),
        )
    }

    struct FixedExchanger {
        replies: StdMutex<Vec<Message>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Exchanger for FixedExchanger {
        async fn exchange(&self, _msg: &Message) -> Result<Message> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                bail!("no reply configured");
            }
            Ok(replies.remove(0))
        }
    }

    #[tokio::test]
    async fn get_after_set_returns_message() {
        let cache = Cache::new(16, None);
        let msg = reply("example.com.", "192.0.2.1", 60);
        let key = key_of(&msg);
        cache.set(key, msg.clone()).await;
        let hit = cache.get(key).expect("hit");
        assert_eq!(hit.to_vec().unwrap(), msg.to_vec().unwrap());
    }

    #[tokio::test]
    async fn uncacheable_messages_are_skipped() {
        let cache = Cache::new(16, None);

        let zero_ttl = reply("a.example.", "192.0.2.1", 0);
        cache.set(key_of(&zero_ttl), zero_ttl.clone()).await;
        assert!(cache.get(key_of(&zero_ttl)).is_none());

        let mut refused = reply("b.example.", "192.0.2.1", 60);
        refused.set_response_code(ResponseCode::Refused);
        cache.set(key_of(&refused), refused.clone()).await;
        assert!(cache.get(key_of(&refused)).is_none());

        // NXDOMAIN with a TTL is cacheable
        let mut nx = reply("c.example.", "192.0.2.1", 60);
        nx.set_response_code(ResponseCode::NXDomain);
        cache.set(key_of(&nx), nx.clone()).await;
        assert!(cache.get(key_of(&nx)).is_some());
    }

    #[tokio::test]
    async fn capacity_zero_disables_the_cache() {
        let cache = Cache::new(0, None);
        let msg = reply("example.com.", "192.0.2.1", 60);
        let key = key_of(&msg);
        cache.set(key, msg).await;
        assert!(cache.get(key).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn full_cache_evicts_oldest_by_insertion_order() {
        let cache = Cache::new(2, None);
        let first = reply("first.example.", "192.0.2.1", 60);
        let second = reply("second.example.", "192.0.2.2", 60);
        let third = reply("third.example.", "192.0.2.3", 60);
        cache.set(key_of(&first), first.clone()).await;
        cache.set(key_of(&second), second.clone()).await;
        cache.set(key_of(&third), third.clone()).await;
        assert!(cache.get(key_of(&first)).is_none());
        assert!(cache.get(key_of(&second)).is_some());
        assert!(cache.get(key_of(&third)).is_some());
        assert_eq!(cache.stats().size, 2);
    }

    #[tokio::test]
    async fn rewriting_a_key_moves_it_to_most_recent() {
        let cache = Cache::new(2, None);
        let first = reply("first.example.", "192.0.2.1", 60);
        let second = reply("second.example.", "192.0.2.2", 60);
        let third = reply("third.example.", "192.0.2.3", 60);
        cache.set(key_of(&first), first.clone()).await;
        cache.set(key_of(&second), second.clone()).await;
        // Re-set the oldest key: it becomes the newest, so the next insert
        // evicts `second`.
        cache.set(key_of(&first), first.clone()).await;
        cache.set(key_of(&third), third.clone()).await;
        assert!(cache.get(key_of(&first)).is_some());
        assert!(cache.get(key_of(&second)).is_none());
        assert!(cache.get(key_of(&third)).is_some());
    }

    #[tokio::test]
    async fn list_returns_most_recent_first() {
        let cache = Cache::new(4, None);
        let first = reply("first.example.", "192.0.2.1", 60);
        let second = reply("second.example.", "192.0.2.2", 60);
        cache.set(key_of(&first), first.clone()).await;
        cache.set(key_of(&second), second.clone()).await;
        let listed = cache.list(10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, key_of(&second));
        assert_eq!(listed[1].key, key_of(&first));
        assert_eq!(cache.list(1).len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_all_entries() {
        let cache = Cache::new(4, None);
        let msg = reply("example.com.", "192.0.2.1", 60);
        cache.set(key_of(&msg), msg.clone()).await;
        cache.reset().await;
        assert!(cache.get(key_of(&msg)).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    fn past() -> SystemTime {
        // A fixed instant far enough back that any TTL has expired.
        UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    #[tokio::test]
    async fn expired_entry_without_prefetch_misses_and_evicts() {
        let cache = Cache::with_now(4, None, past);
        let msg = reply("example.com.", "192.0.2.1", 60);
        let key = key_of(&msg);
        {
            // Install an entry created far in the past.
            let mut state = cache.inner.state.write().unwrap();
            set_value(
                &cache.inner,
                &mut state,
                Value {
                    key,
                    created_at: UNIX_EPOCH,
                    msg,
                },
            );
        }
        assert!(cache.get(key).is_none());
        // The eviction runs on the worker; poll until it lands.
        for _ in 0..100 {
            if cache.stats().size == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn expired_entry_with_prefetch_serves_stale_then_refreshes() {
        let stale = reply("host.example.", "192.0.2.1", 60);
        let fresh = reply("host.example.", "192.0.2.42", 60);
        let key = key_of(&stale);
        let exchanger = Arc::new(FixedExchanger {
            replies: StdMutex::new(vec![fresh]),
            calls: AtomicUsize::new(0),
        });
        let cache = Cache::with_now(4, Some(exchanger.clone()), past);
        {
            let mut state = cache.inner.state.write().unwrap();
            set_value(
                &cache.inner,
                &mut state,
                Value {
                    key,
                    created_at: UNIX_EPOCH,
                    msg: stale,
                },
            );
        }

        // Stale answer is served immediately.
        let hit = cache.get(key).expect("stale hit");
        assert_eq!(dnsutil::answers(&hit), vec!["192.0.2.1"]);

        // The background refresh replaces it.
        for _ in 0..100 {
            if exchanger.calls.load(AtomicOrdering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let refreshed = {
            let state = cache.inner.state.read().unwrap();
            state.values.get(&key).cloned().expect("refreshed value")
        };
        assert_eq!(dnsutil::answers(&refreshed.msg), vec!["192.0.2.42"]);
        assert_eq!(refreshed.created_at, past());
    }

    #[tokio::test]
    async fn uncacheable_refresh_evicts_the_key() {
        let stale = reply("host.example.", "192.0.2.1", 60);
        let key = key_of(&stale);
        let mut bad = reply("host.example.", "192.0.2.9", 60);
        bad.set_response_code(ResponseCode::ServFail);
        let exchanger = Arc::new(FixedExchanger {
            replies: StdMutex::new(vec![bad]),
            calls: AtomicUsize::new(0),
        });
        let cache = Cache::with_now(4, Some(exchanger.clone()), past);
        {
            let mut state = cache.inner.state.write().unwrap();
            set_value(
                &cache.inner,
                &mut state,
                Value {
                    key,
                    created_at: UNIX_EPOCH,
                    msg: stale,
                },
            );
        }
        assert!(cache.get(key).is_some());
        for _ in 0..100 {
            if cache.stats().size == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn pack_unpack_round_trip() {
        let msg = reply("example.com.", "192.0.2.1", 60);
        let value = Value {
            key: 42,
            created_at: UNIX_EPOCH + Duration::from_secs(1_600_000_000),
            msg,
        };
        let packed = value.pack().unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.key, value.key);
        assert_eq!(unpacked.created_at, value.created_at);
        assert_eq!(
            unpacked.msg.to_vec().unwrap(),
            value.msg.to_vec().unwrap()
        );
    }

    #[test]
    fn unpack_rejects_malformed_input() {
        assert!(unpack("").is_err());
        assert!(unpack("1 2").is_err());
        assert!(unpack("x 2 aa").is_err());
        assert!(unpack("1 2 zz").is_err());
    }
}
