//! Synchronous-kv queue backend, the alternative to the ordered log.
//!
//! The whole queue is one JSON array serialized under a single key of a
//! synchronous string store. Read-modify-write over such a store is not
//! atomic, so every write goes through a process-wide advisory mutex keyed
//! on the storage key; two queues opened over the same key contend on the
//! same mutex. Policy difference from the ordered backend: exceeding
//! `max_number` wipes the whole slot instead of trimming the oldest batch.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, LazyLock, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    headers::with_retry_context,
    options::PersistenceRetryOptions,
    transport::{self, HttpBackend, TransportOutcome},
};

use super::{
    idle_gate, latch_disable, ClearListener, ListenerId, ListenerSet, NotifyConfig,
    PersistenceQueue, ReplayContext, RetryEntry, StoreError, Throttle,
};

/// Synchronous whole-value string store.
pub trait StringStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process reference store.
#[derive(Default)]
pub struct MemoryStringStore {
    inner: Mutex<HashMap<String, String>>,
}

static SHARED_STRING_STORE: LazyLock<Arc<MemoryStringStore>> =
    LazyLock::new(|| Arc::new(MemoryStringStore::new()));

impl MemoryStringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store shared by every caller, keyed storage
    /// semantics included.
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED_STRING_STORE)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .lock()
            .expect("string store mutex must not be poisoned")
    }
}

impl StringStore for MemoryStringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}

static KEY_LOCKS: LazyLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Advisory mutex over one storage key, shared across every queue in the
/// process that uses the key.
fn advisory_lock(key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = KEY_LOCKS
        .lock()
        .expect("key lock registry mutex must not be poisoned");
    Arc::clone(
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    )
}

struct KvInner {
    store: Arc<dyn StringStore>,
    key_name: String,
    max_number: usize,
    throttle: Throttle,
    listeners: ListenerSet,
    disabled: AtomicBool,
    clear_generation: AtomicU64,
    replay: ReplayContext,
}

impl KvInner {
    /// Parses the slot. A corrupt slot is dropped rather than latching the
    /// queue; the next write overwrites it.
    fn read_slot(&self) -> Result<Vec<RetryEntry>, StoreError> {
        match self.store.get(&self.key_name)? {
            None => Ok(Vec::new()),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    tracing::warn!(key = %self.key_name, error = %err, "corrupt queue slot dropped");
                    Ok(Vec::new())
                }
            },
        }
    }

    fn write_slot(&self, entries: &[RetryEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return self.store.remove(&self.key_name);
        }
        let raw = serde_json::to_string(entries)?;
        self.store.set(&self.key_name, &raw)
    }

    fn push_locked(&self, entry: RetryEntry) -> Result<(), StoreError> {
        let mut entries = self.read_slot()?;
        if entries.len() + 1 > self.max_number {
            // Overflow wipes the whole slot, the incoming entry included.
            return self.store.remove(&self.key_name);
        }
        let index = entries.partition_point(|existing| existing.timestamp <= entry.timestamp);
        entries.insert(index, entry);
        self.write_slot(&entries)
    }
}

/// [`PersistenceQueue`] over a [`StringStore`], keyed on the configured
/// store name.
pub struct KvQueue {
    inner: Arc<KvInner>,
}

impl KvQueue {
    pub fn new(
        store: Arc<dyn StringStore>,
        options: PersistenceRetryOptions,
        backend: Arc<dyn HttpBackend>,
        compress: bool,
    ) -> Self {
        Self {
            inner: Arc::new(KvInner {
                store,
                key_name: options.store_name,
                max_number: options.max_number,
                throttle: Throttle::new(options.throttle_wait),
                listeners: ListenerSet::new(),
                disabled: AtomicBool::new(false),
                clear_generation: AtomicU64::new(0),
                replay: ReplayContext {
                    backend,
                    header_name: options.header_name,
                    attempt_limit: options.attempt_limit,
                    compress,
                    use_idle: options.use_idle,
                },
            }),
        }
    }
}

#[async_trait]
impl PersistenceQueue for KvQueue {
    async fn push(&self, entry: RetryEntry) {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return;
        }
        let lock = advisory_lock(&inner.key_name);
        let _guard = lock.lock().await;
        match inner.push_locked(entry) {
            Ok(()) => inner.throttle.reset(),
            Err(err) => latch_disable(&inner.disabled, "kv", &err),
        }
    }

    async fn notify(&self, config: NotifyConfig) {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) || !inner.throttle.try_acquire() {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            drain(inner, config).await;
        });
    }

    async fn clear(&self) {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return;
        }
        inner.listeners.invoke_all();
        inner.clear_generation.fetch_add(1, Ordering::SeqCst);
        let lock = advisory_lock(&inner.key_name);
        let _guard = lock.lock().await;
        if let Err(err) = inner.store.remove(&inner.key_name) {
            latch_disable(&inner.disabled, "kv", &err);
        }
    }

    async fn peek(&self, count: usize) -> Vec<RetryEntry> {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let lock = advisory_lock(&inner.key_name);
        let _guard = lock.lock().await;
        match inner.read_slot() {
            Ok(mut entries) => {
                entries.truncate(count);
                entries
            }
            Err(err) => {
                latch_disable(&inner.disabled, "kv", &err);
                Vec::new()
            }
        }
    }

    async fn peek_back(&self, count: usize) -> Vec<RetryEntry> {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let lock = advisory_lock(&inner.key_name);
        let _guard = lock.lock().await;
        match inner.read_slot() {
            Ok(entries) => entries.into_iter().rev().take(count).collect(),
            Err(err) => {
                latch_disable(&inner.disabled, "kv", &err);
                Vec::new()
            }
        }
    }

    fn on_clear(&self, listener: ClearListener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    fn remove_on_clear(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

/// One replay burst over the whole slot: take the array, send entries in
/// order until one fails, then write the failed-but-retryable entry back
/// to the front with the untouched tail behind it, appending anything
/// pushed concurrently. A clear since the take invalidates the write-back.
async fn drain(inner: Arc<KvInner>, config: NotifyConfig) {
    idle_gate(inner.replay.use_idle).await;

    let lock = advisory_lock(&inner.key_name);
    let generation;
    let batch = {
        let _guard = lock.lock().await;
        generation = inner.clear_generation.load(Ordering::SeqCst);
        let taken = inner.read_slot().and_then(|entries| {
            inner.store.remove(&inner.key_name)?;
            Ok(entries)
        });
        match taken {
            Ok(batch) => batch,
            Err(err) => {
                latch_disable(&inner.disabled, "kv", &err);
                return;
            }
        }
    };
    if batch.is_empty() {
        return;
    }

    let mut kept: Vec<RetryEntry> = Vec::new();
    let mut requeued = false;
    let mut index = 0;
    while index < batch.len() {
        let entry = &batch[index];
        let headers = with_retry_context(
            entry.headers.as_ref(),
            inner.replay.header_name.as_deref(),
            entry.attempt_count,
            entry.status_code,
        );
        let outcome = transport::send(
            inner.replay.backend.as_ref(),
            &entry.url,
            &entry.body,
            headers,
            inner.replay.compress,
        )
        .await;

        match outcome {
            TransportOutcome::Success { .. } | TransportOutcome::Unknown => {
                tracing::debug!(url = %entry.url, "replayed persisted beacon");
                index += 1;
            }
            TransportOutcome::Response { status_code, .. } => {
                if entry.attempt_count + 1 <= inner.replay.attempt_limit
                    && config
                        .allowed_persist_retry_status_codes
                        .contains(&status_code)
                {
                    kept.push(entry.bumped());
                    requeued = true;
                }
                index += 1;
                break;
            }
            TransportOutcome::Network { .. } => {
                if entry.attempt_count + 1 <= inner.replay.attempt_limit {
                    kept.push(entry.bumped());
                    requeued = true;
                }
                index += 1;
                break;
            }
        }
    }
    kept.extend(batch.into_iter().skip(index));

    let _guard = lock.lock().await;
    if inner.clear_generation.load(Ordering::SeqCst) != generation {
        // Cleared while replaying; do not resurrect taken entries.
        return;
    }
    match inner.read_slot() {
        Ok(concurrent) => {
            kept.extend(concurrent);
            match inner.write_slot(&kept) {
                Ok(()) => {
                    if requeued {
                        inner.throttle.reset();
                    }
                }
                Err(err) => latch_disable(&inner.disabled, "kv", &err),
            }
        }
        Err(err) => latch_disable(&inner.disabled, "kv", &err),
    }
}
