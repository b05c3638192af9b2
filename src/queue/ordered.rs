//! Ordered-log queue backend, the factory default.
//!
//! Entries live in an indexed store keyed on `(timestamp, seq)`; the
//! monotone sequence disambiguates entries persisted within the same
//! millisecond. The store seam is [`OrderedStore`]; the in-process
//! reference implementation keeps named instances in a process-wide
//! registry so queues opened under the same store name observe the same
//! entries, mirroring same-origin storage shared across contexts.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
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
    PersistenceQueue, ReplayContext, RetentionConfig, RetryEntry, StoreError, Throttle,
};

/// Indexed store keyed on timestamp, linearized by the implementation.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Inserts an entry, evicting the oldest batch when the cap is hit.
    async fn push(&self, entry: RetryEntry, retention: &RetentionConfig) -> Result<(), StoreError>;

    /// Conditional insert that no-ops while a clear is in progress.
    /// Returns whether the entry was stored.
    async fn push_if_not_clearing(
        &self,
        entry: RetryEntry,
        retention: &RetentionConfig,
    ) -> Result<bool, StoreError>;

    /// Removes and returns the oldest entry.
    async fn shift(&self) -> Result<Option<RetryEntry>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Oldest `count` entries, oldest first.
    async fn peek(&self, count: usize) -> Result<Vec<RetryEntry>, StoreError>;

    /// Newest `count` entries, newest first.
    async fn peek_back(&self, count: usize) -> Result<Vec<RetryEntry>, StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    entries: BTreeMap<(u64, u64), RetryEntry>,
    next_seq: u64,
    clearing: bool,
}

/// In-process reference store.
#[derive(Default)]
pub struct MemoryOrderedStore {
    inner: Mutex<MemoryStoreInner>,
}

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<MemoryOrderedStore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl MemoryOrderedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the process-wide store registered under `name`, creating it on
    /// first use.
    pub fn shared(name: &str) -> Arc<Self> {
        let mut registry = REGISTRY
            .lock()
            .expect("store registry mutex must not be poisoned");
        Arc::clone(
            registry
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Self::new())),
        )
    }

    fn insert(inner: &mut MemoryStoreInner, entry: RetryEntry, retention: &RetentionConfig) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert((entry.timestamp, seq), entry);

        if inner.entries.len() > retention.max_number {
            let oldest: Vec<(u64, u64)> = inner
                .entries
                .keys()
                .take(retention.batch_eviction_number)
                .copied()
                .collect();
            for key in oldest {
                inner.entries.remove(&key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner
            .lock()
            .expect("memory store mutex must not be poisoned")
    }
}

#[async_trait]
impl OrderedStore for MemoryOrderedStore {
    async fn push(&self, entry: RetryEntry, retention: &RetentionConfig) -> Result<(), StoreError> {
        Self::insert(&mut self.lock(), entry, retention);
        Ok(())
    }

    async fn push_if_not_clearing(
        &self,
        entry: RetryEntry,
        retention: &RetentionConfig,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.clearing {
            return Ok(false);
        }
        Self::insert(&mut inner, entry, retention);
        Ok(true)
    }

    async fn shift(&self) -> Result<Option<RetryEntry>, StoreError> {
        let mut inner = self.lock();
        let Some(key) = inner.entries.keys().next().copied() else {
            return Ok(None);
        };
        Ok(inner.entries.remove(&key))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.clearing = true;
        inner.entries.clear();
        inner.clearing = false;
        Ok(())
    }

    async fn peek(&self, count: usize) -> Result<Vec<RetryEntry>, StoreError> {
        Ok(self.lock().entries.values().take(count).cloned().collect())
    }

    async fn peek_back(&self, count: usize) -> Result<Vec<RetryEntry>, StoreError> {
        Ok(self
            .lock()
            .entries
            .values()
            .rev()
            .take(count)
            .cloned()
            .collect())
    }
}

struct OrderedInner {
    store: Arc<dyn OrderedStore>,
    retention: RetentionConfig,
    throttle: Throttle,
    listeners: ListenerSet,
    disabled: AtomicBool,
    replay: ReplayContext,
}

/// [`PersistenceQueue`] over an [`OrderedStore`].
pub struct OrderedQueue {
    inner: Arc<OrderedInner>,
}

impl OrderedQueue {
    pub fn new(
        store: Arc<dyn OrderedStore>,
        options: PersistenceRetryOptions,
        backend: Arc<dyn HttpBackend>,
        compress: bool,
    ) -> Self {
        Self {
            inner: Arc::new(OrderedInner {
                store,
                retention: RetentionConfig {
                    max_number: options.max_number,
                    batch_eviction_number: options.batch_eviction_number,
                },
                throttle: Throttle::new(options.throttle_wait),
                listeners: ListenerSet::new(),
                disabled: AtomicBool::new(false),
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
impl PersistenceQueue for OrderedQueue {
    async fn push(&self, entry: RetryEntry) {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return;
        }
        match inner.store.push(entry, &inner.retention).await {
            Ok(()) => inner.throttle.reset(),
            Err(err) => latch_disable(&inner.disabled, "ordered", &err),
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
        if let Err(err) = inner.store.clear().await {
            latch_disable(&inner.disabled, "ordered", &err);
        }
    }

    async fn peek(&self, count: usize) -> Vec<RetryEntry> {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return Vec::new();
        }
        match inner.store.peek(count).await {
            Ok(entries) => entries,
            Err(err) => {
                latch_disable(&inner.disabled, "ordered", &err);
                Vec::new()
            }
        }
    }

    async fn peek_back(&self, count: usize) -> Vec<RetryEntry> {
        let inner = &self.inner;
        if inner.disabled.load(Ordering::SeqCst) {
            return Vec::new();
        }
        match inner.store.peek_back(count).await {
            Ok(entries) => entries,
            Err(err) => {
                latch_disable(&inner.disabled, "ordered", &err);
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

/// One replay burst: pop, send, reconcile, until a failure or an empty
/// store stops it.
async fn drain(inner: Arc<OrderedInner>, config: NotifyConfig) {
    loop {
        idle_gate(inner.replay.use_idle).await;

        let entry = match inner.store.shift().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                latch_disable(&inner.disabled, "ordered", &err);
                break;
            }
        };

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
            }
            TransportOutcome::Response { status_code, .. } => {
                if entry.attempt_count + 1 <= inner.replay.attempt_limit
                    && config
                        .allowed_persist_retry_status_codes
                        .contains(&status_code)
                {
                    requeue(&inner, entry).await;
                }
                break;
            }
            TransportOutcome::Network { .. } => {
                if entry.attempt_count + 1 <= inner.replay.attempt_limit {
                    requeue(&inner, entry).await;
                }
                break;
            }
        }
    }
}

async fn requeue(inner: &OrderedInner, entry: RetryEntry) {
    match inner
        .store
        .push_if_not_clearing(entry.bumped(), &inner.retention)
        .await
    {
        Ok(true) => inner.throttle.reset(),
        Ok(false) => {}
        Err(err) => latch_disable(&inner.disabled, "ordered", &err),
    }
}
