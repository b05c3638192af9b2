//! Durable retry queue: shared contract and the two backends.
//!
//! A queue stores [`RetryEntry`] records in `timestamp` order and replays
//! them cooperatively: each successful beacon notifies the queue, the
//! notify is throttled to one burst per configured window, and a burst
//! drains entries until one fails or the store runs dry. A successful push
//! resets the throttle so freshly persisted entries start draining as soon
//! as the network recovers.
//!
//! Any store-level failure latches the owning queue into a disabled state
//! for the rest of the process lifetime: pushes and clears become no-ops
//! and peeks resolve empty.

pub mod kv;
pub mod ordered;

pub use kv::{KvQueue, MemoryStringStore, StringStore};
pub use ordered::{MemoryOrderedStore, OrderedQueue, OrderedStore};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transport::HttpBackend;

/// One persisted delivery attempt awaiting replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    /// Absolute request URL.
    pub url: String,
    /// Opaque payload string.
    pub body: String,
    /// Caller request headers, excluding the retry-context header which is
    /// synthesized at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Last observed HTTP status that caused persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Millisecond epoch of the original attempt; never changes once the
    /// entry exists and orders the durable store.
    pub timestamp: u64,
    /// Total attempts already made, including in-memory ones.
    pub attempt_count: u32,
}

impl RetryEntry {
    /// Copy of the entry with one more recorded attempt. The timestamp is
    /// kept so re-enqueued entries retain their position.
    pub(crate) fn bumped(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }
}

/// Store-level failure. Observing one latches the owning queue disabled.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Backend(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Eviction policy applied by ordered stores on push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Cap on stored entries.
    pub max_number: usize,
    /// How many of the oldest entries to evict once the cap is exceeded.
    pub batch_eviction_number: usize,
}

/// Per-notify replay parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifyConfig {
    /// Response status codes that keep a replayed entry in the queue.
    pub allowed_persist_retry_status_codes: Vec<u16>,
}

/// Callback invoked synchronously when the queue is cleared.
pub type ClearListener = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a registered clear listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Contract shared by the ordered-log and synchronous-kv backends.
#[async_trait]
pub trait PersistenceQueue: Send + Sync {
    /// Enqueues an entry; a success resets the notify throttle.
    async fn push(&self, entry: RetryEntry);

    /// Signals that replay may proceed. At most one replay burst runs per
    /// throttle window.
    async fn notify(&self, config: NotifyConfig);

    /// Invokes every registered listener, then deletes all entries.
    async fn clear(&self);

    /// Oldest `count` entries, oldest first.
    async fn peek(&self, count: usize) -> Vec<RetryEntry>;

    /// Newest `count` entries, newest first.
    async fn peek_back(&self, count: usize) -> Vec<RetryEntry>;

    fn on_clear(&self, listener: ClearListener) -> ListenerId;

    fn remove_on_clear(&self, id: ListenerId) -> bool;
}

/// Unordered set of clear listeners, mutated without suspension points.
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, ClearListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, listener: ClearListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener mutex must not be poisoned")
            .insert(id, listener);
        ListenerId(id)
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .expect("listener mutex must not be poisoned")
            .remove(&id.0)
            .is_some()
    }

    /// Invokes every listener exactly once, outside the lock.
    pub fn invoke_all(&self) {
        let listeners: Vec<ClearListener> = self
            .listeners
            .lock()
            .expect("listener mutex must not be poisoned")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

/// Leading-edge throttle over replay bursts.
pub(crate) struct Throttle {
    wait: Duration,
    last_burst: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            last_burst: Mutex::new(None),
        }
    }

    /// Claims the current window. Returns `false` while a prior burst is
    /// still within `wait`.
    pub fn try_acquire(&self) -> bool {
        let mut last = self
            .last_burst
            .lock()
            .expect("throttle mutex must not be poisoned");
        match *last {
            Some(at) if at.elapsed() < self.wait => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Reopens the window so the next notify fires immediately.
    pub fn reset(&self) {
        *self
            .last_burst
            .lock()
            .expect("throttle mutex must not be poisoned") = None;
    }
}

/// Everything a spawned replay burst needs besides the store.
#[derive(Clone)]
pub(crate) struct ReplayContext {
    pub backend: Arc<dyn HttpBackend>,
    pub header_name: Option<String>,
    pub attempt_limit: u32,
    pub compress: bool,
    pub use_idle: bool,
}

const IDLE_FALLBACK_TIMEOUT: Duration = Duration::from_millis(10);

/// Yields before a replay step: a short-timeout stand-in for an idle
/// scheduler when `use_idle` is set, otherwise the next task tick.
pub(crate) async fn idle_gate(use_idle: bool) {
    if use_idle {
        tokio::time::sleep(IDLE_FALLBACK_TIMEOUT).await;
    } else {
        tokio::task::yield_now().await;
    }
}

/// Latches a queue into the disabled state, logging the first failure.
pub(crate) fn latch_disable(disabled: &AtomicBool, queue: &'static str, err: &StoreError) {
    if !disabled.swap(true, Ordering::SeqCst) {
        tracing::warn!(
            queue,
            error = %err,
            "store failure; persistence disabled for the process lifetime"
        );
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
