use std::{fmt, sync::Arc, time::Duration};

use crate::{queue::PersistenceQueue, transport::HttpBackend};

/// Computes the sleep before the next in-memory attempt.
///
/// Receives the 1-based attempt number that just failed and the number of
/// retries still available.
pub type RetryDelayFn = Arc<dyn Fn(u32, u32) -> Duration + Send + Sync>;

/// Optional instrumentation hook; receives a label and an elapsed duration.
pub type MeasureHook = Arc<dyn Fn(&'static str, Duration) + Send + Sync>;

/// Configures the in-memory retry performed within one send call.
#[derive(Clone)]
pub struct InMemoryRetryOptions {
    /// Maximum number of retries after the initial attempt.
    pub attempt_limit: u32,
    /// Response status codes eligible for in-memory retry.
    pub status_codes: Vec<u16>,
    /// Name of the retry-context header; unset means no header is emitted.
    pub header_name: Option<String>,
    /// Back-off schedule between attempts.
    pub calculate_retry_delay: RetryDelayFn,
}

impl Default for InMemoryRetryOptions {
    fn default() -> Self {
        Self {
            attempt_limit: 0,
            status_codes: vec![502, 504],
            header_name: None,
            calculate_retry_delay: Arc::new(|attempt, _count_left| {
                Duration::from_millis(u64::from(attempt) * 2000)
            }),
        }
    }
}

impl fmt::Debug for InMemoryRetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRetryOptions")
            .field("attempt_limit", &self.attempt_limit)
            .field("status_codes", &self.status_codes)
            .field("header_name", &self.header_name)
            .field("calculate_retry_delay", &"<fn>")
            .finish()
    }
}

/// Configures the durable retry queue shared by all sends of one client.
#[derive(Clone)]
pub struct PersistenceRetryOptions {
    /// Name of the durable store backing the queue.
    pub store_name: String,
    /// Total attempts a persisted entry may accumulate before it is dropped.
    pub attempt_limit: u32,
    /// Response status codes eligible for persistence.
    pub status_codes: Vec<u16>,
    /// Cap on stored entries.
    pub max_number: usize,
    /// How many of the oldest entries an ordered store evicts at once when
    /// the cap is exceeded.
    pub batch_eviction_number: usize,
    /// Minimum spacing between replay bursts.
    pub throttle_wait: Duration,
    /// Retry-context header name; inherits the in-memory name when unset.
    pub header_name: Option<String>,
    /// Schedule replay steps through the idle-time gate instead of the next
    /// task tick.
    pub use_idle: bool,
    /// Observes the duration of the store open performed by the factory.
    pub measure: Option<MeasureHook>,
}

impl Default for PersistenceRetryOptions {
    fn default() -> Self {
        Self {
            store_name: "beacon-transporter".to_owned(),
            attempt_limit: 3,
            status_codes: vec![429, 503],
            max_number: 1000,
            batch_eviction_number: 300,
            throttle_wait: Duration::from_secs(5 * 60),
            header_name: None,
            use_idle: false,
            measure: None,
        }
    }
}

impl fmt::Debug for PersistenceRetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceRetryOptions")
            .field("store_name", &self.store_name)
            .field("attempt_limit", &self.attempt_limit)
            .field("status_codes", &self.status_codes)
            .field("max_number", &self.max_number)
            .field("batch_eviction_number", &self.batch_eviction_number)
            .field("throttle_wait", &self.throttle_wait)
            .field("header_name", &self.header_name)
            .field("use_idle", &self.use_idle)
            .field("measure", &self.measure.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Top-level client configuration.
#[derive(Clone, Default)]
pub struct BeaconInit {
    pub in_memory: InMemoryRetryOptions,
    pub persistence: PersistenceRetryOptions,
    /// Gzip the payload and set `content-encoding: gzip`.
    pub compress: bool,
    /// Skip the persistence path entirely; failures only retry in memory.
    pub disable_persistence_retry: bool,
    /// Caller-supplied queue; the factory builds an ordered-log queue over
    /// the named shared store when unset.
    pub queue: Option<Arc<dyn PersistenceQueue>>,
    /// Caller-supplied HTTP backend; defaults to [`crate::ReqwestBackend`].
    pub backend: Option<Arc<dyn HttpBackend>>,
}

impl fmt::Debug for BeaconInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconInit")
            .field("in_memory", &self.in_memory)
            .field("persistence", &self.persistence)
            .field("compress", &self.compress)
            .field("disable_persistence_retry", &self.disable_persistence_retry)
            .field("queue", &self.queue.as_ref().map(|_| "<queue>"))
            .field("backend", &self.backend.as_ref().map(|_| "<backend>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{InMemoryRetryOptions, PersistenceRetryOptions};

    #[test]
    fn in_memory_defaults() {
        let options = InMemoryRetryOptions::default();
        assert_eq!(options.attempt_limit, 0);
        assert_eq!(options.status_codes, vec![502, 504]);
        assert!(options.header_name.is_none());
        assert_eq!(
            (options.calculate_retry_delay)(2, 1),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn persistence_defaults() {
        let options = PersistenceRetryOptions::default();
        assert_eq!(options.store_name, "beacon-transporter");
        assert_eq!(options.attempt_limit, 3);
        assert_eq!(options.status_codes, vec![429, 503]);
        assert_eq!(options.max_number, 1000);
        assert_eq!(options.batch_eviction_number, 300);
        assert_eq!(options.throttle_wait, Duration::from_secs(300));
        assert!(!options.use_idle);
    }
}
