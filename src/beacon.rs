//! Per-call send task: the attempt loop and its persistence decisions.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::time::sleep;

use crate::{
    headers::with_retry_context,
    options::InMemoryRetryOptions,
    outcome::{SendOutcome, SendResult},
    queue::{epoch_millis, ListenerId, NotifyConfig, PersistenceQueue, RetryEntry},
    transport::{self, HttpBackend, TransportOutcome},
};

/// Removes the clear listener when the send task settles, on every path.
struct ClearGuard {
    queue: Arc<dyn PersistenceQueue>,
    id: ListenerId,
}

impl Drop for ClearGuard {
    fn drop(&mut self) {
        self.queue.remove_on_clear(self.id);
    }
}

/// Persistence as seen by one send task.
#[derive(Clone)]
pub(crate) struct PersistenceFacade {
    /// `None` when persistence is disabled for this client.
    pub queue: Option<Arc<dyn PersistenceQueue>>,
    /// Status codes eligible for persistence.
    pub status_codes: Vec<u16>,
}

/// One payload and the state of its delivery attempt sequence.
///
/// Born per send call; the timestamp captured here identifies the payload
/// in the persistence queue for its whole retry lifetime.
pub(crate) struct Beacon {
    url: String,
    body: String,
    backend: Arc<dyn HttpBackend>,
    in_memory: InMemoryRetryOptions,
    persistence: PersistenceFacade,
    compress: bool,
    timestamp: u64,
}

impl Beacon {
    pub(crate) fn new(
        url: &str,
        body: &str,
        backend: Arc<dyn HttpBackend>,
        in_memory: InMemoryRetryOptions,
        persistence: PersistenceFacade,
        compress: bool,
    ) -> Self {
        Self {
            url: url.to_owned(),
            body: body.to_owned(),
            backend,
            in_memory,
            persistence,
            compress,
            timestamp: epoch_millis(),
        }
    }

    pub(crate) async fn send(self, caller_headers: Option<HashMap<String, String>>) -> SendOutcome {
        // Any clear that begins while this send is in flight suppresses both
        // persistence and the post-success notify, so cleared data cannot be
        // resurrected by a request that raced the clear.
        let clear_pending = Arc::new(AtomicBool::new(false));
        let _guard = self.persistence.queue.as_ref().map(|queue| {
            let flag = Arc::clone(&clear_pending);
            let id = queue.on_clear(Arc::new(move || flag.store(true, Ordering::SeqCst)));
            ClearGuard {
                queue: Arc::clone(queue),
                id,
            }
        });

        let mut retry_count_left = self.in_memory.attempt_limit;
        let mut last_error_code: Option<u16> = None;

        loop {
            let attempt = self.in_memory.attempt_limit - retry_count_left + 1;
            let headers = with_retry_context(
                caller_headers.as_ref(),
                self.in_memory.header_name.as_deref(),
                attempt - 1,
                last_error_code,
            );
            let outcome = transport::send(
                self.backend.as_ref(),
                &self.url,
                &self.body,
                headers,
                self.compress,
            )
            .await;

            let failure = match outcome {
                TransportOutcome::Success { status_code } => {
                    self.notify_queue(&clear_pending).await;
                    return SendOutcome::settled(SendResult::Success { status_code });
                }
                TransportOutcome::Unknown => {
                    self.notify_queue(&clear_pending).await;
                    return SendOutcome::settled(SendResult::Unknown);
                }
                failure => failure,
            };

            let (status_code, is_network) = match &failure {
                TransportOutcome::Response { status_code, .. } => (Some(*status_code), false),
                _ => (None, true),
            };

            let persistable = self.persistence.queue.is_some()
                && !clear_pending.load(Ordering::SeqCst)
                && (!self.backend.is_online()
                    || (retry_count_left == 0 && is_network)
                    || (!is_network
                        && status_code
                            .is_some_and(|code| self.persistence.status_codes.contains(&code))));
            if persistable {
                if let Some(queue) = &self.persistence.queue {
                    queue
                        .push(RetryEntry {
                            url: self.url.clone(),
                            body: self.body.clone(),
                            headers: caller_headers.clone(),
                            status_code,
                            timestamp: self.timestamp,
                            attempt_count: attempt,
                        })
                        .await;
                }
                return SendOutcome::settled(SendResult::Persisted { status_code });
            }

            let retryable = retry_count_left > 0
                && (is_network
                    || status_code.is_some_and(|code| self.in_memory.status_codes.contains(&code)));
            if retryable {
                let delay = (self.in_memory.calculate_retry_delay)(attempt, retry_count_left);
                tracing::debug!(
                    url = %self.url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying beacon in memory"
                );
                sleep(delay).await;
                last_error_code = status_code;
                retry_count_left -= 1;
                continue;
            }

            return SendOutcome::abandoned(match failure {
                TransportOutcome::Response {
                    status_code,
                    raw_error,
                } => SendResult::Response {
                    status_code,
                    raw_error,
                },
                TransportOutcome::Network { raw_error } => SendResult::Network { raw_error },
                // Success and Unknown returned above.
                TransportOutcome::Success { status_code } => SendResult::Success { status_code },
                TransportOutcome::Unknown => SendResult::Unknown,
            });
        }
    }

    async fn notify_queue(&self, clear_pending: &AtomicBool) {
        if clear_pending.load(Ordering::SeqCst) {
            return;
        }
        if let Some(queue) = &self.persistence.queue {
            queue
                .notify(NotifyConfig {
                    allowed_persist_retry_status_codes: self.persistence.status_codes.clone(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Arc,
        time::Duration,
    };

    use crate::{
        options::{InMemoryRetryOptions, PersistenceRetryOptions},
        outcome::SendResult,
        queue::{ordered::MemoryOrderedStore, OrderedQueue, PersistenceQueue},
        test_support::{ScriptedBackend, Step},
    };

    use super::{Beacon, PersistenceFacade};

    fn fast_retry(attempt_limit: u32) -> InMemoryRetryOptions {
        InMemoryRetryOptions {
            attempt_limit,
            calculate_retry_delay: Arc::new(|_, _| Duration::from_millis(1)),
            ..InMemoryRetryOptions::default()
        }
    }

    fn ordered_queue(backend: &Arc<ScriptedBackend>) -> Arc<dyn PersistenceQueue> {
        Arc::new(OrderedQueue::new(
            Arc::new(MemoryOrderedStore::new()) as _,
            PersistenceRetryOptions::default(),
            Arc::clone(backend) as _,
            false,
        ))
    }

    fn beacon(
        backend: &Arc<ScriptedBackend>,
        in_memory: InMemoryRetryOptions,
        queue: Option<Arc<dyn PersistenceQueue>>,
    ) -> Beacon {
        Beacon::new(
            "https://collect/x",
            "payload",
            Arc::clone(backend) as _,
            in_memory,
            PersistenceFacade {
                queue,
                status_codes: vec![429, 503],
            },
            false,
        )
    }

    #[tokio::test]
    async fn success_settles_without_drop() {
        let backend = Arc::new(ScriptedBackend::plain([Step::Status(200)]));
        let outcome = beacon(&backend, fast_retry(0), None).send(None).await;
        assert_eq!(outcome.result, SendResult::Success { status_code: 200 });
        assert!(!outcome.dropped);

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://collect/x");
        assert_eq!(calls[0].body, b"payload".to_vec());
    }

    #[tokio::test]
    async fn configured_status_persists_with_the_attempt_count() {
        let backend = Arc::new(ScriptedBackend::plain([Step::Status(429)]));
        let queue = ordered_queue(&backend);
        let outcome = beacon(&backend, fast_retry(0), Some(Arc::clone(&queue)))
            .send(None)
            .await;

        assert_eq!(
            outcome.result,
            SendResult::Persisted {
                status_code: Some(429)
            }
        );
        assert!(!outcome.dropped);

        let entries = queue.peek(10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 1);
        assert_eq!(entries[0].status_code, Some(429));
        assert_eq!(entries[0].body, "payload");
    }

    #[tokio::test]
    async fn unconfigured_status_is_dropped() {
        let backend = Arc::new(ScriptedBackend::plain([Step::Status(404)]));
        let queue = ordered_queue(&backend);
        let outcome = beacon(&backend, fast_retry(0), Some(Arc::clone(&queue)))
            .send(None)
            .await;

        assert!(outcome.dropped);
        assert!(matches!(
            outcome.result,
            SendResult::Response {
                status_code: 404,
                ..
            }
        ));
        assert!(queue.peek(10).await.is_empty());
    }

    #[tokio::test]
    async fn retryable_status_retries_in_memory_then_succeeds() {
        let backend = Arc::new(ScriptedBackend::plain([
            Step::Status(502),
            Step::Status(200),
        ]));
        let mut in_memory = fast_retry(2);
        in_memory.header_name = Some("x-retry-context".to_owned());

        let outcome = beacon(&backend, in_memory, None).send(None).await;
        assert_eq!(outcome.result, SendResult::Success { status_code: 200 });

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].headers.contains_key("x-retry-context"));
        assert_eq!(
            calls[1].headers.get("x-retry-context").map(String::as_str),
            Some(r#"{"attempt":1,"errorCode":502}"#)
        );
    }

    #[tokio::test]
    async fn exhausted_network_retries_persist_the_payload() {
        let backend = Arc::new(ScriptedBackend::plain([
            Step::Fail("reset"),
            Step::Fail("reset"),
            Step::Fail("reset"),
        ]));
        let queue = ordered_queue(&backend);
        let outcome = beacon(&backend, fast_retry(2), Some(Arc::clone(&queue)))
            .send(None)
            .await;

        assert_eq!(
            outcome.result,
            SendResult::Persisted { status_code: None }
        );

        let entries = queue.peek(10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].status_code, None);
    }

    #[tokio::test]
    async fn exhausted_network_retries_drop_without_a_queue() {
        let backend = Arc::new(ScriptedBackend::plain([
            Step::Fail("reset"),
            Step::Fail("reset"),
        ]));
        let outcome = beacon(&backend, fast_retry(1), None).send(None).await;

        assert!(outcome.dropped);
        assert!(matches!(outcome.result, SendResult::Network { .. }));
    }

    #[tokio::test]
    async fn offline_backend_persists_on_first_failure() {
        let backend = Arc::new(ScriptedBackend::plain([Step::Fail("unreachable")]));
        backend.set_online(false);
        let queue = ordered_queue(&backend);

        let outcome = beacon(&backend, fast_retry(2), Some(Arc::clone(&queue)))
            .send(None)
            .await;

        assert_eq!(outcome.result, SendResult::Persisted { status_code: None });
        let entries = queue.peek(10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 1);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn clear_during_flight_suppresses_persistence() {
        let backend = Arc::new(
            ScriptedBackend::plain([Step::Status(429)]).with_delay(Duration::from_millis(80)),
        );
        let queue = ordered_queue(&backend);

        let in_flight = tokio::spawn(
            beacon(&backend, fast_retry(0), Some(Arc::clone(&queue))).send(None),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear().await;

        let outcome = in_flight.await.expect("send task must not panic");
        assert!(outcome.dropped);
        assert!(matches!(
            outcome.result,
            SendResult::Response {
                status_code: 429,
                ..
            }
        ));
        assert!(queue.peek(10).await.is_empty());
    }

    #[tokio::test]
    async fn beacon_started_after_a_clear_still_persists() {
        let backend = Arc::new(ScriptedBackend::plain([Step::Status(429)]));
        let queue = ordered_queue(&backend);
        queue.clear().await;

        let outcome = beacon(&backend, fast_retry(0), Some(Arc::clone(&queue)))
            .send(None)
            .await;
        assert_eq!(
            outcome.result,
            SendResult::Persisted {
                status_code: Some(429)
            }
        );
        assert_eq!(queue.peek(10).await.len(), 1);
    }

    #[tokio::test]
    async fn caller_headers_are_persisted_without_the_retry_context() {
        let backend = Arc::new(ScriptedBackend::plain([
            Step::Status(502),
            Step::Status(503),
        ]));
        let queue = ordered_queue(&backend);
        let mut in_memory = fast_retry(1);
        in_memory.header_name = Some("x-retry-context".to_owned());

        let headers = HashMap::from([("x-app".to_owned(), "demo".to_owned())]);
        let outcome = beacon(&backend, in_memory, Some(Arc::clone(&queue)))
            .send(Some(headers.clone()))
            .await;
        assert!(matches!(outcome.result, SendResult::Persisted { .. }));

        let entries = queue.peek(10).await;
        assert_eq!(entries[0].headers.as_ref(), Some(&headers));
        assert_eq!(entries[0].attempt_count, 2);
        assert_eq!(entries[0].status_code, Some(503));
    }
}
