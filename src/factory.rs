//! Client assembly: defaults, shared queue wiring, capability fallbacks.

use std::{collections::HashMap, sync::Arc, time::Instant};

use crate::{
    beacon::{Beacon, PersistenceFacade},
    options::{BeaconInit, InMemoryRetryOptions},
    outcome::{SendOutcome, SendResult},
    queue::{MemoryOrderedStore, OrderedQueue, PersistenceQueue},
    transport::{HttpBackend, ReqwestBackend},
};

/// Entry point of the crate: wires a shared persistence queue to every
/// send it produces.
///
/// One client owns one queue; concurrent sends share it by reference and
/// replay its entries cooperatively on success.
pub struct BeaconClient {
    backend: Arc<dyn HttpBackend>,
    in_memory: InMemoryRetryOptions,
    queue: Arc<dyn PersistenceQueue>,
    persist_status_codes: Vec<u16>,
    persistence_disabled: bool,
    compress: bool,
}

impl BeaconClient {
    /// Creates a client with default options over the default backend.
    pub fn new() -> Self {
        Self::with_options(BeaconInit::default())
    }

    /// Creates a client from merged options.
    ///
    /// A retry-context header name set on the in-memory options but not on
    /// the persistence options is inherited by persistence.
    pub fn with_options(init: BeaconInit) -> Self {
        let backend = init
            .backend
            .unwrap_or_else(|| Arc::new(ReqwestBackend::new()) as Arc<dyn HttpBackend>);

        let mut persistence = init.persistence;
        if persistence.header_name.is_none() {
            persistence.header_name = init.in_memory.header_name.clone();
        }
        let persist_status_codes = persistence.status_codes.clone();
        let measure = persistence.measure.clone();

        let queue = init.queue.unwrap_or_else(|| {
            let opened_at = Instant::now();
            let store = MemoryOrderedStore::shared(&persistence.store_name);
            if let Some(measure) = &measure {
                measure("store-open", opened_at.elapsed());
            }
            Arc::new(OrderedQueue::new(
                store,
                persistence,
                Arc::clone(&backend),
                init.compress,
            )) as Arc<dyn PersistenceQueue>
        });

        Self {
            backend,
            in_memory: init.in_memory,
            queue,
            persist_status_codes,
            persistence_disabled: init.disable_persistence_retry,
            compress: init.compress,
        }
    }

    /// Delivers `body` to `url`, retrying and persisting per the client
    /// configuration. Never fails; the outcome carries the classification.
    pub async fn send(&self, url: &str, body: &str) -> SendOutcome {
        self.send_with_headers(url, body, None).await
    }

    /// Like [`BeaconClient::send`] with caller request headers.
    pub async fn send_with_headers(
        &self,
        url: &str,
        body: &str,
        headers: Option<HashMap<String, String>>,
    ) -> SendOutcome {
        if !self.backend.supports_async_client() {
            // Last resort: a fire-and-forget one-shot POST whose outcome is
            // unobservable.
            let url = url.to_owned();
            let body = body.to_owned();
            let headers = headers.unwrap_or_default();
            tokio::spawn(async move {
                let _ = post_once(&url, &body, &headers).await;
            });
            return SendOutcome::abandoned(SendResult::Unknown);
        }

        Beacon::new(
            url,
            body,
            Arc::clone(&self.backend),
            self.in_memory.clone(),
            PersistenceFacade {
                queue: (!self.persistence_disabled).then(|| Arc::clone(&self.queue)),
                status_codes: self.persist_status_codes.clone(),
            },
            self.compress,
        )
        .send(headers)
        .await
    }

    /// The persistence queue shared by every send of this client.
    pub fn database(&self) -> Arc<dyn PersistenceQueue> {
        Arc::clone(&self.queue)
    }
}

impl Default for BeaconClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal one-shot POST with no retry behavior, for hosts where the full
/// transporter cannot run.
pub async fn post_once(
    url: &str,
    body: &str,
    headers: &HashMap<String, String>,
) -> crate::Result<u16> {
    let client = reqwest::Client::new();
    let mut request = client.post(url).body(body.to_owned());
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await?;
    Ok(response.status().as_u16())
}
