//! Reliable fire-and-forget POST delivery for instrumentation payloads.
//!
//! Analytics, telemetry and session-replay code wants to post a payload and
//! move on; this crate takes responsibility for not losing it. A send picks
//! a transport path, classifies the outcome, retries transient failures in
//! memory with configurable back-off, and persists payloads that still will
//! not go through into a capped, ordered queue. Every later successful send
//! nudges that queue to replay its oldest entries, throttled to one burst
//! per configured window.
//!
//! # Quick Start
//!
//! ```no_run
//! use beacon_transporter::BeaconClient;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = BeaconClient::new();
//! let outcome = client
//!     .send("https://collect.example.com/events", "page-view")
//!     .await;
//! println!("delivered={} dropped={}", outcome.is_success(), outcome.dropped);
//! # }
//! ```
//!
//! Sends never fail: the returned [`SendOutcome`] tags what happened
//! (`success`, `unknown`, `response`, `network`, `persisted`) and whether
//! the payload was abandoned. The queue is reachable through
//! [`BeaconClient::database`] for manual inspection and clearing.

mod beacon;
mod error;
mod factory;
mod headers;
mod options;
mod outcome;
pub mod queue;
#[cfg(test)]
mod test_support;
mod transport;

pub use error::BeaconError;
pub use factory::{post_once, BeaconClient};
pub use options::{
    BeaconInit, InMemoryRetryOptions, MeasureHook, PersistenceRetryOptions, RetryDelayFn,
};
pub use outcome::{SendOutcome, SendResult};
pub use queue::{
    ClearListener, KvQueue, ListenerId, MemoryOrderedStore, MemoryStringStore, NotifyConfig,
    OrderedQueue, OrderedStore, PersistenceQueue, RetentionConfig, RetryEntry, StoreError,
    StringStore,
};
pub use transport::{
    HttpBackend, HttpResponse, ReqwestBackend, TransportError, KEEPALIVE_BODY_LIMIT,
};

/// Crate-wide result type for the auxiliary one-shot sender.
pub type Result<T> = std::result::Result<T, BeaconError>;
