//! Transport strategies over the host HTTP facility.
//!
//! The transporter never talks to the network directly; it goes through the
//! [`HttpBackend`] seam. The default backend wraps a shared
//! [`reqwest::Client`]. A keepalive-capable backend gets the keepalive
//! strategy: one attempt with keepalive enabled, retried once without it
//! when the first attempt fails at the transport level (the keepalive mode
//! caps request bodies at [`KEEPALIVE_BODY_LIMIT`]). Backends without
//! keepalive fall back to the synchronous hand-off primitive when one
//! exists, then to a plain POST.
//!
//! Every path resolves with a classified [`TransportOutcome`]; transport
//! functions never propagate errors to the caller.

use std::{collections::HashMap, io::Write};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};

/// Largest body accepted by a keepalive-mode request.
pub const KEEPALIVE_BODY_LIMIT: usize = 64 * 1024;

const CONTENT_TYPE: &str = "content-type";
const DEFAULT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";
const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Response observed by a single transport attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
}

/// Failure raised before an HTTP response was observed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Host HTTP facility consumed by the transporter.
///
/// Implementations map the host environment onto four signals: whether
/// requests may outlive the caller (`keepalive`), whether an async client
/// exists at all, current connectivity, and an optional synchronous
/// fire-and-forget hand-off.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Whether the backend supports keepalive-mode requests.
    fn supports_keepalive(&self) -> bool {
        true
    }

    /// Whether an async client is available; `false` routes sends through
    /// the one-shot fallback.
    fn supports_async_client(&self) -> bool {
        true
    }

    /// Current connectivity signal.
    fn is_online(&self) -> bool {
        true
    }

    /// Synchronous fire-and-forget hand-off. `None` when the host has no
    /// such primitive; `Some(true)` when the payload was accepted for
    /// queueing. Implementations must swallow synchronous errors.
    fn hand_off(&self, _url: &str, _body: &[u8]) -> Option<bool> {
        None
    }

    /// POSTs `body` with the given headers and resolves with the observed
    /// response, or a [`TransportError`] when none was observed.
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &HashMap<String, String>,
        keepalive: bool,
    ) -> Result<HttpResponse, TransportError>;
}

/// Default backend over a shared [`reqwest::Client`].
#[derive(Clone, Debug, Default)]
pub struct ReqwestBackend {
    http: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &HashMap<String, String>,
        keepalive: bool,
    ) -> Result<HttpResponse, TransportError> {
        if keepalive && body.len() > KEEPALIVE_BODY_LIMIT {
            return Err(TransportError(format!(
                "keepalive body exceeds {KEEPALIVE_BODY_LIMIT} bytes"
            )));
        }

        let mut request = self.http.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError(err.to_string()))?;
        let status = response.status();
        Ok(HttpResponse {
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        })
    }
}

/// Classified result of one transport-level send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TransportOutcome {
    Success { status_code: u16 },
    Unknown,
    Response { status_code: u16, raw_error: String },
    Network { raw_error: String },
}

/// Sends `body` to `url` through the backend's preferred strategy.
pub(crate) async fn send(
    backend: &dyn HttpBackend,
    url: &str,
    body: &str,
    headers: HashMap<String, String>,
    compress: bool,
) -> TransportOutcome {
    let (encoded, headers) = encode_body(body, headers, compress);

    if backend.supports_keepalive() {
        return match backend.post(url, encoded.clone(), &headers, true).await {
            Ok(response) => classify(response),
            Err(_) => classify_result(backend.post(url, encoded, &headers, false).await),
        };
    }

    // Hand-off first: the primitive cannot carry headers, so it always gets
    // the raw payload bytes.
    if backend.hand_off(url, body.as_bytes()) == Some(true) {
        return TransportOutcome::Unknown;
    }

    classify_result(backend.post(url, encoded, &headers, false).await)
}

fn classify(response: HttpResponse) -> TransportOutcome {
    if (200..300).contains(&response.status_code) {
        TransportOutcome::Success {
            status_code: response.status_code,
        }
    } else {
        TransportOutcome::Response {
            status_code: response.status_code,
            raw_error: response.status_text,
        }
    }
}

fn classify_result(result: Result<HttpResponse, TransportError>) -> TransportOutcome {
    match result {
        Ok(response) => classify(response),
        Err(TransportError(message)) => TransportOutcome::Network {
            raw_error: if message.is_empty() {
                UNKNOWN_ERROR.to_owned()
            } else {
                message
            },
        },
    }
}

/// Encodes the payload and finalizes request headers.
///
/// A failed gzip encode falls back to the raw text body.
fn encode_body(
    body: &str,
    mut headers: HashMap<String, String>,
    compress: bool,
) -> (Vec<u8>, HashMap<String, String>) {
    let encoded = if compress {
        match gzip(body.as_bytes()) {
            Ok(bytes) => {
                headers.insert("content-encoding".to_owned(), "gzip".to_owned());
                bytes
            }
            Err(_) => body.as_bytes().to_vec(),
        }
    } else {
        body.as_bytes().to_vec()
    };

    if !headers.keys().any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE)) {
        headers.insert(CONTENT_TYPE.to_owned(), DEFAULT_CONTENT_TYPE.to_owned());
    }

    (encoded, headers)
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}
