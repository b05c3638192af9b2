//! Scripted HTTP backend shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::transport::{HttpBackend, HttpResponse, TransportError};

/// One scripted transport result; popped per `post` call. An exhausted
/// script answers 200.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Step {
    Status(u16),
    Fail(&'static str),
}

/// A single recorded `post` invocation.
#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub keepalive: bool,
}

pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    online: AtomicBool,
    keepalive: bool,
    hand_off: Option<bool>,
    delay: Duration,
}

impl ScriptedBackend {
    /// Backend without keepalive or hand-off; one `post` per attempt.
    pub fn plain(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            keepalive: false,
            hand_off: None,
            delay: Duration::ZERO,
        }
    }

    /// Delays every `post` response, leaving room to interleave other work.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keepalive-capable backend; failed attempts consume two steps.
    pub fn keepalive(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            keepalive: true,
            ..Self::plain(steps)
        }
    }

    /// Backend without keepalive whose hand-off primitive answers `result`.
    pub fn with_hand_off(result: Option<bool>) -> Self {
        Self {
            hand_off: result,
            ..Self::plain([])
        }
    }

    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script
            .lock()
            .expect("script mutex must not be poisoned")
            .extend(steps);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .expect("calls mutex must not be poisoned")
            .clone()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    fn supports_keepalive(&self) -> bool {
        self.keepalive
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn hand_off(&self, _url: &str, _body: &[u8]) -> Option<bool> {
        self.hand_off
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &HashMap<String, String>,
        keepalive: bool,
    ) -> Result<HttpResponse, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls
            .lock()
            .expect("calls mutex must not be poisoned")
            .push(Call {
                url: url.to_owned(),
                body,
                headers: headers.clone(),
                keepalive,
            });

        let step = self
            .script
            .lock()
            .expect("script mutex must not be poisoned")
            .pop_front()
            .unwrap_or(Step::Status(200));
        match step {
            Step::Status(status_code) => Ok(HttpResponse {
                status_code,
                status_text: String::new(),
            }),
            Step::Fail(message) => Err(TransportError(message.to_owned())),
        }
    }
}
