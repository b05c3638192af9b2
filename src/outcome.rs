/// Final classification of one send call.
///
/// `dropped` becomes `true` only once the transporter has committed to
/// abandoning the payload: in-memory retries are exhausted (or not
/// configured for the observed failure) and the payload did not qualify
/// for persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOutcome {
    pub result: SendResult,
    pub dropped: bool,
}

/// Tagged result of a delivery attempt sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendResult {
    /// HTTP 2xx delivered.
    Success { status_code: u16 },
    /// The payload was handed off to a fire-and-forget primitive whose
    /// delivery state cannot be observed.
    Unknown,
    /// HTTP non-2xx response.
    Response { status_code: u16, raw_error: String },
    /// The request failed before a response was observed.
    Network { raw_error: String },
    /// The payload was handed to the persistence queue for later replay.
    Persisted { status_code: Option<u16> },
}

impl SendOutcome {
    pub(crate) fn settled(result: SendResult) -> Self {
        Self {
            result,
            dropped: false,
        }
    }

    pub(crate) fn abandoned(result: SendResult) -> Self {
        Self {
            result,
            dropped: true,
        }
    }

    /// True when the payload was delivered with an HTTP 2xx.
    pub fn is_success(&self) -> bool {
        matches!(self.result, SendResult::Success { .. })
    }

    /// The HTTP status observed by the final attempt, when one exists.
    pub fn status_code(&self) -> Option<u16> {
        match &self.result {
            SendResult::Success { status_code } | SendResult::Response { status_code, .. } => {
                Some(*status_code)
            }
            SendResult::Persisted { status_code } => *status_code,
            SendResult::Unknown | SendResult::Network { .. } => None,
        }
    }
}
