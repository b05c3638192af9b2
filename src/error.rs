/// Errors surfaced by the auxiliary one-shot sender.
///
/// The main [`crate::BeaconClient::send`] path never returns an error; it
/// always resolves with a tagged [`crate::SendOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    /// The request failed before an HTTP response was observed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
