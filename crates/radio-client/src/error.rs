use thiserror::Error;

/// Failure of a single metadata or schedule fetch.  Never leaves the
/// component that issued the request.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Failure talking to the player.  The session turns these into
/// `PlaybackState::Error`.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("player could not be started: {0}")]
    Spawn(String),

    #[error("player IPC error: {0}")]
    Ipc(String),

    #[error("player not connected")]
    NotConnected,
}

impl From<anyhow::Error> for HostError {
    fn from(e: anyhow::Error) -> Self {
        HostError::Ipc(e.to_string())
    }
}
