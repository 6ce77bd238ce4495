use thiserror::Error;

/// A note id that must never reach the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid note id: {0:?}")]
pub struct InvalidNoteId(pub String);

/// Failure of a single remote fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not authorized (HTTP {0})")]
    Unauthorized(u16),

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    InvalidId(#[from] InvalidNoteId),
}

impl FetchError {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FetchError::Unauthorized(status),
            _ => FetchError::Status(status),
        }
    }

    /// 401/403: the session is gone and retrying will not help.
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Unauthorized(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized(code) | FetchError::Status(code) => Some(*code),
            FetchError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Errors surfaced by the note-detail controller, worded for display.
#[derive(Error, Debug)]
pub enum NoteError {
    #[error(transparent)]
    InvalidId(#[from] InvalidNoteId),

    #[error("note not found")]
    NotFound,

    #[error("session expired, please log in again")]
    SessionEnded,

    #[error("failed to load note (HTTP {0})")]
    LoadFailed(u16),

    #[error("network error: {0}")]
    Network(String),
}

impl From<FetchError> for NoteError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidId(id) => NoteError::InvalidId(id),
            FetchError::Unauthorized(_) => NoteError::SessionEnded,
            FetchError::Status(404) => NoteError::NotFound,
            FetchError::Status(code) => NoteError::LoadFailed(code),
            FetchError::Transport(e) => NoteError::Network(e.to_string()),
            FetchError::Malformed(msg) => NoteError::Network(msg),
        }
    }
}
