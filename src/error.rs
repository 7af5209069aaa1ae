use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the coordination client and the recipes built on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The bounded operation did not finish within the caller's budget.
    #[error("operation timed out")]
    Timeout,

    /// A participant node this instance created is no longer listed.
    #[error("session lost: participant node is gone")]
    SessionLost,

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("connection lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    /// A child name that does not follow the `label-guid-sequence` scheme.
    #[error("malformed participant name: {0}")]
    MalformedName(String),

    #[error("coordination error: {0}")]
    Client(String),
}

impl Error {
    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }
}
