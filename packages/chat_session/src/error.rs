//! Error taxonomy for the session engine.

/// Errors surfaced to callers of the session engine and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("not connected to the chat server")]
    NotConnected,

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("username must not be empty")]
    InvalidUsername,

    #[error("only your own messages can be deleted")]
    NotOwner,

    #[error("a session is already active")]
    AlreadyStarted,

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::NotConnected => "not_connected",
            Self::Validation(_) => "validation",
            Self::InvalidUsername => "invalid_username",
            Self::NotOwner => "not_owner",
            Self::AlreadyStarted => "already_started",
            Self::Cancelled => "cancelled",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
        }
    }

    /// Whether the user can fix this by changing their input rather than
    /// waiting for connectivity.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidUsername | Self::NotOwner
        )
    }
}

/// Inbound frame could not be turned into a [`crate::ChatEvent`].
///
/// These are logged and discarded by the supervisor, never shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame has no type field")]
    MissingType,

    #[error("unknown frame type {0:?}")]
    UnknownType(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode frame: {0}")]
pub struct EncodeError(#[from] serde_json::Error);
