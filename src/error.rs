use thiserror::Error;

/// Errors surfaced by the proxy registry, viewers and the control protocol.
///
/// The `Display` text of each variant is what a control client sees in the
/// `Error` field of a reply.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not find proxy with id {0}")]
    ProxyNotFound(u64),

    #[error("could not find user {0}")]
    UserNotFound(String),

    #[error("could not find viewer")]
    ViewerNotFound,

    #[error("could not find session {0}")]
    SessionNotFound(String),

    #[error("could not find filter {0}")]
    FilterNotFound(String),

    #[error("could not find callback {0}")]
    CallbackNotFound(String),

    #[error("invalid credentials for user {0}")]
    InvalidCredentials(String),

    #[error("user {0} already exists")]
    UserExists(String),

    #[error("hmac does not match")]
    HmacMismatch,

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    MissingField(&'static str),

    #[error("unsupported message type")]
    UnsupportedMessage,

    #[error("proxy {0} is already running")]
    AlreadyRunning(u64),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;
