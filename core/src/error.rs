//! Error kinds for the core service, matching the wire discriminants clients
//! branch on.

use thiserror::Error;

/// Errors a handler, the dispatcher, or the connection server can raise.
///
/// Each variant maps 1:1 onto a wire error kind; `CoreError::wire_kind`
/// is what the framing layer puts in `CommandResponse::message`/`source`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no handler registered for command '{0}'")]
    UnknownCommand(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported without a display: {0}")]
    UnsupportedInHeadless(String),

    #[error("handler error ({error_type}): {message}")]
    HandlerError { message: String, error_type: String },

    #[error("payload exceeds the 10 MiB cap")]
    PayloadTooLarge,

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("address already in use")]
    AddressInUse,

    #[error("failed to bind: {0}")]
    BindFailed(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is running; stop it before changing this setting")]
    BusyState,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed request: {0}")]
    DecodeError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The wire discriminant string carried in `source`/logs.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            CoreError::UnknownCommand(_) => "UnknownCommand",
            CoreError::InvalidParams(_) => "InvalidParams",
            CoreError::NotFound(_) => "NotFound",
            CoreError::UnsupportedInHeadless(_) => "UnsupportedInHeadless",
            CoreError::HandlerError { .. } => "HandlerError",
            CoreError::PayloadTooLarge => "PayloadTooLarge",
            CoreError::Timeout => "Timeout",
            CoreError::AddressInUse => "AddressInUse",
            CoreError::BindFailed(_) => "BindFailed",
            CoreError::AlreadyRunning => "AlreadyRunning",
            CoreError::BusyState => "BusyState",
            CoreError::ConnectionClosed => "ConnectionClosed",
            CoreError::DecodeError(_) => "DecodeError",
            CoreError::Io(_) => "DecodeError",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
