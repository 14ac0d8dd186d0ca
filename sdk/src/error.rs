//! Error kinds for the external client SDK, mirroring the corpus's
//! CLI-wrapper style of distinguishing transport failure from a remote
//! `status: "error"` reply so callers can match on kind rather than
//! string-sniffing `message`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("could not reach blender-mcp-core at {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed response from blender-mcp-core: {0}")]
    Protocol(String),

    /// The server replied with `status: "error"`. `kind` is the wire
    /// discriminant (e.g. `"UnknownCommand"`, `"NotFound"`).
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
}

pub type SdkResult<T> = Result<T, SdkError>;
