//! Error kinds for the adapter process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to reach blender-mcp-core at {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed response from blender-mcp-core: {0}")]
    Protocol(String),

    /// The core server replied with `status: "error"`.
    #[error("{source}: {message}")]
    Core { source: String, message: String },
}

pub type AdapterResult<T> = Result<T, AdapterError>;
