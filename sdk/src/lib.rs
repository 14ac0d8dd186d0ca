//! External client SDK for a `blender-mcp-core` connection server: a thin
//! wire-protocol client plus a `SceneManager` convenience layer for the
//! scene-mutation operations the wire protocol itself doesn't expose
//! directly.

pub mod client;
pub mod error;
pub mod scene;

pub use client::{BlenderClient, BlenderSession, ExecutionResult};
pub use error::{SdkError, SdkResult};
pub use scene::SceneManager;
