//! Embedded command dispatcher, TCP protocol, and scene handlers for a
//! scripting-runtime host application.
//!
//! This crate runs inside (or alongside) the host application's process: it
//! exposes a small TCP protocol backed by a single-threaded command
//! dispatcher and a fixed set of scene/scripting handlers. The host
//! application itself is an external collaborator, represented here by
//! the [`host::HostRuntime`] trait.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod host;
pub mod proto;
pub mod registry;
pub mod server;

pub use config::CoreConfig;
pub use dispatcher::{Dispatcher, ExternallyDrivenStepper, Stepper, TimerDrivenStepper};
pub use error::{CoreError, CoreResult};
pub use host::{HostRuntime, ImageFormat, NativeHost};
pub use registry::CommandRegistry;
pub use server::{Server, ServerState};

/// Build the server with the standard handler set registered and the
/// stepper strategy implied by `host.is_gui_mode()`.
pub fn build_server(host: std::sync::Arc<dyn HostRuntime>) -> Server {
    let registry = handlers::build_registry();
    let stepper: std::sync::Arc<dyn Stepper> = if host.is_gui_mode() {
        std::sync::Arc::new(TimerDrivenStepper::new())
    } else {
        std::sync::Arc::new(ExternallyDrivenStepper::new())
    };
    Server::new(registry, host, stepper)
}
