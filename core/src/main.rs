//! Entry point for running the connection server as a standalone process.
//!
//! A real embedding runs the `blender_mcp_core` library from inside the host
//! application's own process instead of spawning this binary; this exists so
//! the server can be exercised (and so the adapter/SDK can be developed
//! against it) without a host application attached.

use std::sync::Arc;

use blender_mcp_core::{build_server, CoreConfig, NativeHost};
use tracing_subscriber::EnvFilter;

fn main() {
    let config = CoreConfig::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(bind_addr = %config.bind_addr, start_now = config.start_now, "blender-mcp-core-server starting");

    // No GUI event loop is available outside a real host application, so
    // this standalone binary always runs headless.
    let host: Arc<dyn blender_mcp_core::HostRuntime> = Arc::new(NativeHost::headless());
    let server = build_server(host);

    if config.start_now {
        match server.start(config.bind_addr) {
            Ok(addr) => tracing::info!(%addr, "listening"),
            Err(err) => {
                tracing::error!(error = %err, "failed to start connection server");
                std::process::exit(1);
            }
        }
    } else {
        tracing::info!(
            "BLENDER_MCP_START_NOW is unset; server built but not listening. Set it (or call Server::start) to begin accepting connections."
        );
        return;
    }

    // Block the process until Ctrl-C; a real host application would instead
    // hold the `Server` alive for its own process lifetime and stop it as
    // part of its own teardown.
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .expect("failed to install Ctrl-C handler");
    let _ = shutdown_rx.recv();

    tracing::info!("shutdown signal received, draining connection server");
    server.stop();
}
