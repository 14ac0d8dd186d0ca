//! Command-line surface for the adapter process.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "blender-mcp-adapter", about = "MCP stdio adapter in front of a blender-mcp-core server")]
pub struct Cli {
    /// Host to bind the (currently unimplemented) HTTP MCP transport to.
    /// Reserved for forward compatibility; stdio is the only transport this
    /// binary actually serves.
    #[arg(long, default_value = "127.0.0.1")]
    pub mcp_host: String,

    /// Port for the (currently unimplemented) HTTP MCP transport.
    #[arg(long, default_value_t = 8000)]
    pub mcp_port: u16,

    /// Host where the blender-mcp-core connection server is listening.
    #[arg(long, default_value = "127.0.0.1")]
    pub blender_host: String,

    /// Port where the blender-mcp-core connection server is listening.
    #[arg(long, default_value_t = 6688)]
    pub blender_port: u16,

    /// Log filter directive, e.g. "info" or "blender_mcp_adapter=debug".
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
