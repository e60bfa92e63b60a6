//! MCP transport layer.

use rmcp::transport::io::stdio;
use rmcp::ServiceExt;

use super::server::TriBridMcpServer;

/// Serve MCP over stdio: JSON-RPC on stdin/stdout. Logs must go to stderr
/// while this transport is active.
pub async fn serve_stdio(server: TriBridMcpServer) -> anyhow::Result<()> {
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
