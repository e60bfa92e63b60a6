pub mod params;
pub mod server;
pub mod transport;

pub use server::{McpDeps, TriBridMcpServer};
pub use transport::serve_stdio;
