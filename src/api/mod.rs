/// HTTP router and shared state.
pub mod http_server;
/// Wire protocol: client commands and server events.
pub mod protocol;
/// Reverse proxy for per-session web terminals.
pub mod proxy;
/// Server composition and lifecycle.
pub mod server;
/// Client socket: fan-out and command dispatch.
pub mod socket;
/// Embedded static assets.
pub mod static_files;

pub use protocol::{ClientCommand, ServerEvent};
