/// Escaping for text sent to the multiplexer.
pub mod escape;
/// In-memory supervisor for tests.
pub mod mock;
/// Window lifecycle supervisor.
pub mod supervisor;
/// Trait seam for dependency injection.
pub mod traits;

pub use escape::escape_send_text;
pub use mock::MockTerminal;
pub use supervisor::{TerminalSupervisor, TerminalWindow};
pub use traits::TerminalControl;
