/// Error taxonomy surfaced to clients.
pub mod errors;
/// Session lifecycle composition.
pub mod orchestrator;
/// Domain model: sessions, statuses, transcript messages.
pub mod session;

pub use errors::{OrchestratorError, Result};
pub use orchestrator::SessionOrchestrator;
pub use session::{Message, MessageKind, MessageRole, Session, SessionStatus};
