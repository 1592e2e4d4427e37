/// Session id and token generation.
pub mod ids;
/// Data and log directory locations.
pub mod paths;

pub use ids::{generate_auth_token, generate_sid, sid_from_window, window_name, worktree_id};
