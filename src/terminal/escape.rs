//! Escaping for text handed to the multiplexer CLI.
//!
//! tmux re-parses its argument vector as a command sequence: a bare or
//! trailing `;` splits commands, and backslash is its escape character.
//! Every string sent with `send-keys -l` must pass through
//! [`escape_send_text`]; nothing else in the crate escapes terminal input.

/// Escape literal text for `send-keys -l`.
///
/// Backslashes are doubled first so the `;` escape cannot be defeated by a
/// preceding backslash in the payload. All other bytes, including quotes
/// and control characters, pass through untouched — `-l` sends them
/// literally.
#[must_use]
pub fn escape_send_text(text: &str) -> String {
    text.replace('\\', "\\\\").replace(';', "\\;")
}
