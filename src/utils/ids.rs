use rand::Rng;

/// Characters used for session ids (URL-safe, usable in paths and tmux names)
const SID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of a session id
const SID_LENGTH: usize = 8;

/// Prefix applied to multiplexer window names so orphaned windows can be
/// rediscovered after a restart
pub const WINDOW_PREFIX: &str = "ccm-";

/// Generate a new opaque session id
#[must_use]
pub fn generate_sid() -> String {
    let mut rng = rand::rng();
    (0..SID_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..SID_CHARSET.len());
            SID_CHARSET[idx] as char
        })
        .collect()
}

/// Build the multiplexer window name for a session id
#[must_use]
pub fn window_name(sid: &str) -> String {
    format!("{WINDOW_PREFIX}{sid}")
}

/// Extract the session id from a window name, if it carries the prefix
#[must_use]
pub fn sid_from_window(name: &str) -> Option<&str> {
    name.strip_prefix(WINDOW_PREFIX)
}

/// Generate the process-wide auth token: 128 random bits as hex
#[must_use]
pub fn generate_auth_token() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| format!("{:02x}", rng.random_range(0..=255u32)))
        .collect()
}

/// Derive a stable worktree id from an absolute path.
///
/// Uses FNV-1a/64 so the id is deterministic across processes and Rust
/// versions (std's `DefaultHasher` is not guaranteed stable).
#[must_use]
pub fn worktree_id(path: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in path.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_length_and_charset() {
        let sid = generate_sid();
        assert_eq!(sid.len(), SID_LENGTH);
        assert!(sid.bytes().all(|b| SID_CHARSET.contains(&b)));
    }

    #[test]
    fn test_sids_are_unique() {
        let a = generate_sid();
        let b = generate_sid();
        // Different with very high probability
        assert_ne!(a, b);
    }

    #[test]
    fn test_window_name_round_trip() {
        let sid = "DEADBEEF";
        let name = window_name(sid);
        assert_eq!(name, "ccm-DEADBEEF");
        assert_eq!(sid_from_window(&name), Some(sid));
        assert_eq!(sid_from_window("other-window"), None);
    }

    #[test]
    fn test_auth_token_is_128_bits_of_hex() {
        let token = generate_auth_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_worktree_id_is_stable() {
        let a = worktree_id("/tmp/repo-x");
        let b = worktree_id("/tmp/repo-x");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(worktree_id("/tmp/repo-y"), a);
    }
}
