//! Prefix-tagged identifiers.
//!
//! Agents and messages carry opaque ids of the form `<prefix>-<16 hex>`,
//! backed by 8 bytes from the OS cryptographic RNG. Collisions are not
//! handled; at mesh scale the birthday probability is negligible.

use std::fmt::Write;

use rand::RngCore;
use rand::rngs::OsRng;

/// Prefix for agent identifiers.
pub const AGENT_ID_PREFIX: &str = "ag";
/// Prefix for message identifiers.
pub const MESSAGE_ID_PREFIX: &str = "msg";

fn random_id(prefix: &str) -> String {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);

    let mut out = String::with_capacity(prefix.len() + 1 + buf.len() * 2);
    out.push_str(prefix);
    out.push('-');
    for byte in buf {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Generate a fresh agent id (`ag-…`).
pub fn agent_id() -> String {
    random_id(AGENT_ID_PREFIX)
}

/// Generate a fresh message id (`msg-…`).
pub fn message_id() -> String {
    random_id(MESSAGE_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_shape() {
        let id = agent_id();
        assert!(id.starts_with("ag-"));
        assert_eq!(id.len(), "ag-".len() + 16);
        assert!(id["ag-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_id_shape() {
        let id = message_id();
        assert!(id.starts_with("msg-"));
        assert_eq!(id.len(), "msg-".len() + 16);
    }

    #[test]
    fn ids_are_unique() {
        let a = agent_id();
        let b = agent_id();
        assert_ne!(a, b);
    }
}
