//! Protocol version management
//!
//! The spec declares cross-version negotiation beyond a single version
//! byte match a non-goal, so unlike a semantic-versioning scheme this
//! module only ever checks for an exact match against [`CURRENT_VERSION`].

use crate::constants::PROTOCOL_VERSION;

/// The version this build of the codec speaks (1.0).
pub const CURRENT_VERSION: u16 = PROTOCOL_VERSION;

/// Returns `true` if `peer_version` is the exact version this peer speaks.
pub fn version_compatible(peer_version: u16) -> bool {
    peer_version == CURRENT_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_required() {
        assert!(version_compatible(CURRENT_VERSION));
        assert!(!version_compatible(0x0200));
        assert!(!version_compatible(0x0101));
    }
}
