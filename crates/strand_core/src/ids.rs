//! Stable 128-bit identifiers for servers, shards, and data moves.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 128-bit unique identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub first: u64,
    pub second: u64,
}

/// Marks legacy shards that carry no structured move metadata.
pub const ANONYMOUS_SHARD_ID: Uid = Uid::new(0x6666_6666_6666_6666, 0x8888_8888_8888_8888);

/// Written as the move-keys lock owner when an operator disables data
/// distribution through the lock key rather than the mode key.
pub const MODE_LOCK_OWNER: Uid = Uid::new(0x18c3_8f86_6701_2517, 0x4a70_f295_ce7b_46f5);

impl Uid {
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    pub fn random() -> Self {
        Self {
            first: rand::random(),
            second: rand::random(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }

    /// First eight hex digits, for log lines.
    pub fn short_string(&self) -> String {
        format!("{:08x}", self.first >> 32)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid() {
        assert!(!Uid::default().is_valid());
        assert!(ANONYMOUS_SHARD_ID.is_valid());
    }

    #[test]
    fn display_is_32_hex_digits() {
        let id = Uid::new(1, 2);
        assert_eq!(id.to_string().len(), 32);
        assert_eq!(id.to_string(), format!("{:016x}{:016x}", 1, 2));
    }
}
