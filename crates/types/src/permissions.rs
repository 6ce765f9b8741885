//! Per-peer permission flags (§3, §4.7): manual/persistent connections are exempt from the
//! inbound slot limit and `noban` connections are exempt from misbehavior-driven discouragement.
use std::ops::{BitOr, BitOrAssign};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PermissionFlags(pub u32);

impl PermissionFlags {
    pub const NONE: PermissionFlags = PermissionFlags(0);
    /// Exempt from ban/discouragement scoring.
    pub const NOBAN: PermissionFlags = PermissionFlags(1 << 0);
    /// Configured by the operator rather than discovered; not subject to outbound eviction.
    pub const MANUAL: PermissionFlags = PermissionFlags(1 << 1);

    pub fn contains(&self, other: PermissionFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PermissionFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        PermissionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PermissionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_all_requested_bits() {
        let flags = PermissionFlags::NOBAN | PermissionFlags::MANUAL;
        assert!(flags.contains(PermissionFlags::NOBAN));
        assert!(flags.contains(PermissionFlags::MANUAL));
        assert!(!PermissionFlags::NOBAN.contains(PermissionFlags::MANUAL));
    }
}
