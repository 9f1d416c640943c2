//! Readiness steps gating the decryption setup "continue" action.

use serde::{Deserialize, Serialize};

use portalscope_core::PlatformProfile;

/// Number of readiness steps.
pub const STEP_COUNT: u8 = 5;

/// Permission state as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    /// Storage write permission granted.
    pub storage: bool,
    /// Notification permission granted.
    pub notifications: bool,
    /// VPN consent given.
    pub vpn: bool,
}

impl PermissionSnapshot {
    /// Every permission granted.
    pub fn all_granted() -> Self {
        Self {
            storage: true,
            notifications: true,
            vpn: true,
        }
    }
}

/// The five readiness steps, each satisfied or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSteps {
    /// Storage permission granted, or not required on this platform.
    pub storage: bool,
    /// Notification permission granted, or not present on this platform.
    pub notifications: bool,
    /// VPN consent given.
    pub vpn: bool,
    /// CA certificate found in the trust store.
    pub certificate: bool,
    /// A usable addon version is installed.
    pub addon: bool,
}

impl ReadinessSteps {
    /// Derives the permission steps from a snapshot.
    ///
    /// Steps the platform does not require count as satisfied.
    pub fn from_permissions(platform: &PlatformProfile, permissions: &PermissionSnapshot) -> Self {
        Self {
            storage: !platform.requires_storage_permission() || permissions.storage,
            notifications: !platform.requires_notification_permission()
                || permissions.notifications,
            vpn: permissions.vpn,
            certificate: false,
            addon: false,
        }
    }

    /// Returns the number of satisfied steps, in `0..=5`.
    pub fn completed(&self) -> u8 {
        [
            self.storage,
            self.notifications,
            self.vpn,
            self.certificate,
            self.addon,
        ]
        .iter()
        .filter(|done| **done)
        .count() as u8
    }

    /// Returns true when every step is satisfied.
    pub fn is_complete(&self) -> bool {
        self.completed() == STEP_COUNT
    }
}
