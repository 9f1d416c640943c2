//! Portalscope Setup - TLS decryption setup orchestration.
//!
//! Walks the user through everything decryption needs before a capture can
//! use it:
//!
//! - [`readiness`]: the five readiness steps and their count
//! - [`addon`]: addon installation state and update checks
//! - [`orchestrator`]: [`SetupOrchestrator`], which drives the addon client
//!   and the CA install/export flow

#![cfg(unix)]

pub mod addon;
pub mod orchestrator;
pub mod readiness;

pub use addon::{derive_addon_state, host_abi, new_version_available, release_download_url};
pub use orchestrator::SetupOrchestrator;
pub use readiness::{PermissionSnapshot, ReadinessSteps, STEP_COUNT};
