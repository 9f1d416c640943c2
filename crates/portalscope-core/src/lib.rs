//! Portalscope Core - shared primitives for capture control and TLS decryption setup.
//!
//! This crate holds the pieces that every other Portalscope crate leans on:
//!
//! - [`version`]: companion-app version compatibility rules
//! - [`certificate`]: PEM certificate decoding into [`ParsedCertificate`]
//! - [`trust_store`]: certificate trust-store membership lookups
//! - [`packages`]: installed-package metadata queries
//! - [`config`]: explicit configuration and persisted setup flags
//! - [`state`]: UI-facing addon and certificate states

pub mod certificate;
pub mod config;
pub mod packages;
pub mod state;
pub mod trust_store;
pub mod version;

pub use certificate::{CertificateError, ParsedCertificate};
pub use config::{
    CaptureSettings, ConfigError, DumpMode, MitmSettings, PlatformProfile, PortalConfig,
    SetupFlags,
};
pub use packages::{PackageInfo, PackageInspector, StaticPackages};
pub use state::{AddonState, CertificateUiState};
pub use trust_store::{DirectoryTrustStore, MemoryTrustStore, TrustRoot, TrustStore};
pub use version::{is_semantic_version_compatible, major_version};
