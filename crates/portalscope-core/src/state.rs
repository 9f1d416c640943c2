//! UI-facing states for the decryption addon and its CA certificate.

use serde::{Deserialize, Serialize};

/// Installation state of the decryption addon.
///
/// Derived on demand from installed-package metadata, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonState {
    /// A compatible version is installed.
    Installed,

    /// The addon is not installed.
    NotInstalled,

    /// A compatible version is installed but a newer one is available.
    UpdateAvailable,

    /// An older, incompatible version is installed.
    NewVersionRequired,

    /// A newer, incompatible version is installed.
    IncompatibleVersion,
}

impl AddonState {
    /// Returns true if the installed addon can be used for decryption.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Installed | Self::UpdateAvailable)
    }

    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::NotInstalled => "not_installed",
            Self::UpdateAvailable => "update_available",
            Self::NewVersionRequired => "new_version_required",
            Self::IncompatibleVersion => "incompatible_version",
        }
    }
}

impl std::fmt::Display for AddonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of the CA certificate provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum CertificateUiState {
    /// Waiting for the addon to hand out its certificate.
    #[default]
    Loading,

    /// The certificate is present in the device trust store.
    Installed,

    /// The certificate can be installed through the system install flow.
    ReadyToInstall,

    /// The certificate must be exported and installed manually.
    ReadyToExport,

    /// The certificate was written to a user-chosen file.
    Exported,

    /// The addon service could not be reached.
    ConnectionError,

    /// Provisioning failed.
    Error(String),
}

impl CertificateUiState {
    /// Returns true if the certificate is installed.
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed)
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Installed => "installed",
            Self::ReadyToInstall => "ready_to_install",
            Self::ReadyToExport => "ready_to_export",
            Self::Exported => "exported",
            Self::ConnectionError => "connection_error",
            Self::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for CertificateUiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(message) => write!(f, "error: {}", message),
            other => write!(f, "{}", other.as_str()),
        }
    }
}
