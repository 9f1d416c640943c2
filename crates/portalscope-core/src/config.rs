//! Explicit configuration and persisted setup flags.
//!
//! [`PortalConfig`] is read-mostly configuration supplied by the caller.
//! [`SetupFlags`] holds the small amount of state the setup flow persists
//! between runs. Both are stored as pretty-printed JSON; a missing file
//! yields the defaults.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capture process package.
pub const CAPTURE_PACKAGE: &str = "com.emanuelef.remote_capture";

/// Capture process remote-control component.
pub const CAPTURE_CONTROL_COMPONENT: &str = "com.emanuelef.remote_capture.activities.CaptureCtrl";

/// Decryption addon package.
pub const MITM_PACKAGE: &str = "com.pcapdroid.mitm";

/// Decryption addon bound service.
pub const MITM_SERVICE: &str = "com.pcapdroid.mitm.MitmService";

/// Default loopback port for forwarded packets.
pub const DEFAULT_COLLECTOR_PORT: u16 = 5123;

/// Largest datagram the capture process forwards.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_535;

/// Platform API level that dropped the storage permission requirement.
pub const API_LEVEL_Q: u32 = 29;

/// Platform API level that removed intent-based CA installation.
pub const API_LEVEL_R: u32 = 30;

/// Platform API level that introduced the notification permission.
pub const API_LEVEL_TIRAMISU: u32 = 33;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File contents are not valid JSON for the expected type.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No data directory could be determined.
    #[error("no data directory available")]
    NoDataDir,

    /// A value parsed but is not usable.
    #[error("invalid {field}: {value:?}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// Value as configured.
        value: String,
    },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How the capture process delivers captured packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    /// Forward packets as UDP datagrams to the collector.
    #[default]
    UdpExporter,

    /// Write a pcap file on the device.
    PcapFile,
}

impl DumpMode {
    /// Returns the wire value understood by the capture process.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UdpExporter => "udp_exporter",
            Self::PcapFile => "pcap_file",
        }
    }
}

impl std::fmt::Display for DumpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capture process control settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Capture process package.
    pub target_package: String,
    /// Remote-control component inside the capture process.
    pub target_component: String,
    /// Packet delivery mode.
    pub dump_mode: DumpMode,
    /// Host the capture process forwards datagrams to.
    pub collector_host: String,
    /// Port the capture process forwards datagrams to (and we listen on).
    pub collector_port: u16,
    /// Only capture traffic of this app.
    pub app_filter: String,
    /// Ask the capture process to include its metadata extensions.
    pub dump_extensions: bool,
    /// File name for [`DumpMode::PcapFile`].
    pub pcap_name: String,
    /// Largest datagram accepted by the listener.
    pub max_datagram_size: usize,
    /// Capacity of the channel between the listener and its sink.
    pub sink_capacity: usize,
    /// Interval between status queries during a capture session.
    pub status_poll_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            target_package: CAPTURE_PACKAGE.to_string(),
            target_component: CAPTURE_CONTROL_COMPONENT.to_string(),
            dump_mode: DumpMode::UdpExporter,
            collector_host: "127.0.0.1".to_string(),
            collector_port: DEFAULT_COLLECTOR_PORT,
            app_filter: "com.example.captive_portal_analyzer_kotlin".to_string(),
            dump_extensions: true,
            pcap_name: "captive_portal_analyzer.pcap".to_string(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            sink_capacity: 1024,
            status_poll_secs: 10,
        }
    }
}

/// Decryption addon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmSettings {
    /// Addon package.
    pub package: String,
    /// Addon bound service.
    pub service: String,
    /// Addon version this build targets.
    pub target_version_name: String,
    /// Version code of [`Self::target_version_name`].
    pub target_version_code: u64,
    /// Release repository of the addon.
    pub repository: String,
    /// Name shown by the system install flow.
    pub ca_install_name: String,
    /// Suggested file name when exporting the certificate.
    pub ca_export_filename: String,
}

impl Default for MitmSettings {
    fn default() -> Self {
        Self {
            package: MITM_PACKAGE.to_string(),
            service: MITM_SERVICE.to_string(),
            target_version_name: "1.4".to_string(),
            target_version_code: 21,
            repository: "https://github.com/emanuele-f/PCAPdroid-mitm".to_string(),
            ca_install_name: "PCAPdroid CA".to_string(),
            ca_export_filename: "PCAPdroid_CA.crt".to_string(),
        }
    }
}

/// Platform the setup flow runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformProfile {
    /// Platform API level.
    pub api_level: u32,
}

impl PlatformProfile {
    /// Creates a profile for an API level.
    pub fn new(api_level: u32) -> Self {
        Self { api_level }
    }

    /// Storage permission is only required below API level 29.
    pub fn requires_storage_permission(&self) -> bool {
        self.api_level < API_LEVEL_Q
    }

    /// Notification permission exists from API level 33.
    pub fn requires_notification_permission(&self) -> bool {
        self.api_level >= API_LEVEL_TIRAMISU
    }

    /// The system CA install flow is available below API level 30.
    pub fn supports_intent_ca_install(&self) -> bool {
        self.api_level < API_LEVEL_R
    }
}

impl Default for PlatformProfile {
    fn default() -> Self {
        Self::new(API_LEVEL_TIRAMISU)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Capture process control.
    pub capture: CaptureSettings,
    /// Decryption addon.
    pub mitm: MitmSettings,
    /// Platform profile.
    pub platform: PlatformProfile,
}

impl PortalConfig {
    /// Loads configuration from `path`, returning defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        if self.capture.collector_host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "capture.collector_host",
                value: self.capture.collector_host.clone(),
            });
        }
        Ok(())
    }

    /// Saves configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }
}

/// Setup state persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupFlags {
    /// All decryption setup steps completed.
    pub tls_decryption_setup_done: bool,
    /// The user chose to skip CA installation.
    pub ca_installation_skipped: bool,
    /// Addon version whose update notice the user dismissed.
    pub ignored_mitm_version: Option<String>,
}

impl SetupFlags {
    /// Returns true if the update notice for `version` was dismissed.
    pub fn is_ignored_mitm_version(&self, version: &str) -> bool {
        self.ignored_mitm_version.as_deref() == Some(version)
    }

    /// Loads flags from `path`, returning defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    /// Saves flags to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }
}

/// Returns the default data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("org", "portalscope", "Portalscope")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::NoDataDir)
}

fn load_json<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No file at {:?}, using defaults", path);
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
