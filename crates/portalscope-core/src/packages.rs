//! Installed-package metadata.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Metadata of an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Package identifier.
    pub package: String,
    /// Human-readable version name (e.g. "1.4"), if the package reports one.
    pub version_name: Option<String>,
    /// Monotonic version code.
    pub version_code: u64,
}

impl PackageInfo {
    /// Creates package metadata.
    pub fn new(package: impl Into<String>, version_name: impl Into<String>, version_code: u64) -> Self {
        Self {
            package: package.into(),
            version_name: Some(version_name.into()),
            version_code,
        }
    }
}

/// Queries installed packages.
pub trait PackageInspector: Send + Sync {
    /// Returns metadata for `package`, or `None` if it is not installed.
    fn package_info(&self, package: &str) -> Option<PackageInfo>;

    /// Returns true if `package` is installed.
    fn is_installed(&self, package: &str) -> bool {
        self.package_info(package).is_some()
    }
}

/// Fixed package table, filled by configuration or tests.
#[derive(Debug, Default)]
pub struct StaticPackages {
    packages: RwLock<HashMap<String, PackageInfo>>,
}

impl StaticPackages {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a package.
    pub fn insert(&self, info: PackageInfo) {
        self.packages.write().insert(info.package.clone(), info);
    }

    /// Removes a package.
    pub fn remove(&self, package: &str) {
        self.packages.write().remove(package);
    }
}

impl PackageInspector for StaticPackages {
    fn package_info(&self, package: &str) -> Option<PackageInfo> {
        self.packages.read().get(package).cloned()
    }
}
