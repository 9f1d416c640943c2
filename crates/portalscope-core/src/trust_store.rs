//! Certificate trust-store membership.
//!
//! Membership is decided by DER byte identity and is re-evaluated on every
//! lookup; a previous positive answer is never cached.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::certificate::ParsedCertificate;

/// Android system CA directory.
pub const ANDROID_SYSTEM_CACERTS: &str = "/system/etc/security/cacerts";

/// Android user-added CA directory (primary user).
pub const ANDROID_USER_CACERTS: &str = "/data/misc/user/0/cacerts-added";

/// Linux local anchor directories, by distribution family.
pub const LINUX_ANCHOR_DIRS: &[&str] = &[
    "/usr/local/share/ca-certificates",
    "/etc/pki/ca-trust/source/anchors",
    "/etc/ca-certificates/trust-source/anchors",
];

/// A trust store that can be queried for a certificate.
pub trait TrustStore: Send + Sync {
    /// Returns the alias under which a certificate with this DER is trusted.
    fn alias_of(&self, der: &[u8]) -> Option<String>;

    /// Returns true if a certificate with this DER is trusted.
    fn contains(&self, der: &[u8]) -> bool {
        self.alias_of(der).is_some()
    }

    /// Looks up `cert` and records the alias on it.
    fn refresh_alias(&self, cert: &mut ParsedCertificate) -> bool {
        let alias = self.alias_of(cert.der());
        let found = alias.is_some();
        cert.set_alias(alias);
        found
    }
}

/// A labelled directory of certificate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRoot {
    /// Alias prefix, e.g. "system" or "user".
    pub label: String,
    /// Directory holding one certificate per file.
    pub dir: PathBuf,
}

/// Trust store backed by certificate directories.
#[derive(Debug, Clone, Default)]
pub struct DirectoryTrustStore {
    roots: Vec<TrustRoot>,
}

impl DirectoryTrustStore {
    /// Creates a store with no directories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a labelled directory.
    pub fn with_root(mut self, label: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        self.roots.push(TrustRoot {
            label: label.into(),
            dir: dir.as_ref().to_path_buf(),
        });
        self
    }

    /// Store covering the Android system and user CA directories.
    pub fn android() -> Self {
        Self::new()
            .with_root("system", ANDROID_SYSTEM_CACERTS)
            .with_root("user", ANDROID_USER_CACERTS)
    }

    /// Store covering the Linux local anchor directories.
    pub fn linux_anchors() -> Self {
        LINUX_ANCHOR_DIRS
            .iter()
            .fold(Self::new(), |store, dir| store.with_root("anchor", dir))
    }

    /// Returns the configured directories.
    pub fn roots(&self) -> &[TrustRoot] {
        &self.roots
    }

    fn scan_root(root: &TrustRoot, der: &[u8]) -> Option<String> {
        let entries = match fs::read_dir(&root.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Skipping trust root {:?}: {}", root.dir, e);
                return None;
            }
        };

        let mut names: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name())
            .collect();
        names.sort();

        for name in names {
            let path = root.dir.join(&name);
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            match ParsedCertificate::from_bytes(&bytes) {
                Ok(cert) if cert.same_identity(der) => {
                    return Some(format!("{}:{}", root.label, name.to_string_lossy()));
                }
                Ok(_) => {}
                Err(e) => tracing::trace!("Ignoring {:?}: {}", path, e),
            }
        }

        None
    }
}

impl TrustStore for DirectoryTrustStore {
    fn alias_of(&self, der: &[u8]) -> Option<String> {
        self.roots.iter().find_map(|root| Self::scan_root(root, der))
    }
}

/// In-memory trust store.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    entries: RwLock<Vec<(String, Vec<u8>)>>,
}

impl MemoryTrustStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts a certificate under `alias`.
    pub fn add(&self, alias: impl Into<String>, der: impl Into<Vec<u8>>) {
        self.entries.write().push((alias.into(), der.into()));
    }

    /// Removes every entry with this DER.
    pub fn remove(&self, der: &[u8]) {
        self.entries.write().retain(|(_, d)| d != der);
    }
}

impl TrustStore for MemoryTrustStore {
    fn alias_of(&self, der: &[u8]) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|(_, d)| d == der)
            .map(|(alias, _)| alias.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use tempfile::TempDir;

    fn generate_ca(cn: &str) -> (String, Vec<u8>) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), cert.der().to_vec())
    }

    #[test]
    fn directory_store_finds_pem_file() {
        let dir = TempDir::new().unwrap();
        let (pem_text, der) = generate_ca("Dir CA");
        fs::write(dir.path().join("abcd1234.0"), &pem_text).unwrap();

        let store = DirectoryTrustStore::new().with_root("user", dir.path());
        assert_eq!(store.alias_of(&der).as_deref(), Some("user:abcd1234.0"));
    }

    #[test]
    fn directory_store_finds_der_file() {
        let dir = TempDir::new().unwrap();
        let (_, der) = generate_ca("Der CA");
        fs::write(dir.path().join("root.der"), &der).unwrap();

        let store = DirectoryTrustStore::new().with_root("system", dir.path());
        assert!(store.contains(&der));
    }

    #[test]
    fn directory_store_misses_other_certificates() {
        let dir = TempDir::new().unwrap();
        let (other_pem, _) = generate_ca("Other CA");
        let (_, der) = generate_ca("Wanted CA");
        fs::write(dir.path().join("other.0"), other_pem).unwrap();
        fs::write(dir.path().join("junk.txt"), "not a cert").unwrap();

        let store = DirectoryTrustStore::new().with_root("system", dir.path());
        assert!(store.alias_of(&der).is_none());
    }

    #[test]
    fn directory_store_missing_dir_is_empty() {
        let store = DirectoryTrustStore::new().with_root("system", "/nonexistent/portalscope/certs");
        assert!(!store.contains(&[0x30, 0x00]));
    }

    #[test]
    fn membership_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let (pem_text, der) = generate_ca("Removed CA");
        let path = dir.path().join("removed.0");
        fs::write(&path, pem_text).unwrap();

        let store = DirectoryTrustStore::new().with_root("user", dir.path());
        assert!(store.contains(&der));

        fs::remove_file(&path).unwrap();
        assert!(!store.contains(&der));
    }

    #[test]
    fn refresh_alias_records_alias() {
        let (pem_text, der) = generate_ca("Alias CA");
        let mut cert = ParsedCertificate::from_pem(&pem_text).unwrap();

        let store = MemoryTrustStore::new();
        assert!(!store.refresh_alias(&mut cert));
        assert!(cert.alias().is_none());

        store.add("user:alias.0", der.clone());
        assert!(store.refresh_alias(&mut cert));
        assert_eq!(cert.alias(), Some("user:alias.0"));

        store.remove(&der);
        assert!(!store.refresh_alias(&mut cert));
        assert!(cert.alias().is_none());
    }

    #[test]
    fn android_roots_are_labelled() {
        let store = DirectoryTrustStore::android();
        let labels: Vec<_> = store.roots().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["system", "user"]);
    }
}
