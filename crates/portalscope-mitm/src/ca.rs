//! Certificate authority for the development addon.
//!
//! Generates and keeps the root CA the loopback addon hands out when asked
//! for its certificate.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use crate::error::CaError;
use crate::loopback::MitmBackend;
use crate::protocol::MitmConfig;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "portalscope-ca.crt";
const CA_KEY_FILENAME: &str = "portalscope-ca.key";

/// Common name of the generated CA.
pub const CA_COMMON_NAME: &str = "Portalscope Development CA";

/// Manages the root CA files.
#[derive(Debug, Clone)]
pub struct CaAuthority {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaAuthority {
    /// Creates an authority stored in `ca_dir`.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA exists, generating it if necessary, and returns the
    /// certificate PEM.
    pub fn ensure_ca(&self) -> Result<String, CaError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.read_cert_pem()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Portalscope");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Reads the CA certificate PEM.
    pub fn read_cert_pem(&self) -> Result<String, CaError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }
}

/// Development addon backend serving a persistent CA.
pub struct CaBackend {
    certificate: Option<String>,
    proxy: Mutex<Option<(UnixStream, MitmConfig)>>,
    doze_disabled: AtomicBool,
}

impl CaBackend {
    /// Loads (or generates) the CA in `authority`.
    pub fn new(authority: &CaAuthority) -> Result<Self, CaError> {
        Ok(Self::with_certificate(Some(authority.ensure_ca()?)))
    }

    /// Serves a fixed certificate, or none.
    pub fn with_certificate(certificate: Option<String>) -> Self {
        Self {
            certificate,
            proxy: Mutex::new(None),
            doze_disabled: AtomicBool::new(false),
        }
    }

    /// Returns the config of the running proxy.
    pub fn active_proxy(&self) -> Option<MitmConfig> {
        self.proxy.lock().as_ref().map(|(_, config)| config.clone())
    }

    /// Returns true once power management was relaxed.
    pub fn doze_disabled(&self) -> bool {
        self.doze_disabled.load(Ordering::SeqCst)
    }
}

impl MitmBackend for CaBackend {
    fn ca_certificate(&self) -> Option<String> {
        self.certificate.clone()
    }

    fn start_mitm(&self, endpoint: UnixStream, config: MitmConfig) {
        tracing::info!(
            "Development addon proxy started (port {}, transparent: {})",
            config.proxy_port,
            config.transparent_mode
        );
        if self.proxy.lock().replace((endpoint, config)).is_some() {
            tracing::warn!("Replaced a running proxy");
        }
    }

    fn stop_mitm(&self) {
        if self.proxy.lock().take().is_some() {
            tracing::info!("Development addon proxy stopped");
        }
    }

    fn disable_doze(&self) {
        self.doze_disabled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use portalscope_core::ParsedCertificate;
    use tempfile::TempDir;

    #[test]
    fn authority_paths() {
        let authority = CaAuthority::new("/tmp/test-ca");
        assert_eq!(
            authority.cert_path(),
            PathBuf::from("/tmp/test-ca/portalscope-ca.crt")
        );
        assert_eq!(
            authority.key_path(),
            PathBuf::from("/tmp/test-ca/portalscope-ca.key")
        );
    }

    #[test]
    fn ensure_generates_once() {
        let temp_dir = TempDir::new().unwrap();
        let authority = CaAuthority::new(temp_dir.path().join("ca"));
        assert!(!authority.ca_exists());

        let first = authority.ensure_ca().unwrap();
        assert!(authority.ca_exists());
        let second = authority.ensure_ca().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generated_ca_decodes() {
        let temp_dir = TempDir::new().unwrap();
        let pem = CaAuthority::new(temp_dir.path()).ensure_ca().unwrap();

        let cert = ParsedCertificate::from_pem(&pem).unwrap();
        assert!(cert.subject().contains(CA_COMMON_NAME));
        assert_eq!(cert.subject(), cert.issuer());
    }

    #[test]
    fn backend_tracks_proxy() {
        let backend = CaBackend::with_certificate(None);
        assert!(backend.ca_certificate().is_none());

        let (service_end, mut local_end) = UnixStream::pair().unwrap();
        backend.start_mitm(service_end, MitmConfig::new(8050));
        assert_eq!(backend.active_proxy().map(|c| c.proxy_port), Some(8050));

        backend.stop_mitm();
        assert!(backend.active_proxy().is_none());

        let mut buf = [0u8; 1];
        assert_eq!(local_end.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn backend_disable_doze() {
        let backend = CaBackend::with_certificate(Some("PEM".into()));
        assert!(!backend.doze_disabled());
        backend.disable_doze();
        assert!(backend.doze_disabled());
    }
}
