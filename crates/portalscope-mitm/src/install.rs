//! CA certificate installation and export.
//!
//! [`CertificateInstaller`] is the direct install path; when it is not
//! available the certificate is exported with [`export_pem`] for the user to
//! install by hand.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use portalscope_core::trust_store::LINUX_ANCHOR_DIRS;
use portalscope_core::ParsedCertificate;

use crate::error::InstallError;

/// Installs a CA certificate into a trust store.
pub trait CertificateInstaller: Send + Sync {
    /// Installs `cert` under the display name `name`.
    fn install(&self, name: &str, cert: &ParsedCertificate) -> Result<(), InstallError>;
}

/// Writes the PEM text verbatim to `path`.
pub fn export_pem(pem: &str, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pem)?;
    tracing::info!("Exported CA certificate to {:?}", path);
    Ok(())
}

// ============================================================================
// System trust store (Linux anchors)
// ============================================================================

/// Installs into the first existing Linux anchor directory.
#[derive(Debug, Clone)]
pub struct SystemTrustInstaller {
    anchor_dirs: Vec<PathBuf>,
    elevation: Option<String>,
    refresh: bool,
}

impl Default for SystemTrustInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTrustInstaller {
    /// Uses the standard anchor directories and elevates with pkexec
    /// (graphical session) or sudo.
    pub fn new() -> Self {
        let elevation = if std::env::var("DISPLAY").is_ok() || std::env::var("WAYLAND_DISPLAY").is_ok()
        {
            "pkexec"
        } else {
            "sudo"
        };

        Self {
            anchor_dirs: LINUX_ANCHOR_DIRS.iter().map(PathBuf::from).collect(),
            elevation: Some(elevation.to_string()),
            refresh: true,
        }
    }

    /// Installs into `dir` directly, without elevation or a trust refresh.
    pub fn for_directory(dir: impl AsRef<Path>) -> Self {
        Self {
            anchor_dirs: vec![dir.as_ref().to_path_buf()],
            elevation: None,
            refresh: false,
        }
    }

    /// Returns the directory the certificate would be installed into.
    pub fn target_dir(&self) -> Option<&Path> {
        self.anchor_dirs
            .iter()
            .map(PathBuf::as_path)
            .find(|dir| dir.is_dir())
    }

    fn file_name(name: &str) -> String {
        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        format!("{}.crt", stem.trim_matches('-'))
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<(), InstallError> {
        let mut command = match &self.elevation {
            Some(elevation) => {
                let mut command = Command::new(elevation);
                command.arg(program);
                command
            }
            None => Command::new(program),
        };

        let out = command
            .args(args)
            .output()
            .map_err(|e| InstallError::Failed(format!("failed to run {}: {}", program, e)))?;

        if out.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("dismissed") || stderr.contains("cancelled") {
            Err(InstallError::Cancelled)
        } else {
            Err(InstallError::Failed(stderr.trim().to_string()))
        }
    }

    fn refresh_command(dir: &Path) -> Option<&'static [&'static str]> {
        let dir = dir.to_string_lossy();
        if dir.starts_with("/usr/local/share/ca-certificates") {
            Some(&["update-ca-certificates"][..])
        } else if dir.starts_with("/etc/pki/ca-trust") {
            Some(&["update-ca-trust", "extract"][..])
        } else if dir.starts_with("/etc/ca-certificates/trust-source") {
            Some(&["trust", "extract-compat"][..])
        } else {
            None
        }
    }
}

impl CertificateInstaller for SystemTrustInstaller {
    fn install(&self, name: &str, cert: &ParsedCertificate) -> Result<(), InstallError> {
        let dir = self.target_dir().ok_or(InstallError::NoHandler)?;
        let dest = dir.join(Self::file_name(name));

        match &self.elevation {
            None => fs::write(&dest, cert.pem())?,
            Some(_) => {
                // Staged under an unpredictable name, created exclusively.
                let mut staged = tempfile::Builder::new()
                    .prefix("portalscope-ca-")
                    .suffix(".crt")
                    .tempfile()?;
                staged.write_all(cert.pem().as_bytes())?;
                staged.flush()?;

                let src = staged.path().to_string_lossy().into_owned();
                let dst = dest.to_string_lossy().into_owned();
                self.run("cp", &[src.as_str(), dst.as_str()])?;
            }
        }

        if self.refresh {
            if let Some(cmd) = Self::refresh_command(dir) {
                self.run(cmd[0], &cmd[1..])?;
            }
        }

        tracing::info!("CA certificate installed at {:?}", dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalscope_core::{DirectoryTrustStore, TrustStore};
    use tempfile::TempDir;

    use crate::ca::CaAuthority;

    fn certificate(dir: &Path) -> ParsedCertificate {
        let pem = CaAuthority::new(dir.join("ca")).ensure_ca().unwrap();
        ParsedCertificate::from_pem(&pem).unwrap()
    }

    #[test]
    fn export_writes_pem_verbatim() {
        let dir = TempDir::new().unwrap();
        let cert = certificate(dir.path());
        let path = dir.path().join("out").join("PCAPdroid_CA.crt");

        export_pem(cert.pem(), &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), cert.pem());
    }

    #[test]
    fn install_for_directory_is_visible_to_trust_store() {
        let dir = TempDir::new().unwrap();
        let anchors = dir.path().join("anchors");
        fs::create_dir_all(&anchors).unwrap();
        let cert = certificate(dir.path());

        let installer = SystemTrustInstaller::for_directory(&anchors);
        installer.install("PCAPdroid CA", &cert).unwrap();

        assert!(anchors.join("pcapdroid-ca.crt").exists());
        let store = DirectoryTrustStore::new().with_root("anchor", &anchors);
        assert_eq!(
            store.alias_of(cert.der()).as_deref(),
            Some("anchor:pcapdroid-ca.crt")
        );
    }

    #[test]
    fn elevated_install_ignores_planted_staging_file() {
        let dir = TempDir::new().unwrap();
        let anchors = dir.path().join("anchors");
        fs::create_dir_all(&anchors).unwrap();
        let cert = certificate(dir.path());

        // A link at the old fixed staging path must not be written through.
        let victim = dir.path().join("victim");
        fs::write(&victim, "untouched").unwrap();
        let planted = std::env::temp_dir().join("portalscope-staging-test-ca.crt");
        let _ = fs::remove_file(&planted);
        std::os::unix::fs::symlink(&victim, &planted).unwrap();

        // `env` runs the copy unprivileged.
        let installer = SystemTrustInstaller {
            anchor_dirs: vec![anchors.clone()],
            elevation: Some("env".to_string()),
            refresh: false,
        };
        let result = installer.install("Portalscope Staging Test CA", &cert);
        let _ = fs::remove_file(&planted);

        result.unwrap();
        assert_eq!(fs::read_to_string(&victim).unwrap(), "untouched");
        assert_eq!(
            fs::read_to_string(anchors.join("portalscope-staging-test-ca.crt")).unwrap(),
            cert.pem()
        );
    }

    #[test]
    fn missing_directory_has_no_handler() {
        let dir = TempDir::new().unwrap();
        let cert = certificate(dir.path());

        let installer = SystemTrustInstaller::for_directory(dir.path().join("missing"));
        let err = installer.install("PCAPdroid CA", &cert).unwrap_err();
        assert!(matches!(err, InstallError::NoHandler));
        assert!(err.is_unavailable());
    }

    #[test]
    fn file_name_is_sanitized() {
        assert_eq!(SystemTrustInstaller::file_name("PCAPdroid CA"), "pcapdroid-ca.crt");
    }

    #[test]
    fn refresh_command_per_distribution() {
        assert_eq!(
            SystemTrustInstaller::refresh_command(Path::new("/etc/pki/ca-trust/source/anchors")),
            Some(&["update-ca-trust", "extract"][..])
        );
        assert!(SystemTrustInstaller::refresh_command(Path::new("/tmp/anchors")).is_none());
    }
}
