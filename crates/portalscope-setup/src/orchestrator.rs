//! Decryption setup orchestration.
//!
//! [`SetupOrchestrator`] aggregates permission, addon and certificate state
//! into [`ReadinessSteps`] and drives CA provisioning through the addon
//! client:
//!
//! ```text
//! connect ──► Connected ──► request certificate ──► CertificateReceived
//!                                                        │
//!                    ┌───────────────────────────────────┼──────────────────┐
//!                    ▼                                   ▼                  ▼
//!               Installed                         ReadyToInstall      ReadyToExport ──► Exported
//!                    ▲                                   │ install           ▲
//!                    └──────── found in trust store ─────┤                   │
//!                                                        └─ fails ► fallback ┘
//! ```
//!
//! `Installed` is only reported after a fresh trust-store lookup found the
//! certificate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use portalscope_core::{
    AddonState, CertificateUiState, MitmSettings, PackageInspector, ParsedCertificate,
    PlatformProfile, PortalConfig, SetupFlags, TrustStore,
};
use portalscope_mitm::{
    export_pem, CertificateInstaller, ClientEvent, InstallError, MitmServiceClient,
};

use crate::addon;
use crate::readiness::{PermissionSnapshot, ReadinessSteps, STEP_COUNT};

/// Drives the decryption setup flow.
pub struct SetupOrchestrator {
    settings: MitmSettings,
    platform: PlatformProfile,
    client: MitmServiceClient,
    packages: Arc<dyn PackageInspector>,
    trust_store: Arc<dyn TrustStore>,
    installer: Option<Arc<dyn CertificateInstaller>>,
    flags: SetupFlags,
    flags_path: Option<PathBuf>,
    steps: ReadinessSteps,
    addon_state: AddonState,
    certificate_state: CertificateUiState,
    ca_pem: Option<String>,
    certificate: Option<ParsedCertificate>,
    fallback_export: bool,
}

impl SetupOrchestrator {
    /// Creates an orchestrator. Nothing is queried until [`Self::initialize`].
    pub fn new(
        config: &PortalConfig,
        client: MitmServiceClient,
        packages: Arc<dyn PackageInspector>,
        trust_store: Arc<dyn TrustStore>,
    ) -> Self {
        Self {
            settings: config.mitm.clone(),
            platform: config.platform,
            client,
            packages,
            trust_store,
            installer: None,
            flags: SetupFlags::default(),
            flags_path: None,
            steps: ReadinessSteps::from_permissions(&config.platform, &PermissionSnapshot::default()),
            addon_state: AddonState::NotInstalled,
            certificate_state: CertificateUiState::Loading,
            ca_pem: None,
            certificate: None,
            fallback_export: false,
        }
    }

    /// Sets the direct install path.
    pub fn with_installer(mut self, installer: Arc<dyn CertificateInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Uses `flags`, persisting changes to `path` if given.
    pub fn with_flags(mut self, flags: SetupFlags, path: Option<PathBuf>) -> Self {
        self.flags = flags;
        self.flags_path = path;
        self
    }

    /// Queries the addon state, connects to the addon and applies the
    /// current permission state.
    pub fn initialize(&mut self, permissions: PermissionSnapshot) {
        self.refresh_addon_state();
        self.connect_to_addon();
        self.check_permissions(permissions);
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Returns the readiness steps.
    pub fn readiness(&self) -> ReadinessSteps {
        self.steps
    }

    /// Returns the number of satisfied steps.
    pub fn completed_steps_count(&self) -> u8 {
        self.steps.completed()
    }

    /// Returns true when the "continue" action is enabled.
    pub fn can_continue(&self) -> bool {
        self.steps.is_complete()
    }

    /// Re-reads permission state from the platform.
    pub fn check_permissions(&mut self, permissions: PermissionSnapshot) {
        let derived = ReadinessSteps::from_permissions(&self.platform, &permissions);
        self.steps.storage = derived.storage;
        self.steps.notifications = derived.notifications;
        self.steps.vpn = derived.vpn;
        self.update_completed_steps();
    }

    /// Storage permission prompt answered. A denial changes nothing.
    pub fn on_storage_permission_result(&mut self, granted: bool) {
        if granted {
            self.steps.storage = true;
            self.update_completed_steps();
        }
    }

    /// Notification permission prompt answered. A denial changes nothing.
    pub fn on_notification_permission_result(&mut self, granted: bool) {
        if granted {
            self.steps.notifications = true;
            self.update_completed_steps();
        }
    }

    /// VPN consent prompt answered. A denial changes nothing.
    pub fn on_vpn_permission_result(&mut self, granted: bool) {
        if granted {
            self.steps.vpn = true;
            self.update_completed_steps();
        }
    }

    fn update_completed_steps(&mut self) {
        self.steps.certificate = self.certificate_state.is_installed();
        self.steps.addon = self.addon_state.is_usable();

        let count = self.steps.completed();
        tracing::debug!("Setup steps completed: {}/{}", count, STEP_COUNT);

        if self.steps.is_complete() && !self.flags.tls_decryption_setup_done {
            tracing::info!("Decryption setup complete");
            self.flags.tls_decryption_setup_done = true;
            self.save_flags();
        }
    }

    // ========================================================================
    // Addon
    // ========================================================================

    /// Re-derives the addon state from installed-package metadata.
    pub fn refresh_addon_state(&mut self) -> AddonState {
        let info = self.packages.package_info(&self.settings.package);
        let state = addon::derive_addon_state(info.as_ref(), &self.settings, &self.flags);
        if state != self.addon_state {
            tracing::info!("Addon state {} -> {}", self.addon_state, state);
        }
        self.addon_state = state;
        self.update_completed_steps();
        state
    }

    /// Returns the addon state.
    pub fn addon_state(&self) -> AddonState {
        self.addon_state
    }

    /// Returns the addon version to offer for download.
    pub fn target_version(&self) -> String {
        let info = self.packages.package_info(&self.settings.package);
        addon::new_version_available(info.as_ref(), &self.settings, &self.flags)
            .unwrap_or_else(|| self.settings.target_version_name.clone())
    }

    /// Returns the release download URL of `version` for `abi`.
    pub fn release_download_url(&self, version: &str, abi: &str) -> String {
        addon::release_download_url(&self.settings, version, abi)
    }

    /// Silences the update notice for the target version.
    pub fn ignore_new_version(&mut self) {
        tracing::info!(
            "Ignoring addon version {}",
            self.settings.target_version_name
        );
        self.flags.ignored_mitm_version = Some(self.settings.target_version_name.clone());
        self.save_flags();
        self.refresh_addon_state();
    }

    /// Returns true unless setup was completed and a compatible addon is
    /// still installed. Clears the completion flag if the addon vanished.
    pub fn needs_setup(&mut self) -> bool {
        if !self.flags.tls_decryption_setup_done {
            return true;
        }

        let info = self.packages.package_info(&self.settings.package);
        if !addon::derive_addon_state(info.as_ref(), &self.settings, &self.flags).is_usable() {
            tracing::info!("Addon no longer usable, setup needed again");
            self.flags.tls_decryption_setup_done = false;
            self.save_flags();
            return true;
        }

        false
    }

    /// Records whether the user skipped CA installation.
    pub fn set_ca_installation_skipped(&mut self, skipped: bool) {
        if self.flags.ca_installation_skipped != skipped {
            self.flags.ca_installation_skipped = skipped;
            self.save_flags();
        }
    }

    /// Returns true if the user skipped CA installation.
    pub fn is_ca_installation_skipped(&self) -> bool {
        self.flags.ca_installation_skipped
    }

    /// Returns the persisted flags.
    pub fn flags(&self) -> &SetupFlags {
        &self.flags
    }

    // ========================================================================
    // Certificate
    // ========================================================================

    /// Returns the certificate state.
    pub fn certificate_state(&self) -> &CertificateUiState {
        &self.certificate_state
    }

    /// Returns the decoded certificate, if one was received.
    pub fn certificate(&self) -> Option<&ParsedCertificate> {
        self.certificate.as_ref()
    }

    /// Returns the addon client.
    pub fn client(&self) -> &MitmServiceClient {
        &self.client
    }

    /// Returns the suggested export file name.
    pub fn export_file_name(&self) -> &str {
        &self.settings.ca_export_filename
    }

    /// Connects to the addon unless already connected.
    pub fn connect_to_addon(&mut self) {
        if !self.client.is_connected() && !self.client.connect() {
            self.set_certificate_state(CertificateUiState::ConnectionError);
        }
    }

    /// Checks the known certificate against the trust store, or asks the
    /// addon for it.
    ///
    /// A certificate that left the trust store stops counting as installed
    /// right away, whether or not the addon answers the new request.
    pub fn check_certificate_status(&mut self) {
        let trusted = match self.certificate.as_mut() {
            Some(cert) => self.trust_store.refresh_alias(cert),
            None => false,
        };

        if trusted {
            self.set_ca_installation_skipped(false);
            self.set_certificate_state(CertificateUiState::Installed);
            return;
        }

        if self.certificate_state.is_installed() {
            tracing::info!("CA certificate no longer trusted");
            if self.ca_pem.is_some() {
                self.on_certificate_received(self.ca_pem.clone());
            } else {
                self.set_certificate_state(CertificateUiState::Loading);
            }
        }
        self.request_certificate();
    }

    fn request_certificate(&mut self) {
        if self.client.is_connected() {
            if !self.client.request_ca_certificate() {
                self.set_certificate_state(CertificateUiState::Error(
                    "Certificate request failed".to_string(),
                ));
            }
        } else {
            self.connect_to_addon();
        }
    }

    /// Waits for the next client event and applies it.
    pub async fn process_next_event(&mut self) -> Option<ClientEvent> {
        let event = self.client.next_event().await?;
        self.handle_client_event(event.clone());
        Some(event)
    }

    /// Applies a client event.
    pub fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => self.on_service_connected(),
            ClientEvent::Disconnected => self.on_service_disconnected(),
            ClientEvent::CertificateReceived(pem) => self.on_certificate_received(pem),
        }
    }

    fn on_service_connected(&mut self) {
        if !self.client.request_ca_certificate() {
            self.set_certificate_state(CertificateUiState::Error(
                "Certificate request failed".to_string(),
            ));
        }
    }

    fn on_service_disconnected(&mut self) {
        if self.ca_pem.is_none() {
            self.set_certificate_state(CertificateUiState::ConnectionError);
        } else {
            tracing::info!("Addon disconnected, keeping certificate state");
        }
    }

    /// Applies the certificate handed out by the addon.
    pub fn on_certificate_received(&mut self, pem: Option<String>) {
        self.ca_pem = pem.clone();

        let Some(pem) = pem else {
            self.set_certificate_state(CertificateUiState::Error(
                "Certificate retrieval failed".to_string(),
            ));
            return;
        };

        let mut cert = match ParsedCertificate::from_pem(&pem) {
            Ok(cert) => cert,
            Err(e) => {
                tracing::error!("Addon certificate rejected: {}", e);
                self.ca_pem = None;
                self.certificate = None;
                self.set_certificate_state(CertificateUiState::Error(
                    "invalid certificate".to_string(),
                ));
                return;
            }
        };

        let state = if self.trust_store.refresh_alias(&mut cert) {
            tracing::info!(
                "CA certificate trusted as {}",
                cert.alias().unwrap_or("unknown")
            );
            CertificateUiState::Installed
        } else {
            if self.flags.tls_decryption_setup_done {
                self.flags.tls_decryption_setup_done = false;
                self.save_flags();
            }
            if self.can_install_directly() {
                CertificateUiState::ReadyToInstall
            } else {
                CertificateUiState::ReadyToExport
            }
        };

        self.certificate = Some(cert);
        self.set_certificate_state(state);
    }

    /// Returns true if the direct install path may be offered.
    pub fn can_install_directly(&self) -> bool {
        self.installer.is_some() && self.platform.supports_intent_ca_install() && !self.fallback_export
    }

    /// Runs the direct install path.
    pub fn install_certificate(&mut self) {
        let (Some(installer), Some(cert)) = (self.installer.clone(), self.certificate.clone()) else {
            tracing::warn!("No certificate or installer, falling back to export");
            self.fallback_to_export();
            return;
        };

        if !self.platform.supports_intent_ca_install() {
            tracing::warn!("{}", InstallError::Unsupported(self.platform.api_level));
            self.fallback_to_export();
            return;
        }

        match installer.install(&self.settings.ca_install_name, &cert) {
            Ok(()) => self.handle_install_result(true),
            Err(e) if e.is_unavailable() => {
                tracing::warn!("Direct install unavailable: {}", e);
                self.fallback_to_export();
            }
            Err(e) => {
                tracing::error!("Direct install failed: {}", e);
                self.handle_install_result(false);
            }
        }
    }

    /// Applies the outcome of the direct install path.
    pub fn handle_install_result(&mut self, ok: bool) {
        let trusted = ok
            && match self.certificate.as_mut() {
                Some(cert) => self.trust_store.refresh_alias(cert),
                None => false,
            };

        if trusted {
            self.set_certificate_state(CertificateUiState::Installed);
        } else {
            self.fallback_to_export();
        }
    }

    /// Switches to the export path and re-evaluates the certificate, if
    /// one was received.
    pub fn fallback_to_export(&mut self) {
        tracing::info!("Falling back to certificate export");
        self.fallback_export = true;
        if self.ca_pem.is_some() {
            self.on_certificate_received(self.ca_pem.clone());
        }
    }

    /// Writes the certificate PEM to `path`. Returns true when written.
    ///
    /// Only a received, untrusted certificate is exported: the state must
    /// be `ReadyToExport`, `ReadyToInstall` or `Exported`.
    pub fn export_certificate(&mut self, path: &Path) -> bool {
        let exportable = matches!(
            self.certificate_state,
            CertificateUiState::ReadyToExport
                | CertificateUiState::ReadyToInstall
                | CertificateUiState::Exported
        );
        if !exportable {
            tracing::warn!(
                "Certificate not exportable in state {}",
                self.certificate_state
            );
            return false;
        }

        let Some(pem) = self.ca_pem.as_deref() else {
            tracing::warn!("No certificate to export");
            return false;
        };

        match export_pem(pem, path) {
            Ok(()) => {
                self.set_certificate_state(CertificateUiState::Exported);
                true
            }
            Err(e) => {
                tracing::error!("Certificate export to {:?} failed: {}", path, e);
                false
            }
        }
    }

    /// Releases the addon binding.
    pub fn shutdown(&mut self) {
        self.client.disconnect();
    }

    fn set_certificate_state(&mut self, state: CertificateUiState) {
        if state != self.certificate_state {
            tracing::info!("Certificate state {} -> {}", self.certificate_state, state);
        }
        self.certificate_state = state;
        self.update_completed_steps();
    }

    fn save_flags(&self) {
        if let Some(path) = &self.flags_path {
            if let Err(e) = self.flags.save(path) {
                tracing::warn!("Failed to save setup flags to {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use portalscope_core::{MemoryTrustStore, PackageInfo, StaticPackages};
    use portalscope_mitm::{CaBackend, LoopbackBinder};
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use tempfile::TempDir;

    fn generate_pem() -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Test Addon CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.self_signed(&key_pair).unwrap().pem()
    }

    /// Installer that adds the certificate to a memory trust store.
    struct TrustingInstaller {
        store: Arc<MemoryTrustStore>,
        result: fn() -> Result<(), InstallError>,
    }

    impl CertificateInstaller for TrustingInstaller {
        fn install(&self, name: &str, cert: &ParsedCertificate) -> Result<(), InstallError> {
            (self.result)()?;
            self.store.add(format!("user:{}", name), cert.der().to_vec());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: SetupOrchestrator,
        binder: Arc<LoopbackBinder>,
        packages: Arc<StaticPackages>,
        store: Arc<MemoryTrustStore>,
        pem: Option<String>,
    }

    fn harness(api_level: u32, pem: Option<String>) -> Harness {
        let config = PortalConfig {
            platform: PlatformProfile::new(api_level),
            ..PortalConfig::default()
        };
        let backend = Arc::new(CaBackend::with_certificate(pem.clone()));
        let binder = Arc::new(LoopbackBinder::new(backend, &config.mitm.package));
        let client = MitmServiceClient::new(binder.clone(), &config.mitm);
        let packages = Arc::new(StaticPackages::new());
        let store = Arc::new(MemoryTrustStore::new());

        let orchestrator =
            SetupOrchestrator::new(&config, client, packages.clone(), store.clone());
        Harness {
            orchestrator,
            binder,
            packages,
            store,
            pem,
        }
    }

    /// Runs initialize and pumps connect + certificate reply.
    async fn provision(h: &mut Harness) {
        h.orchestrator.initialize(PermissionSnapshot::default());
        assert_eq!(
            h.orchestrator.process_next_event().await,
            Some(ClientEvent::Connected)
        );
        assert!(matches!(
            h.orchestrator.process_next_event().await,
            Some(ClientEvent::CertificateReceived(_))
        ));
    }

    #[tokio::test]
    async fn untrusted_certificate_is_ready_to_export_on_modern_platform() {
        let mut h = harness(34, Some(generate_pem()));
        provision(&mut h).await;

        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
        assert!(h.orchestrator.certificate().is_some());
    }

    #[tokio::test]
    async fn trusted_certificate_is_installed() {
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        let der = ParsedCertificate::from_pem(&pem).unwrap().der().to_vec();
        h.store.add("user:abcd.0", der);

        provision(&mut h).await;
        assert_eq!(h.orchestrator.certificate_state(), &CertificateUiState::Installed);
        assert_eq!(
            h.orchestrator.certificate().and_then(|c| c.alias()),
            Some("user:abcd.0")
        );
        assert!(h.orchestrator.readiness().certificate);
    }

    #[tokio::test]
    async fn missing_certificate_is_error() {
        let mut h = harness(34, None);
        provision(&mut h).await;
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::Error("Certificate retrieval failed".into())
        );
    }

    #[tokio::test]
    async fn invalid_certificate_is_error() {
        let mut h = harness(34, Some("-----BEGIN CERTIFICATE-----\nAAAA\n".into()));
        provision(&mut h).await;
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::Error("invalid certificate".into())
        );
        assert!(h.orchestrator.certificate().is_none());
    }

    #[test]
    fn unavailable_addon_is_connection_error() {
        let mut h = harness(34, Some(generate_pem()));
        h.binder.set_available(false);
        h.orchestrator.initialize(PermissionSnapshot::default());
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ConnectionError
        );
    }

    #[tokio::test]
    async fn disconnect_before_certificate_is_connection_error() {
        let mut h = harness(34, Some(generate_pem()));
        h.orchestrator.initialize(PermissionSnapshot::default());
        h.binder.kill();

        // Connected is still queued; the request it triggers fails.
        h.orchestrator.process_next_event().await;
        assert_eq!(
            h.orchestrator.process_next_event().await,
            Some(ClientEvent::Disconnected)
        );
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ConnectionError
        );
    }

    #[tokio::test]
    async fn disconnect_after_certificate_keeps_state() {
        let mut h = harness(34, Some(generate_pem()));
        provision(&mut h).await;
        h.binder.kill();

        assert_eq!(
            h.orchestrator.process_next_event().await,
            Some(ClientEvent::Disconnected)
        );
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
    }

    #[tokio::test]
    async fn legacy_platform_installs_directly() {
        let mut h = harness(28, Some(generate_pem()));
        let installer = Arc::new(TrustingInstaller {
            store: h.store.clone(),
            result: || Ok(()),
        });
        h.orchestrator = h.orchestrator.with_installer(installer);
        provision(&mut h).await;
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToInstall
        );

        h.orchestrator.install_certificate();
        assert_eq!(h.orchestrator.certificate_state(), &CertificateUiState::Installed);
    }

    #[tokio::test]
    async fn install_without_handler_falls_back_to_export() {
        let mut h = harness(28, Some(generate_pem()));
        let installer = Arc::new(TrustingInstaller {
            store: h.store.clone(),
            result: || Err(InstallError::NoHandler),
        });
        h.orchestrator = h.orchestrator.with_installer(installer);
        provision(&mut h).await;

        h.orchestrator.install_certificate();
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
        assert!(!h.orchestrator.can_install_directly());
    }

    #[tokio::test]
    async fn ok_install_result_without_trust_falls_back() {
        let mut h = harness(28, Some(generate_pem()));
        let installer = Arc::new(TrustingInstaller {
            store: h.store.clone(),
            result: || Ok(()),
        });
        h.orchestrator = h.orchestrator.with_installer(installer);
        provision(&mut h).await;

        h.orchestrator.handle_install_result(true);
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
    }

    #[tokio::test]
    async fn export_writes_pem_and_sets_exported() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(34, Some(generate_pem()));
        provision(&mut h).await;

        let path = dir.path().join(h.orchestrator.export_file_name());
        assert!(h.orchestrator.export_certificate(&path));
        assert_eq!(h.orchestrator.certificate_state(), &CertificateUiState::Exported);
        assert_eq!(fs::read_to_string(&path).unwrap(), h.pem.clone().unwrap());
    }

    #[tokio::test]
    async fn installed_is_rechecked_not_remembered() {
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        let der = ParsedCertificate::from_pem(&pem).unwrap().der().to_vec();
        h.store.add("user:abcd.0", der.clone());
        provision(&mut h).await;
        assert!(h.orchestrator.certificate_state().is_installed());

        h.store.remove(&der);
        h.orchestrator.check_certificate_status();
        assert_eq!(
            h.orchestrator.process_next_event().await,
            Some(ClientEvent::CertificateReceived(Some(pem)))
        );
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
    }

    #[tokio::test]
    async fn untrusted_recheck_demotes_before_reply() {
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        let der = ParsedCertificate::from_pem(&pem).unwrap().der().to_vec();
        h.store.add("user:abcd.0", der.clone());
        provision(&mut h).await;
        assert!(h.orchestrator.readiness().certificate);

        // The addon's answer is still queued, so nothing re-confirmed it yet.
        h.store.remove(&der);
        h.orchestrator.check_certificate_status();
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::ReadyToExport
        );
        assert!(!h.orchestrator.readiness().certificate);
        assert!(!h.orchestrator.can_continue());
    }

    #[tokio::test]
    async fn invalid_certificate_is_not_exported() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(34, Some("-----BEGIN CERTIFICATE-----\nAAAA\n".into()));
        provision(&mut h).await;

        let path = dir.path().join("ca.crt");
        assert!(!h.orchestrator.export_certificate(&path));
        assert!(!path.exists());
        assert_eq!(
            h.orchestrator.certificate_state(),
            &CertificateUiState::Error("invalid certificate".into())
        );
    }

    #[tokio::test]
    async fn installed_certificate_is_not_exported() {
        let dir = TempDir::new().unwrap();
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        let der = ParsedCertificate::from_pem(&pem).unwrap().der().to_vec();
        h.store.add("user:abcd.0", der);
        provision(&mut h).await;

        let path = dir.path().join("ca.crt");
        assert!(!h.orchestrator.export_certificate(&path));
        assert!(!path.exists());
        assert_eq!(h.orchestrator.certificate_state(), &CertificateUiState::Installed);
        assert!(h.orchestrator.readiness().certificate);
    }

    #[tokio::test]
    async fn check_status_clears_skipped_flag() {
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        provision(&mut h).await;
        h.orchestrator.set_ca_installation_skipped(true);

        let der = ParsedCertificate::from_pem(&pem).unwrap().der().to_vec();
        h.store.add("user:abcd.0", der);
        h.orchestrator.check_certificate_status();

        assert_eq!(h.orchestrator.certificate_state(), &CertificateUiState::Installed);
        assert!(!h.orchestrator.is_ca_installation_skipped());
    }

    #[test]
    fn permission_denial_does_not_regress() {
        let mut h = harness(34, None);
        h.orchestrator.check_permissions(PermissionSnapshot::default());
        let before = h.orchestrator.completed_steps_count();

        h.orchestrator.on_vpn_permission_result(true);
        assert_eq!(h.orchestrator.completed_steps_count(), before + 1);

        h.orchestrator.on_vpn_permission_result(false);
        assert_eq!(h.orchestrator.completed_steps_count(), before + 1);

        h.orchestrator.on_notification_permission_result(true);
        assert_eq!(h.orchestrator.completed_steps_count(), before + 2);
        assert!(h.orchestrator.completed_steps_count() <= 5);
    }

    #[tokio::test]
    async fn all_steps_mark_setup_done() {
        let dir = TempDir::new().unwrap();
        let flags_path = dir.path().join("flags.json");
        let pem = generate_pem();
        let mut h = harness(34, Some(pem.clone()));
        h.packages
            .insert(PackageInfo::new("com.pcapdroid.mitm", "1.4", 21));
        h.store
            .add("user:ca.0", ParsedCertificate::from_pem(&pem).unwrap().der().to_vec());
        h.orchestrator = h
            .orchestrator
            .with_flags(SetupFlags::default(), Some(flags_path.clone()));

        provision(&mut h).await;
        h.orchestrator.check_permissions(PermissionSnapshot::all_granted());

        assert_eq!(h.orchestrator.completed_steps_count(), 5);
        assert!(h.orchestrator.can_continue());
        assert!(SetupFlags::load(&flags_path).unwrap().tls_decryption_setup_done);
        assert!(!h.orchestrator.needs_setup());

        h.packages.remove("com.pcapdroid.mitm");
        assert!(h.orchestrator.needs_setup());
        assert!(!h.orchestrator.flags().tls_decryption_setup_done);
    }

    #[test]
    fn addon_update_and_ignore() {
        let mut h = harness(34, None);
        h.packages
            .insert(PackageInfo::new("com.pcapdroid.mitm", "1.2", 18));

        assert_eq!(h.orchestrator.refresh_addon_state(), AddonState::UpdateAvailable);
        assert_eq!(h.orchestrator.target_version(), "1.4");
        assert!(h.orchestrator.readiness().addon);

        h.orchestrator.ignore_new_version();
        assert_eq!(h.orchestrator.addon_state(), AddonState::Installed);
        assert_eq!(h.orchestrator.flags().ignored_mitm_version.as_deref(), Some("1.4"));
    }

    #[test]
    fn incompatible_addon_does_not_count() {
        let mut h = harness(34, None);
        h.packages
            .insert(PackageInfo::new("com.pcapdroid.mitm", "0.9", 10));
        assert_eq!(
            h.orchestrator.refresh_addon_state(),
            AddonState::NewVersionRequired
        );
        assert!(!h.orchestrator.readiness().addon);
    }
}
