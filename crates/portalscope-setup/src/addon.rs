//! Decryption addon installation state.

use portalscope_core::{
    is_semantic_version_compatible, AddonState, MitmSettings, PackageInfo, SetupFlags,
};

/// Derives the addon state from installed-package metadata.
///
/// A missing package or an empty version name is `NotInstalled`. A version
/// sharing the target's major number is usable: `UpdateAvailable` when its
/// version code is below the target and the target version was not
/// ignored, `Installed` otherwise. Other versions are `NewVersionRequired`
/// when older than the target and `IncompatibleVersion` when newer.
pub fn derive_addon_state(
    info: Option<&PackageInfo>,
    settings: &MitmSettings,
    flags: &SetupFlags,
) -> AddonState {
    let Some(info) = info else {
        return AddonState::NotInstalled;
    };
    let Some(name) = info.version_name.as_deref().filter(|n| !n.is_empty()) else {
        return AddonState::NotInstalled;
    };

    if is_semantic_version_compatible(Some(&settings.target_version_name), Some(name)) {
        if new_version_available(Some(info), settings, flags).is_some() {
            AddonState::UpdateAvailable
        } else {
            AddonState::Installed
        }
    } else if info.version_code < settings.target_version_code {
        AddonState::NewVersionRequired
    } else {
        AddonState::IncompatibleVersion
    }
}

/// Returns the target version name if it is a compatible upgrade over the
/// installed addon and its notice was not dismissed.
pub fn new_version_available(
    info: Option<&PackageInfo>,
    settings: &MitmSettings,
    flags: &SetupFlags,
) -> Option<String> {
    if flags.is_ignored_mitm_version(&settings.target_version_name) {
        return None;
    }

    let info = info?;
    if info.version_code >= settings.target_version_code {
        return None;
    }

    is_semantic_version_compatible(
        Some(&settings.target_version_name),
        info.version_name.as_deref(),
    )
    .then(|| settings.target_version_name.clone())
}

/// Returns the release download URL of `version` for `abi`.
pub fn release_download_url(settings: &MitmSettings, version: &str, abi: &str) -> String {
    format!(
        "{repo}/releases/download/v{ver}/PCAPdroid-mitm_v{ver}_{abi}.apk",
        repo = settings.repository.trim_end_matches('/'),
        ver = version,
        abi = abi
    )
}

/// Returns the Android ABI name of the host architecture.
pub fn host_abi() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64-v8a",
        "arm" => "armeabi-v7a",
        "x86" => "x86",
        _ => "x86_64",
    }
}
