//! Android debug bridge backends.
//!
//! [`AdbDispatcher`] delivers capture commands with `adb shell am start`
//! and [`AdbPackages`] reads installed-package metadata with
//! `adb shell dumpsys package`. Both talk to a single device, selected by
//! serial when more than one is attached.

use async_trait::async_trait;
use tokio::process::Command;

use portalscope_core::{PackageInfo, PackageInspector, StaticPackages};

use crate::command::{
    CaptureCommand, CaptureVerb, CommandDispatcher, CommandResult, Extra, RESULT_CANCELED,
};
use crate::error::{CaptureError, Result};

/// Output fragments `am start` prints when the component does not exist.
const NOT_FOUND_MARKERS: &[&str] = &["does not exist", "Error type 3", "unable to resolve Intent"];

/// Dispatches capture commands through `adb shell am start`.
#[derive(Debug, Clone)]
pub struct AdbDispatcher {
    program: String,
    serial: Option<String>,
}

impl Default for AdbDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbDispatcher {
    /// Uses `adb` from `PATH` and the only attached device.
    pub fn new() -> Self {
        Self {
            program: "adb".to_string(),
            serial: None,
        }
    }

    /// Uses a specific adb executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Targets the device with this serial.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Builds the adb argument list for a command.
    pub fn build_args(&self, command: &CaptureCommand) -> Vec<String> {
        let mut args = device_args(self.serial.as_deref());
        args.extend(
            ["shell", "am", "start", "-n"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(format!(
            "{}/{}",
            command.target_package, command.target_component
        ));

        for (key, value) in &command.extras {
            let (flag, rendered) = match value {
                Extra::Str(s) => ("-e", shell_quote(s)),
                Extra::Int(i) => ("--ei", i.to_string()),
                Extra::Bool(b) => ("--ez", b.to_string()),
            };
            args.push(flag.to_string());
            args.push(key.clone());
            args.push(rendered);
        }

        args
    }
}

#[async_trait]
impl CommandDispatcher for AdbDispatcher {
    async fn dispatch(&self, command: &CaptureCommand) -> Result<CommandResult> {
        let args = self.build_args(command);
        tracing::debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| CaptureError::Dispatch(format!("failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let result = parse_am_output(&command.target_package, output.status.success(), &stdout, &stderr)?;

        // am start cannot carry a reply payload back.
        if command.verb() == CaptureVerb::GetStatus {
            tracing::debug!("Status reply not available over adb");
            return Ok(CommandResult::failed(RESULT_CANCELED));
        }

        Ok(result)
    }
}

/// Interprets the output of `am start`.
fn parse_am_output(
    target: &str,
    exited_ok: bool,
    stdout: &str,
    stderr: &str,
) -> Result<CommandResult> {
    let combined = format!("{}\n{}", stdout, stderr);
    if NOT_FOUND_MARKERS.iter().any(|m| combined.contains(m)) {
        return Err(CaptureError::TargetNotFound(target.to_string()));
    }

    if !exited_ok {
        return Err(CaptureError::Dispatch(stderr.trim().to_string()));
    }

    if combined.lines().any(|l| l.trim_start().starts_with("Error")) {
        tracing::warn!("am start reported: {}", combined.trim());
        return Ok(CommandResult::failed(RESULT_CANCELED));
    }

    Ok(CommandResult::ok())
}

/// Reads installed packages through `adb shell dumpsys package`.
///
/// Lookups through [`PackageInspector`] only read the answers cached by
/// [`AdbPackages::refresh`], so they never wait on the device.
#[derive(Debug)]
pub struct AdbPackages {
    program: String,
    serial: Option<String>,
    cache: StaticPackages,
}

impl Default for AdbPackages {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbPackages {
    /// Uses `adb` from `PATH` and the only attached device.
    pub fn new() -> Self {
        Self {
            program: "adb".to_string(),
            serial: None,
            cache: StaticPackages::new(),
        }
    }

    /// Uses a different adb executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Targets the device with this serial.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Queries `package` on the device and caches the answer.
    ///
    /// A failed query counts as not installed.
    pub async fn refresh(&self, package: &str) -> Option<PackageInfo> {
        let mut args = device_args(self.serial.as_deref());
        args.extend(
            ["shell", "dumpsys", "package", package]
                .iter()
                .map(|s| s.to_string()),
        );

        let info = match Command::new(&self.program).args(&args).output().await {
            Ok(output) => parse_dumpsys(package, &String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                tracing::warn!("Failed to run {}: {}", self.program, e);
                None
            }
        };

        match &info {
            Some(info) => {
                tracing::debug!("{} installed, version code {}", package, info.version_code);
                self.cache.insert(info.clone());
            }
            None => self.cache.remove(package),
        }
        info
    }
}

impl PackageInspector for AdbPackages {
    fn package_info(&self, package: &str) -> Option<PackageInfo> {
        self.cache.package_info(package)
    }
}

/// Extracts version metadata from `dumpsys package` output.
fn parse_dumpsys(package: &str, output: &str) -> Option<PackageInfo> {
    let mut version_name = None;
    let mut version_code = None;

    for token in output.split_whitespace() {
        if version_name.is_none() {
            if let Some(v) = token.strip_prefix("versionName=") {
                version_name = Some(v.to_string());
            }
        }
        if version_code.is_none() {
            if let Some(v) = token.strip_prefix("versionCode=") {
                version_code = v.parse::<u64>().ok();
            }
        }
    }

    let version_code = version_code?;
    Some(PackageInfo {
        package: package.to_string(),
        version_name: version_name.filter(|v| !v.is_empty() && v != "null"),
        version_code,
    })
}

fn device_args(serial: Option<&str>) -> Vec<String> {
    match serial {
        Some(serial) => vec!["-s".to_string(), serial.to_string()],
        None => Vec::new(),
    }
}

/// Single-quotes a value for the device shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
