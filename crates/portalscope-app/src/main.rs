//! Portalscope - captive portal analyzer control plane.
//!
//! This binary wires the library crates together:
//! - `listen`: telemetry listener only
//! - `capture`: a capture session driven through `adb`
//! - `setup`: decryption setup against the development addon
//! - `cert`: certificate inspection

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portalscope_capture::{
    telemetry_channel, AdbDispatcher, AdbPackages, CaptureController, CaptureSession, CaptureState,
    ListenerCounters, TelemetryListener, TelemetryReceiver,
};
use portalscope_core::config::default_data_dir;
use portalscope_core::{
    AddonState, CertificateUiState, DirectoryTrustStore, PackageInfo, PackageInspector,
    ParsedCertificate, PlatformProfile, PortalConfig, SetupFlags, StaticPackages, TrustStore,
};
use portalscope_mitm::{
    CaAuthority, CaBackend, CertificateInstaller, LoopbackBinder, MitmServiceClient,
    SystemTrustInstaller,
};
use portalscope_setup::{host_abi, PermissionSnapshot, SetupOrchestrator, STEP_COUNT};

/// How long `setup` waits for the addon to answer.
const ADDON_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Portalscope - captive portal analyzer control plane
#[derive(Parser, Debug)]
#[command(name = "portalscope", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file (defaults to config.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the telemetry listener and report datagram counts
    Listen {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Start a capture on the attached device and stop it on Ctrl-C
    Capture {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,

        /// adb serial of the target device
        #[arg(long)]
        serial: Option<String>,
    },

    /// Walk through the decryption setup steps
    Setup {
        /// Export the CA certificate to this file or directory
        #[arg(long)]
        export: Option<PathBuf>,

        /// Install the CA certificate into the trust store
        #[arg(long)]
        install: bool,

        /// Use this directory as the trust store instead of the system anchors
        #[arg(long)]
        trust_dir: Option<PathBuf>,

        /// Treat storage, notification and VPN permissions as granted
        #[arg(long)]
        permissions_granted: bool,

        /// Read the installed addon version from the device through adb
        #[arg(long)]
        adb: bool,

        /// Override the platform API level
        #[arg(long)]
        api_level: Option<u32>,
    },

    /// Decode a certificate file and look it up in the trust store
    Cert {
        /// PEM or DER certificate file
        file: PathBuf,

        /// Use this directory as the trust store instead of the system anchors
        #[arg(long)]
        trust_dir: Option<PathBuf>,
    },
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    default_data_dir().ok().map(|dir| dir.join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("portalscope={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("portalscope")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Reports go to stdout, logs to stderr
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Resolves once Ctrl-C is pressed or `duration` seconds elapsed.
fn stop_signal(duration: Option<u64>) -> BoxFuture<'static, ()> {
    let ctrl_c = tokio::signal::ctrl_c()
        .map(|res| {
            if let Err(e) = res {
                tracing::error!("Ctrl-C handler failed: {}", e);
            }
        })
        .boxed();

    match duration {
        Some(secs) => {
            let timer = tokio::time::sleep(Duration::from_secs(secs)).boxed();
            future::select(ctrl_c, timer).map(|_| ()).boxed()
        }
        None => ctrl_c,
    }
}

/// Consumes forwarded datagrams until the sink closes. Returns the byte total.
async fn drain_telemetry(mut rx: TelemetryReceiver) -> u64 {
    let mut bytes = 0u64;
    while let Some(datagram) = rx.recv().await {
        tracing::trace!(
            "Datagram #{} from {}: {} bytes",
            datagram.sequence,
            datagram.source,
            datagram.bytes.len()
        );
        bytes += datagram.bytes.len() as u64;
    }
    bytes
}

async fn run_listen(config: &PortalConfig, duration: Option<u64>) -> anyhow::Result<()> {
    let settings = &config.capture;
    let (sink, rx) = telemetry_channel(settings.sink_capacity);
    let counters = Arc::new(ListenerCounters::default());
    let addr = CaptureController::new(settings.clone()).listen_addr();

    let listener = TelemetryListener::bind(
        addr,
        settings.max_datagram_size,
        Some(sink),
        counters.clone(),
    )
    .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let drain = tokio::spawn(drain_telemetry(rx));

    println!("Listening on {}", listener.local_addr());
    stop_signal(duration).await;

    listener.stop().await;
    let bytes = drain.await.context("telemetry drain task failed")?;

    println!(
        "Received {} datagrams ({} bytes), dropped {}",
        counters.received(),
        bytes,
        counters.dropped()
    );
    Ok(())
}

async fn run_capture(
    config: &PortalConfig,
    duration: Option<u64>,
    serial: Option<String>,
) -> anyhow::Result<()> {
    let (sink, rx) = telemetry_channel(config.capture.sink_capacity);
    let controller = CaptureController::new(config.capture.clone()).with_sink(sink);

    let mut dispatcher = AdbDispatcher::new();
    if let Some(serial) = serial {
        dispatcher = dispatcher.with_serial(serial);
    }

    let drain = tokio::spawn(drain_telemetry(rx));
    let mut session = CaptureSession::new(controller, dispatcher);
    let poll_interval = Duration::from_secs(config.capture.status_poll_secs.max(1));

    let state = session.run_until(poll_interval, stop_signal(duration)).await;
    let controller = session.controller();
    println!("Capture {}: {}", state, controller.status_message());
    println!("Datagrams received: {}", controller.datagrams_received());

    if state == CaptureState::FileReady {
        if let Some(name) = controller.target_pcap_name() {
            println!("Capture file {} is ready on the device", name);
        }
    }

    // Dropping the session releases the last sink handle.
    drop(session);
    let bytes = drain.await.context("telemetry drain task failed")?;
    tracing::info!("Capture finished, {} bytes forwarded", bytes);
    Ok(())
}

fn trust_store_for(trust_dir: Option<&Path>) -> DirectoryTrustStore {
    match trust_dir {
        Some(dir) => DirectoryTrustStore::new().with_root("user", dir),
        None => DirectoryTrustStore::linux_anchors(),
    }
}

struct SetupOptions {
    export: Option<PathBuf>,
    install: bool,
    trust_dir: Option<PathBuf>,
    permissions_granted: bool,
    adb: bool,
}

async fn run_setup(
    mut config: PortalConfig,
    data_dir: &Path,
    api_level: Option<u32>,
    options: SetupOptions,
) -> anyhow::Result<()> {
    if let Some(level) = api_level {
        config.platform = PlatformProfile::new(level);
    }

    let authority = CaAuthority::new(data_dir.join("ca"));
    let backend = CaBackend::new(&authority).context("failed to prepare development CA")?;
    let binder = Arc::new(LoopbackBinder::new(Arc::new(backend), &config.mitm.package));
    let client = MitmServiceClient::new(binder, &config.mitm);

    let packages: Arc<dyn PackageInspector> = if options.adb {
        let packages = AdbPackages::new();
        packages.refresh(&config.mitm.package).await;
        Arc::new(packages)
    } else {
        // The development addon always runs the target version.
        let packages = StaticPackages::new();
        packages.insert(PackageInfo::new(
            &config.mitm.package,
            &config.mitm.target_version_name,
            config.mitm.target_version_code,
        ));
        Arc::new(packages)
    };

    let installer: Arc<dyn CertificateInstaller> = match &options.trust_dir {
        Some(dir) => Arc::new(SystemTrustInstaller::for_directory(dir)),
        None => Arc::new(SystemTrustInstaller::new()),
    };
    let trust_store = Arc::new(trust_store_for(options.trust_dir.as_deref()));

    let flags_path = data_dir.join("setup_flags.json");
    let flags = SetupFlags::load(&flags_path).context("failed to load setup flags")?;

    let mut orchestrator = SetupOrchestrator::new(&config, client, packages, trust_store)
        .with_installer(installer)
        .with_flags(flags, Some(flags_path));

    let permissions = if options.permissions_granted {
        PermissionSnapshot::all_granted()
    } else {
        PermissionSnapshot::default()
    };
    orchestrator.initialize(permissions);

    while *orchestrator.certificate_state() == CertificateUiState::Loading {
        match tokio::time::timeout(ADDON_REPLY_TIMEOUT, orchestrator.process_next_event()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("Addon did not answer within {:?}", ADDON_REPLY_TIMEOUT);
                break;
            }
        }
    }

    if options.install {
        orchestrator.install_certificate();
    }

    if let Some(path) = options.export {
        let path = if path.is_dir() {
            path.join(orchestrator.export_file_name())
        } else {
            path
        };
        if orchestrator.export_certificate(&path) {
            println!("Certificate exported to {}", path.display());
        }
    }

    let target = orchestrator.target_version();
    println!("Addon: {}", orchestrator.addon_state());
    if orchestrator.addon_state() != AddonState::Installed {
        println!(
            "  download: {}",
            orchestrator.release_download_url(&target, host_abi())
        );
    }
    println!("Certificate: {}", orchestrator.certificate_state());
    if let Some(cert) = orchestrator.certificate() {
        println!("  subject: {}", cert.subject());
        println!("  fingerprint: {}", cert.fingerprint_sha256());
    }
    println!(
        "Steps completed: {}/{}",
        orchestrator.completed_steps_count(),
        STEP_COUNT
    );
    println!("Setup needed: {}", orchestrator.needs_setup());

    orchestrator.shutdown();
    Ok(())
}

fn run_cert(file: &Path, trust_dir: Option<&Path>) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("failed to read {:?}", file))?;
    let mut cert = ParsedCertificate::from_bytes(&bytes).context("not a certificate")?;

    let store = trust_store_for(trust_dir);
    store.refresh_alias(&mut cert);

    println!("Subject: {}", cert.subject());
    println!("Issuer: {}", cert.issuer());
    println!("Serial: {}", cert.serial());
    println!("SHA-256: {}", cert.fingerprint_sha256());
    println!("Trusted as: {}", cert.alias().unwrap_or("not trusted"));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Portalscope...");
    tracing::debug!("Args: {:?}", args);

    let data_dir = default_data_dir().context("no data directory available")?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("config.json"));
    let config = PortalConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;
    tracing::info!("Configuration loaded from {:?}", config_path);

    match args.command {
        Command::Listen { duration } => run_listen(&config, duration).await?,
        Command::Capture { duration, serial } => run_capture(&config, duration, serial).await?,
        Command::Setup {
            export,
            install,
            trust_dir,
            permissions_granted,
            adb,
            api_level,
        } => {
            let options = SetupOptions {
                export,
                install,
                trust_dir,
                permissions_granted,
                adb,
            };
            run_setup(config, &data_dir, api_level, options).await?
        }
        Command::Cert { file, trust_dir } => run_cert(&file, trust_dir.as_deref())?,
    }

    tracing::info!("Portalscope shutting down");
    Ok(())
}
