//! Capture controller state machine.
//!
//! Drives the independent capture process through start / stop / status
//! commands and owns the telemetry listener while capture is believed to be
//! running.
//!
//! ## States
//!
//! ```text
//! Idle ──start──► Starting ──ok──► Running ──stop──► Stopping ──► Stopped
//!   ▲                │ fail                              │ ok (pcap file mode)
//!   │                ▼                                   ▼
//!   └───────────── Error                             FileReady ◄──► WrongFilePicked
//! ```
//!
//! ## Reply ordering
//!
//! Every issued command carries a sequence number. A start or stop reply is
//! applied only if it answers the most recently issued start or stop. A
//! status reply is applied only if it was issued after that start or stop;
//! older status replies describe a state that has since been superseded and
//! are ignored.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use portalscope_core::{CaptureSettings, DumpMode};

use crate::command::{
    CaptureCommand, CaptureVerb, CommandResult, CommandTicket, Extra, EXTRA_APP_FILTER,
    EXTRA_COLLECTOR_IP, EXTRA_COLLECTOR_PORT, EXTRA_DUMP_EXTENSIONS, EXTRA_PCAP_DUMP_MODE,
    EXTRA_PCAP_NAME,
};
use crate::error::CaptureError;
use crate::listener::{ListenerCounters, TelemetryListener, TelemetrySink};

/// Capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Nothing requested yet.
    #[default]
    Idle,
    /// Start command issued, waiting for the reply.
    Starting,
    /// Capture process is capturing.
    Running,
    /// Stop command issued, waiting for the reply.
    Stopping,
    /// Capture stopped.
    Stopped,
    /// Capture stopped and the pcap file is ready to be picked.
    FileReady,
    /// The user picked a different file than the one captured.
    WrongFilePicked,
    /// The last attempt failed.
    Error,
}

impl CaptureState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::FileReady => "file_ready",
            Self::WrongFilePicked => "wrong_file_picked",
            Self::Error => "error",
        }
    }

    /// Returns true if a start request is accepted in this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Error | Self::FileReady)
    }

    /// Returns true if a stop request is accepted in this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }

    /// Returns true while a start or stop is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// Returns true for the states that already describe a stopped capture.
    fn is_stopped_like(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Stopped | Self::FileReady | Self::WrongFilePicked
        )
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capture controller.
///
/// All methods are meant to be called from a single control task; the
/// listener runs on its own task and only shares counters with the
/// controller.
pub struct CaptureController {
    settings: CaptureSettings,
    state: CaptureState,
    status_message: String,
    target_pcap_name: Option<String>,
    next_seq: u64,
    /// Latest start or stop that has not been answered yet.
    in_flight: Option<CommandTicket>,
    /// Sequence of the latest start or stop issued.
    last_transition_seq: u64,
    listener: Option<TelemetryListener>,
    sink: Option<TelemetrySink>,
    counters: Arc<ListenerCounters>,
}

impl std::fmt::Debug for CaptureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureController")
            .field("state", &self.state)
            .field("status_message", &self.status_message)
            .field("in_flight", &self.in_flight)
            .field("listener", &self.listener)
            .finish()
    }
}

impl CaptureController {
    /// Creates a controller in the `Idle` state.
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            state: CaptureState::Idle,
            status_message: "Ready to capture.".to_string(),
            target_pcap_name: None,
            next_seq: 0,
            in_flight: None,
            last_transition_seq: 0,
            listener: None,
            sink: None,
            counters: Arc::new(ListenerCounters::default()),
        }
    }

    /// Sets the channel that receives forwarded datagrams.
    pub fn with_sink(mut self, sink: TelemetrySink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Returns the latest status message.
    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Returns the pcap file name requested from the capture process.
    pub fn target_pcap_name(&self) -> Option<&str> {
        self.target_pcap_name.as_deref()
    }

    /// Returns the number of datagrams received since the last start.
    pub fn datagrams_received(&self) -> u64 {
        self.counters.received()
    }

    /// Returns the number of datagrams the sink could not accept.
    pub fn datagrams_dropped(&self) -> u64 {
        self.counters.dropped()
    }

    /// Returns true while the telemetry listener is running.
    pub fn listener_active(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| l.is_running())
    }

    /// Returns the address the telemetry listener is bound to.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    /// Returns the capture settings.
    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Address the telemetry listener binds to.
    ///
    /// Falls back to localhost if `collector_host` is not an IP address.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = match self.settings.collector_host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::warn!(
                    "Collector host {:?} is not an IP address, listening on localhost",
                    self.settings.collector_host
                );
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        };
        SocketAddr::new(ip, self.settings.collector_port)
    }

    /// Requests a capture start.
    ///
    /// Returns the command to dispatch, or `None` if the current state does
    /// not allow starting.
    pub fn request_start(&mut self) -> Option<CaptureCommand> {
        if !self.state.can_start() {
            tracing::warn!("Start request ignored, state is {}", self.state);
            return None;
        }

        self.counters.reset();
        self.target_pcap_name = match self.settings.dump_mode {
            DumpMode::PcapFile => Some(self.settings.pcap_name.clone()),
            DumpMode::UdpExporter => None,
        };

        let ticket = self.issue_transition(CaptureVerb::Start);
        self.set_state(CaptureState::Starting, "Requesting capture start...");

        let mut command = self
            .command(ticket)
            .with_extra(
                EXTRA_PCAP_DUMP_MODE,
                Extra::Str(self.settings.dump_mode.as_str().to_string()),
            )
            .with_extra(
                EXTRA_APP_FILTER,
                Extra::Str(self.settings.app_filter.clone()),
            )
            .with_extra(
                EXTRA_DUMP_EXTENSIONS,
                Extra::Bool(self.settings.dump_extensions),
            );

        command = match self.settings.dump_mode {
            DumpMode::UdpExporter => command
                .with_extra(
                    EXTRA_COLLECTOR_IP,
                    Extra::Str(self.settings.collector_host.clone()),
                )
                .with_extra(
                    EXTRA_COLLECTOR_PORT,
                    Extra::Int(i64::from(self.settings.collector_port)),
                ),
            DumpMode::PcapFile => command.with_extra(
                EXTRA_PCAP_NAME,
                Extra::Str(self.settings.pcap_name.clone()),
            ),
        };

        Some(command)
    }

    /// Requests a capture stop.
    ///
    /// Returns the command to dispatch, or `None` if nothing is running.
    pub fn request_stop(&mut self) -> Option<CaptureCommand> {
        if !self.state.can_stop() {
            tracing::warn!("Stop request ignored, state is {}", self.state);
            return None;
        }

        let ticket = self.issue_transition(CaptureVerb::Stop);
        self.set_state(CaptureState::Stopping, "Requesting capture stop...");
        Some(self.command(ticket))
    }

    /// Requests the capture status. Never changes state.
    pub fn request_status(&mut self) -> CaptureCommand {
        let ticket = self.next_ticket(CaptureVerb::GetStatus);
        self.status_message = "Requesting capture status...".to_string();
        self.command(ticket)
    }

    /// Applies the reply to a previously issued command.
    pub async fn on_command_result(&mut self, ticket: CommandTicket, result: CommandResult) {
        match ticket.verb {
            CaptureVerb::Start | CaptureVerb::Stop => {
                if self.in_flight != Some(ticket) {
                    tracing::warn!(
                        "Ignoring stale {} reply #{} (in flight: {:?})",
                        ticket.verb,
                        ticket.seq,
                        self.in_flight
                    );
                    return;
                }
                self.in_flight = None;

                if ticket.verb == CaptureVerb::Start {
                    self.handle_start_result(result).await;
                } else {
                    self.handle_stop_result(result).await;
                }
            }
            CaptureVerb::GetStatus => {
                if ticket.seq < self.last_transition_seq {
                    tracing::debug!(
                        "Ignoring status reply #{} issued before transition #{}",
                        ticket.seq,
                        self.last_transition_seq
                    );
                    return;
                }
                self.handle_status_result(result).await;
            }
        }
    }

    /// The capture process could not be resolved.
    pub async fn on_target_process_not_found(&mut self) {
        tracing::error!("Capture app {} not found", self.settings.target_package);
        self.in_flight = None;
        self.target_pcap_name = None;
        self.stop_listener().await;
        self.set_state(CaptureState::Error, "Error: capture app not installed.");
    }

    /// The capture process reported that it stopped on its own.
    pub async fn on_external_stop_notification(&mut self) {
        if !self.state.can_stop() {
            tracing::debug!("External stop ignored, state is {}", self.state);
            return;
        }

        tracing::info!("Capture stopped externally");
        self.in_flight = None;
        self.stop_listener().await;
        self.set_state(CaptureState::Stopped, "Capture stopped externally.");
    }

    /// The user picked a capture file.
    pub fn on_file_picked(&mut self, name: &str) {
        if !matches!(
            self.state,
            CaptureState::FileReady | CaptureState::WrongFilePicked
        ) {
            tracing::warn!("File pick ignored, state is {}", self.state);
            return;
        }

        let expected = self.target_pcap_name.as_deref().unwrap_or_default();
        if name == expected {
            let message = format!("Capture file '{}' selected.", name);
            self.set_state(CaptureState::FileReady, message);
        } else {
            let message = format!("Wrong file selected: expected '{}', got '{}'.", expected, name);
            self.set_state(CaptureState::WrongFilePicked, message);
        }
    }

    /// The picked file was processed, or the user moved on.
    pub fn file_processing_done(&mut self) {
        if matches!(
            self.state,
            CaptureState::FileReady | CaptureState::WrongFilePicked
        ) {
            self.set_state(CaptureState::Stopped, "Capture file processed.");
        }
    }

    /// Stops the listener and releases its socket. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        self.stop_listener().await;
    }

    async fn handle_start_result(&mut self, result: CommandResult) {
        if !result.success {
            tracing::error!("Capture start failed, result code {}", result.code);
            self.target_pcap_name = None;
            self.stop_listener().await;
            let message = format!("Failed to start capture (result {}).", result.code);
            self.set_state(CaptureState::Error, message);
            return;
        }

        match self.settings.dump_mode {
            DumpMode::UdpExporter => match self.ensure_listener() {
                Ok(addr) => {
                    let message = format!("Capturing, packets forwarded to {}.", addr);
                    self.set_state(CaptureState::Running, message);
                }
                Err(e) => self.fail_listener(e),
            },
            DumpMode::PcapFile => {
                let message = format!(
                    "Capturing to file '{}'.",
                    self.target_pcap_name.as_deref().unwrap_or("unknown")
                );
                self.set_state(CaptureState::Running, message);
            }
        }
    }

    async fn handle_stop_result(&mut self, result: CommandResult) {
        self.stop_listener().await;

        let stats = result.stats_summary();
        if !result.success {
            tracing::warn!(
                "Capture stop returned result code {}, assuming stopped",
                result.code
            );
            let message = format!(
                "Capture stop sent (result {}), state unknown. {}",
                result.code, stats
            );
            self.set_state(CaptureState::Stopped, message);
            return;
        }

        match self.settings.dump_mode {
            DumpMode::PcapFile => {
                let message = format!(
                    "Capture stopped. File '{}' should be ready. {}",
                    self.target_pcap_name.as_deref().unwrap_or("unknown"),
                    stats
                );
                self.set_state(CaptureState::FileReady, message);
            }
            DumpMode::UdpExporter => {
                let message = format!(
                    "Capture stopped, {} datagrams received. {}",
                    self.counters.received(),
                    stats
                );
                self.set_state(CaptureState::Stopped, message);
            }
        }
    }

    async fn handle_status_result(&mut self, result: CommandResult) {
        if !result.success {
            tracing::error!("Capture status query failed, result code {}", result.code);
            self.status_message = format!("Failed to get status (result {}).", result.code);
            return;
        }

        let running = result.running();
        let version = result.version_name().unwrap_or("N/A").to_string();
        let mut message = format!(
            "Status: {}. Capture app v{}. {}",
            if running { "running" } else { "stopped" },
            version,
            result.stats_summary()
        );

        if self.state.is_transitioning() {
            self.status_message = message;
            return;
        }

        if running {
            if self.state != CaptureState::Running {
                tracing::info!("Status reports running while {}, correcting", self.state);
                message.push_str(" (state corrected to running)");
            }
            if self.settings.dump_mode == DumpMode::UdpExporter && !self.listener_active() {
                if let Err(e) = self.restart_listener().await {
                    self.fail_listener(e);
                    return;
                }
            }
            self.set_state(CaptureState::Running, message);
        } else {
            if self.listener.is_some() {
                tracing::info!("Status reports stopped, releasing telemetry listener");
                self.stop_listener().await;
            }
            if self.state.is_stopped_like() {
                self.status_message = message;
            } else {
                tracing::info!("Status reports stopped while {}, correcting", self.state);
                message.push_str(" (state corrected to stopped)");
                self.set_state(CaptureState::Stopped, message);
            }
        }
    }

    fn ensure_listener(&mut self) -> Result<SocketAddr, CaptureError> {
        if let Some(listener) = &self.listener {
            if listener.is_running() {
                return Ok(listener.local_addr());
            }
        }

        let listener = TelemetryListener::bind(
            self.listen_addr(),
            self.settings.max_datagram_size,
            self.sink.clone(),
            self.counters.clone(),
        )?;
        let addr = listener.local_addr();
        self.listener = Some(listener);
        Ok(addr)
    }

    async fn restart_listener(&mut self) -> Result<SocketAddr, CaptureError> {
        self.stop_listener().await;
        self.ensure_listener()
    }

    async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
    }

    fn fail_listener(&mut self, error: CaptureError) {
        tracing::error!("Telemetry listener failed: {}", error);
        self.set_state(CaptureState::Error, format!("Error: {}.", error.user_message()));
    }

    fn issue_transition(&mut self, verb: CaptureVerb) -> CommandTicket {
        let ticket = self.next_ticket(verb);
        self.in_flight = Some(ticket);
        self.last_transition_seq = ticket.seq;
        ticket
    }

    fn next_ticket(&mut self, verb: CaptureVerb) -> CommandTicket {
        self.next_seq += 1;
        CommandTicket {
            seq: self.next_seq,
            verb,
        }
    }

    fn command(&self, ticket: CommandTicket) -> CaptureCommand {
        CaptureCommand::new(
            ticket,
            &self.settings.target_package,
            &self.settings.target_component,
        )
    }

    fn set_state(&mut self, state: CaptureState, message: impl Into<String>) {
        if self.state != state {
            tracing::info!("Capture state {} -> {}", self.state, state);
        }
        self.state = state;
        self.status_message = message.into();
    }
}
