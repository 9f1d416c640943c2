//! Remote-control commands for the capture process.
//!
//! The capture process understands three verbs. The controller only builds
//! [`CaptureCommand`] descriptors; delivering them is the job of a
//! [`CommandDispatcher`], which hands back the raw [`CommandResult`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Extra carrying the verb.
pub const EXTRA_ACTION: &str = "action";
/// Extra selecting the dump mode.
pub const EXTRA_PCAP_DUMP_MODE: &str = "pcap_dump_mode";
/// Extra restricting capture to one app.
pub const EXTRA_APP_FILTER: &str = "app_filter";
/// Extra with the collector host.
pub const EXTRA_COLLECTOR_IP: &str = "collector_ip_address";
/// Extra with the collector port.
pub const EXTRA_COLLECTOR_PORT: &str = "collector_port";
/// Extra asking for metadata extensions in the dump.
pub const EXTRA_DUMP_EXTENSIONS: &str = "dump_extensions";
/// Extra with the pcap file name.
pub const EXTRA_PCAP_NAME: &str = "pcap_name";

/// Status reply key: capture running.
pub const RESULT_RUNNING: &str = "running";
/// Status reply key: capture app version name.
pub const RESULT_VERSION_NAME: &str = "version_name";
/// Status reply key: capture app version code.
pub const RESULT_VERSION_CODE: &str = "version_code";

/// Byte and packet counters reported by stop and status replies.
pub const RESULT_COUNTERS: &[&str] = &[
    "bytes_sent",
    "bytes_rcvd",
    "bytes_dumped",
    "pkts_sent",
    "pkts_rcvd",
    "pkts_dropped",
];

/// Platform result code for success.
pub const RESULT_OK: i32 = -1;
/// Platform result code for a cancelled or refused request.
pub const RESULT_CANCELED: i32 = 0;

/// Command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureVerb {
    /// Start capturing.
    Start,
    /// Stop capturing.
    Stop,
    /// Query capture status.
    GetStatus,
}

impl CaptureVerb {
    /// Returns the wire value of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::GetStatus => "get_status",
        }
    }
}

impl std::fmt::Display for CaptureVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies an issued command so its reply can be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandTicket {
    /// Monotonic sequence number, unique per controller.
    pub seq: u64,
    /// Verb of the issued command.
    pub verb: CaptureVerb,
}

/// Typed command parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extra {
    /// String value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl std::fmt::Display for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A command for the capture process, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    /// Ticket to pass back with the reply.
    pub ticket: CommandTicket,
    /// Package of the capture process.
    pub target_package: String,
    /// Remote-control component of the capture process.
    pub target_component: String,
    /// Command parameters, including the verb under [`EXTRA_ACTION`].
    pub extras: BTreeMap<String, Extra>,
}

impl CaptureCommand {
    /// Creates a command with only the verb set.
    pub fn new(
        ticket: CommandTicket,
        target_package: impl Into<String>,
        target_component: impl Into<String>,
    ) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert(
            EXTRA_ACTION.to_string(),
            Extra::Str(ticket.verb.as_str().to_string()),
        );
        Self {
            ticket,
            target_package: target_package.into(),
            target_component: target_component.into(),
            extras,
        }
    }

    /// Adds a parameter.
    pub fn with_extra(mut self, key: &str, value: Extra) -> Self {
        self.extras.insert(key.to_string(), value);
        self
    }

    /// Returns the verb.
    pub fn verb(&self) -> CaptureVerb {
        self.ticket.verb
    }

    /// Returns a parameter.
    pub fn extra(&self, key: &str) -> Option<&Extra> {
        self.extras.get(key)
    }
}

/// Raw reply to a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// Whether the capture process accepted the command.
    pub success: bool,
    /// Platform result code.
    pub code: i32,
    /// Reply payload.
    pub payload: BTreeMap<String, String>,
}

impl CommandResult {
    /// A successful reply with an empty payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            code: RESULT_OK,
            payload: BTreeMap::new(),
        }
    }

    /// A failed reply with the given code.
    pub fn failed(code: i32) -> Self {
        Self {
            success: false,
            code,
            payload: BTreeMap::new(),
        }
    }

    /// Adds a payload entry.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }

    /// Returns the running flag of a status reply.
    pub fn running(&self) -> bool {
        self.payload
            .get(RESULT_RUNNING)
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
    }

    /// Returns the capture app version name.
    pub fn version_name(&self) -> Option<&str> {
        self.payload.get(RESULT_VERSION_NAME).map(String::as_str)
    }

    /// Returns the capture app version code.
    pub fn version_code(&self) -> Option<u64> {
        self.counter(RESULT_VERSION_CODE)
    }

    /// Returns a numeric payload entry.
    pub fn counter(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|v| v.parse().ok())
    }

    /// Formats the counters present in the payload.
    pub fn stats_summary(&self) -> String {
        let stats: Vec<String> = RESULT_COUNTERS
            .iter()
            .filter_map(|key| self.counter(key).map(|v| format!("{}={}", key, v)))
            .collect();

        if stats.is_empty() {
            "No stats".to_string()
        } else {
            format!("Stats: [{}]", stats.join(", "))
        }
    }
}

/// Delivers commands to the capture process.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Dispatches a command and waits for its reply.
    ///
    /// Returns [`crate::CaptureError::TargetNotFound`] if the capture process
    /// is not installed.
    async fn dispatch(&self, command: &CaptureCommand) -> Result<CommandResult>;
}
