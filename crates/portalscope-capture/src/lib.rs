//! Portalscope Capture - remote control of the packet capture process.
//!
//! The capture process is an independent, privileged application. This
//! crate talks to it over two channels:
//!
//! - an out-of-process command channel carrying `start`, `stop` and
//!   `get_status` commands ([`command`], delivered by a [`CommandDispatcher`])
//! - a loopback datagram socket on which captured packets are forwarded
//!   ([`listener`])
//!
//! [`CaptureController`] is the state machine tying both together;
//! [`CaptureSession`] drives it through a dispatcher.
//!
//! ## Usage
//!
//! ```ignore
//! let controller = CaptureController::new(config.capture.clone()).with_sink(sink);
//! let mut session = CaptureSession::new(controller, AdbDispatcher::new());
//! session.run_until(Duration::from_secs(10), tokio::signal::ctrl_c().map(|_| ())).await;
//! ```

pub mod adb;
pub mod command;
pub mod controller;
pub mod error;
pub mod listener;
pub mod session;

pub use adb::{AdbDispatcher, AdbPackages};
pub use command::{
    CaptureCommand, CaptureVerb, CommandDispatcher, CommandResult, CommandTicket, Extra,
};
pub use controller::{CaptureController, CaptureState};
pub use error::{CaptureError, Result};
pub use listener::{
    telemetry_channel, ListenerCounters, TelemetryDatagram, TelemetryListener, TelemetryReceiver,
    TelemetrySink,
};
pub use session::CaptureSession;
