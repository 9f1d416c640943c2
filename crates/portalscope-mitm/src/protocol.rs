//! Bound-service message protocol.
//!
//! The addon service understands four message kinds. Only
//! [`MSG_GET_CA_CERTIFICATE`] is answered; the others are fire-and-forget.
//! Replies, like connection lifecycle notifications, arrive on the event
//! channel handed to [`ServiceBinder::bind`].

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{MitmError, Result};

/// Error notification from the service.
pub const MSG_ERROR: i32 = -1;
/// Start the decrypting proxy.
pub const MSG_START_MITM: i32 = 1;
/// Request the CA certificate.
pub const MSG_GET_CA_CERTIFICATE: i32 = 2;
/// Stop the decrypting proxy.
pub const MSG_STOP_MITM: i32 = 3;
/// Relax power management for the service.
pub const MSG_DISABLE_DOZE: i32 = 4;

/// Payload key of the serialized [`MitmConfig`].
pub const MITM_CONFIG: &str = "mitm_config";
/// Reply key holding the PEM certificate.
pub const CERTIFICATE_RESULT: &str = "certificate";
/// Reply key holding TLS key log lines.
pub const SSLKEYLOG_RESULT: &str = "sslkeylog";

/// Decrypting proxy configuration, sent once per proxy start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmConfig {
    /// Port the proxy accepts intercepted connections on.
    pub proxy_port: u16,
    /// Transparent mode instead of SOCKS5.
    pub transparent_mode: bool,
    /// Skip upstream certificate verification.
    pub ssl_insecure: bool,
    /// Emit TLS master secrets alongside the payload.
    pub dump_master_secrets: bool,
    /// Only forward the initial part of each payload.
    pub short_payload: bool,
    /// SOCKS5 credentials, "user:pass".
    pub proxy_auth: Option<String>,
    /// Extra proxy options passed through verbatim.
    pub additional_options: Option<String>,
}

impl MitmConfig {
    /// Creates a SOCKS5 config listening on `proxy_port`.
    pub fn new(proxy_port: u16) -> Self {
        Self {
            proxy_port,
            ..Self::default()
        }
    }

    /// Switches to transparent mode.
    pub fn with_transparent_mode(mut self, transparent: bool) -> Self {
        self.transparent_mode = transparent;
        self
    }

    /// Sets SOCKS5 credentials.
    pub fn with_proxy_auth(mut self, auth: impl Into<String>) -> Self {
        self.proxy_auth = Some(auth.into());
        self
    }

    /// Enables the master secret dump.
    pub fn with_master_secrets(mut self, dump: bool) -> Self {
        self.dump_master_secrets = dump;
        self
    }

    /// Serializes the config for the [`MITM_CONFIG`] payload entry.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message sent to the service.
#[derive(Debug)]
pub enum ServiceMessage {
    /// Ask for the CA certificate.
    GetCaCertificate,
    /// Start proxying over `endpoint`.
    StartMitm {
        /// Service end of the duplex stream pair.
        endpoint: UnixStream,
        /// Proxy configuration.
        config: MitmConfig,
    },
    /// Stop proxying.
    StopMitm,
    /// Relax power management.
    DisableDoze,
}

impl ServiceMessage {
    /// Returns the message code.
    pub fn code(&self) -> i32 {
        match self {
            Self::GetCaCertificate => MSG_GET_CA_CERTIFICATE,
            Self::StartMitm { .. } => MSG_START_MITM,
            Self::StopMitm => MSG_STOP_MITM,
            Self::DisableDoze => MSG_DISABLE_DOZE,
        }
    }
}

/// A reply from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    /// Message code being answered.
    pub what: i32,
    /// Reply payload.
    pub data: BTreeMap<String, String>,
}

impl ServiceReply {
    /// Creates a reply with an empty payload.
    pub fn new(what: i32) -> Self {
        Self {
            what,
            data: BTreeMap::new(),
        }
    }

    /// A certificate reply; `None` leaves the certificate key out.
    pub fn certificate(pem: Option<&str>) -> Self {
        let mut reply = Self::new(MSG_GET_CA_CERTIFICATE);
        if let Some(pem) = pem {
            reply.data.insert(CERTIFICATE_RESULT.to_string(), pem.to_string());
        }
        reply
    }

    /// Returns the PEM certificate, if present.
    pub fn certificate_pem(&self) -> Option<&str> {
        self.data.get(CERTIFICATE_RESULT).map(String::as_str)
    }
}

/// The sending half of an established binding.
pub trait ServiceEndpoint: Send + Sync {
    /// Delivers a message to the service.
    fn send(&self, message: ServiceMessage) -> Result<()>;
}

/// Inbound notification on the event channel.
pub enum ServiceEvent {
    /// The binding is established.
    Connected(Arc<dyn ServiceEndpoint>),
    /// The service process went away.
    Disconnected,
    /// The binding can no longer be used and must be re-established.
    BindingDied,
    /// The service refused to return an interface.
    NullBinding,
    /// A reply to an earlier message.
    Reply(ServiceReply),
}

impl std::fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(_) => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::BindingDied => write!(f, "BindingDied"),
            Self::NullBinding => write!(f, "NullBinding"),
            Self::Reply(reply) => write!(f, "Reply({})", reply.what),
        }
    }
}

/// Sender for [`ServiceEvent`]s belonging to one binding.
///
/// Every event is stamped with the generation of the binding it was
/// created for, so the receiver can drop events from earlier bindings.
#[derive(Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, ServiceEvent)>,
}

impl EventSender {
    /// Creates a sender for the binding `generation`.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, ServiceEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Returns the binding generation this sender stamps.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues `event`. Fails once the receiving client is gone.
    pub fn send(&self, event: ServiceEvent) -> Result<()> {
        self.tx
            .send((self.generation, event))
            .map_err(|_| MitmError::SendFailed("event channel closed".into()))
    }
}

/// Establishes bindings to a service.
pub trait ServiceBinder: Send + Sync {
    /// Starts binding to `service` inside `package`.
    ///
    /// Returns an error if the service cannot be bound at all. On success
    /// [`ServiceEvent::Connected`] is delivered on `events` later.
    fn bind(&self, package: &str, service: &str, events: EventSender) -> Result<()>;

    /// Releases the binding. Safe to call when not bound.
    fn unbind(&self);
}
