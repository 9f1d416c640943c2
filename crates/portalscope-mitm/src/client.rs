//! Decryption addon service client.
//!
//! Owns the binding to the addon service and exposes its four operations.
//! Connection lifecycle notifications and replies are consumed through
//! [`MitmServiceClient::next_event`], which keeps the connection state
//! current before handing a [`ClientEvent`] to the caller.
//!
//! All methods take `&self`; the client can be shared between tasks.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use portalscope_core::MitmSettings;

use crate::error::MitmError;
use crate::protocol::{
    EventSender, MitmConfig, ServiceBinder, ServiceEndpoint, ServiceEvent, ServiceMessage,
    MSG_ERROR, MSG_GET_CA_CERTIFICATE,
};

/// Event surfaced to the client's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The service is connected and ready for requests.
    Connected,
    /// The binding was lost.
    Disconnected,
    /// Reply to a certificate request; `None` if the service had none.
    CertificateReceived(Option<String>),
}

/// Binding state. `generation` changes on every bind and unbind; events
/// stamped with any other generation belong to a released binding.
#[derive(Default)]
struct Connection {
    generation: u64,
    bound: bool,
    endpoint: Option<Arc<dyn ServiceEndpoint>>,
    stop_requested: bool,
}

/// Client for the decryption addon service.
pub struct MitmServiceClient {
    binder: Arc<dyn ServiceBinder>,
    package: String,
    service: String,
    conn: Mutex<Connection>,
    events_tx: mpsc::UnboundedSender<(u64, ServiceEvent)>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, ServiceEvent)>>,
}

impl MitmServiceClient {
    /// Creates a client for the addon named in `settings`.
    pub fn new(binder: Arc<dyn ServiceBinder>, settings: &MitmSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            binder,
            package: settings.package.clone(),
            service: settings.service.clone(),
            conn: Mutex::new(Connection::default()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Starts binding to the service.
    ///
    /// Returns false if the binding cannot be established. On success
    /// [`ClientEvent::Connected`] follows from [`Self::next_event`].
    pub fn connect(&self) -> bool {
        let generation = {
            let mut conn = self.conn.lock();
            if conn.bound {
                return true;
            }
            // Bound from here on: the binder may deliver Connected before
            // bind() returns.
            conn.generation += 1;
            conn.bound = true;
            conn.generation
        };

        let events = EventSender::new(generation, self.events_tx.clone());
        match self.binder.bind(&self.package, &self.service, events) {
            Ok(()) => {
                tracing::info!(
                    "Binding addon service {}/{} (binding {})",
                    self.package,
                    self.service,
                    generation
                );
                true
            }
            Err(e) => {
                tracing::error!("Addon bind failed: {}", e);
                self.binder.unbind();
                let mut conn = self.conn.lock();
                if conn.generation == generation {
                    conn.generation += 1;
                    conn.bound = false;
                    conn.endpoint = None;
                }
                false
            }
        }
    }

    /// Releases the binding. Safe to call when not connected.
    pub fn disconnect(&self) {
        let was_bound = {
            let mut conn = self.conn.lock();
            let was_bound = conn.bound || conn.endpoint.is_some();
            if was_bound {
                conn.generation += 1;
            }
            conn.bound = false;
            conn.endpoint = None;
            was_bound
        };

        if was_bound {
            tracing::info!("Unbinding addon service");
            self.binder.unbind();
        }
    }

    /// Returns true while a binding is established.
    pub fn is_connected(&self) -> bool {
        self.conn.lock().endpoint.is_some()
    }

    /// Returns true while a stop is waiting for a connection.
    pub fn stop_pending(&self) -> bool {
        self.conn.lock().stop_requested
    }

    /// Asks the service for its CA certificate.
    pub fn request_ca_certificate(&self) -> bool {
        match self.send(ServiceMessage::GetCaCertificate) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Certificate request failed: {}", e);
                false
            }
        }
    }

    /// Starts the decrypting proxy.
    ///
    /// Creates a duplex stream pair, hands one end to the service and
    /// returns the other. Both ends are closed on failure.
    pub fn start_proxy(&self, config: &MitmConfig) -> Option<UnixStream> {
        let Some(endpoint) = self.endpoint() else {
            tracing::error!("Cannot start proxy: {}", MitmError::NotConnected);
            return None;
        };

        let (service_end, local_end) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("{}", MitmError::SocketPair(e));
                return None;
            }
        };

        let message = ServiceMessage::StartMitm {
            endpoint: service_end,
            config: config.clone(),
        };

        // The message owns the service end: delivered, it belongs to the
        // service; rejected, it is dropped with the message.
        match endpoint.send(message) {
            Ok(()) => {
                tracing::info!("Proxy start sent (port {})", config.proxy_port);
                Some(local_end)
            }
            Err(e) => {
                tracing::error!("Proxy start failed: {}", e);
                drop(local_end);
                None
            }
        }
    }

    /// Stops the decrypting proxy.
    ///
    /// When not connected yet the stop is recorded and sent as soon as the
    /// connection is established.
    pub fn stop_proxy(&self) -> bool {
        let endpoint = {
            let mut conn = self.conn.lock();
            match &conn.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => {
                    tracing::info!("Not connected, postponing stop message");
                    conn.stop_requested = true;
                    return true;
                }
            }
        };

        tracing::info!("Sending proxy stop");
        match endpoint.send(ServiceMessage::StopMitm) {
            Ok(()) => {
                self.conn.lock().stop_requested = false;
                true
            }
            Err(e) => {
                tracing::error!("Proxy stop failed: {}", e);
                false
            }
        }
    }

    /// Asks the service to relax power management. False when not connected.
    pub fn disable_doze(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        tracing::info!("Sending disable doze");
        match self.send(ServiceMessage::DisableDoze) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Disable doze failed: {}", e);
                false
            }
        }
    }

    /// Waits for the next event worth surfacing.
    ///
    /// Returns `None` only if the event channel is closed.
    pub async fn next_event(&self) -> Option<ClientEvent> {
        let mut rx = self.events_rx.lock().await;
        loop {
            let (generation, event) = rx.recv().await?;
            if let Some(event) = self.handle_event(generation, event) {
                return Some(event);
            }
        }
    }

    /// Returns the next already queued event without waiting.
    pub fn try_next_event(&self) -> Option<ClientEvent> {
        let mut rx = self.events_rx.try_lock().ok()?;
        while let Ok((generation, event)) = rx.try_recv() {
            if let Some(event) = self.handle_event(generation, event) {
                return Some(event);
            }
        }
        None
    }

    fn handle_event(&self, generation: u64, event: ServiceEvent) -> Option<ClientEvent> {
        {
            let conn = self.conn.lock();
            if generation != conn.generation || !conn.bound {
                tracing::debug!(
                    "Dropping {:?} from released binding {} (current {})",
                    event,
                    generation,
                    conn.generation
                );
                return None;
            }
        }

        match event {
            ServiceEvent::Connected(endpoint) => {
                tracing::info!("Addon service connected");
                let stop_requested = {
                    let mut conn = self.conn.lock();
                    conn.endpoint = Some(endpoint);
                    conn.stop_requested
                };

                if stop_requested {
                    self.stop_proxy();
                    None
                } else {
                    Some(ClientEvent::Connected)
                }
            }
            ServiceEvent::Disconnected => {
                tracing::info!("Addon service disconnected");
                self.disconnect();
                Some(ClientEvent::Disconnected)
            }
            ServiceEvent::BindingDied | ServiceEvent::NullBinding => {
                tracing::warn!("Addon binding lost: {:?}", event);
                self.disconnect();
                Some(ClientEvent::Disconnected)
            }
            ServiceEvent::Reply(reply) => {
                tracing::debug!("Addon reply: {}", reply.what);
                match reply.what {
                    MSG_GET_CA_CERTIFICATE => Some(ClientEvent::CertificateReceived(
                        reply.certificate_pem().map(str::to_string),
                    )),
                    MSG_ERROR => {
                        tracing::warn!("Addon reported an error: {:?}", reply.data);
                        None
                    }
                    _ => None,
                }
            }
        }
    }

    fn endpoint(&self) -> Option<Arc<dyn ServiceEndpoint>> {
        self.conn.lock().endpoint.clone()
    }

    fn send(&self, message: ServiceMessage) -> crate::Result<()> {
        let endpoint = self.endpoint().ok_or(MitmError::NotConnected)?;
        endpoint.send(message)
    }
}

impl Drop for MitmServiceClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    use crate::protocol::{EventSender, ServiceReply};
    use crate::Result;

    /// Endpoint recording message codes; optionally rejects every send and
    /// keeps a clone of any stream it was handed.
    #[derive(Default)]
    struct RecordingEndpoint {
        fail: bool,
        codes: Mutex<Vec<i32>>,
        streams: Mutex<Vec<UnixStream>>,
    }

    impl ServiceEndpoint for RecordingEndpoint {
        fn send(&self, message: ServiceMessage) -> Result<()> {
            self.codes.lock().push(message.code());
            if let ServiceMessage::StartMitm { endpoint, .. } = &message {
                self.streams.lock().push(endpoint.try_clone().unwrap());
            }
            if self.fail {
                Err(MitmError::SendFailed("service died".into()))
            } else {
                Ok(())
            }
        }
    }

    /// Binder that hands out one endpoint when asked.
    struct ManualBinder {
        refuse: bool,
        events: Mutex<Option<EventSender>>,
        unbinds: Mutex<u32>,
    }

    impl ManualBinder {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                refuse,
                events: Mutex::new(None),
                unbinds: Mutex::new(0),
            })
        }

        fn emit(&self, event: ServiceEvent) {
            if let Some(tx) = self.events.lock().as_ref() {
                tx.send(event).unwrap();
            }
        }

        /// Sender of the most recent binding.
        fn sender(&self) -> EventSender {
            self.events.lock().clone().unwrap()
        }
    }

    impl ServiceBinder for ManualBinder {
        fn bind(&self, _package: &str, _service: &str, events: EventSender) -> Result<()> {
            if self.refuse {
                return Err(MitmError::BindFailed("package not installed".into()));
            }
            *self.events.lock() = Some(events);
            Ok(())
        }

        fn unbind(&self) {
            *self.unbinds.lock() += 1;
        }
    }

    fn client(binder: Arc<ManualBinder>) -> MitmServiceClient {
        MitmServiceClient::new(binder, &MitmSettings::default())
    }

    async fn connected(endpoint: Arc<RecordingEndpoint>) -> (MitmServiceClient, Arc<ManualBinder>) {
        let binder = ManualBinder::new(false);
        let client = client(binder.clone());
        assert!(client.connect());
        binder.emit(ServiceEvent::Connected(endpoint));
        assert_eq!(client.next_event().await, Some(ClientEvent::Connected));
        (client, binder)
    }

    #[test]
    fn connect_fails_when_bind_refused() {
        let binder = ManualBinder::new(true);
        let client = client(binder.clone());
        assert!(!client.connect());
        assert!(!client.is_connected());
        assert_eq!(*binder.unbinds.lock(), 1);
    }

    #[test]
    fn requests_fail_when_not_connected() {
        let client = client(ManualBinder::new(false));
        assert!(!client.request_ca_certificate());
        assert!(!client.disable_doze());
        assert!(client.start_proxy(&MitmConfig::new(8050)).is_none());
    }

    #[test]
    fn disconnect_when_not_connected_is_safe() {
        let binder = ManualBinder::new(false);
        let client = client(binder.clone());
        client.disconnect();
        client.disconnect();
        assert_eq!(*binder.unbinds.lock(), 0);
    }

    #[tokio::test]
    async fn certificate_request_and_reply() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let (client, binder) = connected(endpoint.clone()).await;

        assert!(client.request_ca_certificate());
        assert_eq!(*endpoint.codes.lock(), vec![2]);

        binder.emit(ServiceEvent::Reply(ServiceReply::certificate(Some("PEM"))));
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::CertificateReceived(Some("PEM".into())))
        );
    }

    #[tokio::test]
    async fn stop_before_connect_is_sent_on_connect() {
        let binder = ManualBinder::new(false);
        let client = client(binder.clone());

        assert!(client.stop_proxy());
        assert!(client.stop_pending());

        assert!(client.connect());
        let endpoint = Arc::new(RecordingEndpoint::default());
        binder.emit(ServiceEvent::Connected(endpoint.clone()));
        binder.emit(ServiceEvent::Reply(ServiceReply::certificate(None)));

        // The connect is consumed by the deferred stop.
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::CertificateReceived(None))
        );
        assert_eq!(*endpoint.codes.lock(), vec![3]);
        assert!(!client.stop_pending());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn binding_loss_disconnects() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let (client, binder) = connected(endpoint).await;

        binder.emit(ServiceEvent::BindingDied);
        assert_eq!(client.next_event().await, Some(ClientEvent::Disconnected));
        assert!(!client.is_connected());
        assert_eq!(*binder.unbinds.lock(), 1);
    }

    #[test]
    fn connected_after_disconnect_is_dropped() {
        let binder = ManualBinder::new(false);
        let client = client(binder.clone());
        assert!(client.connect());
        let released = binder.sender();
        client.disconnect();

        released
            .send(ServiceEvent::Connected(Arc::new(RecordingEndpoint::default())))
            .unwrap();
        assert_eq!(client.try_next_event(), None);
        assert!(!client.is_connected());
        assert!(!client.request_ca_certificate());
    }

    #[tokio::test]
    async fn reconnect_ignores_events_of_released_binding() {
        let binder = ManualBinder::new(false);
        let client = client(binder.clone());

        assert!(client.connect());
        let first = binder.sender();
        let dead = Arc::new(RecordingEndpoint {
            fail: true,
            ..RecordingEndpoint::default()
        });
        first.send(ServiceEvent::Connected(dead.clone())).unwrap();
        client.disconnect();

        assert!(client.connect());
        let second = binder.sender();
        assert_ne!(first.generation(), second.generation());
        let live = Arc::new(RecordingEndpoint::default());
        second.send(ServiceEvent::Connected(live.clone())).unwrap();

        // Only the second binding's connect is surfaced.
        assert_eq!(client.next_event().await, Some(ClientEvent::Connected));
        assert!(client.request_ca_certificate());
        assert_eq!(*live.codes.lock(), vec![2]);
        assert!(dead.codes.lock().is_empty());

        // A late loss notice from the first binding does not tear it down.
        first.send(ServiceEvent::Disconnected).unwrap();
        first
            .send(ServiceEvent::Reply(ServiceReply::certificate(Some("OLD"))))
            .unwrap();
        assert_eq!(client.try_next_event(), None);
        assert!(client.is_connected());
        assert_eq!(*binder.unbinds.lock(), 1);
    }

    #[tokio::test]
    async fn start_proxy_returns_connected_end() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let (client, _binder) = connected(endpoint.clone()).await;

        let mut local = client.start_proxy(&MitmConfig::new(8050)).unwrap();
        let mut service = endpoint.streams.lock().pop().unwrap();

        local.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        service.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn failed_start_closes_both_ends() {
        let endpoint = Arc::new(RecordingEndpoint {
            fail: true,
            ..RecordingEndpoint::default()
        });
        let (client, _binder) = connected(endpoint.clone()).await;

        assert!(client.start_proxy(&MitmConfig::new(8050)).is_none());

        // Only the test's clone of the service end is left open, so its
        // peer must already be closed.
        let mut service = endpoint.streams.lock().pop().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(service.read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_failed_starts_leak_nothing() {
        let endpoint = Arc::new(RecordingEndpoint {
            fail: true,
            ..RecordingEndpoint::default()
        });
        let (client, _binder) = connected(endpoint.clone()).await;
        let client = Arc::new(client);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let client = client.clone();
                std::thread::spawn(move || client.start_proxy(&MitmConfig::new(8050)))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_none());
        }

        let streams: Vec<UnixStream> = endpoint.streams.lock().drain(..).collect();
        assert_eq!(streams.len(), 2);
        for mut stream in streams {
            let mut buf = [0u8; 1];
            assert_eq!(stream.read(&mut buf).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn disable_doze_when_connected() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let (client, _binder) = connected(endpoint.clone()).await;
        assert!(client.disable_doze());
        assert_eq!(*endpoint.codes.lock(), vec![4]);
    }

    #[tokio::test]
    async fn error_replies_are_not_surfaced() {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let (client, binder) = connected(endpoint).await;

        binder.emit(ServiceEvent::Reply(ServiceReply::new(MSG_ERROR)));
        assert_eq!(client.try_next_event(), None);
    }
}
