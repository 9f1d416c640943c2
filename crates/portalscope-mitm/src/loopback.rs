//! In-process bound-service transport.
//!
//! [`LoopbackBinder`] hosts a [`MitmBackend`] inside the current process
//! and speaks the same message protocol a real addon service does. The
//! binary uses it with [`crate::CaBackend`] as a development addon; tests
//! use it to script service behaviour.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MitmError, Result};
use crate::protocol::{
    EventSender, MitmConfig, ServiceBinder, ServiceEndpoint, ServiceEvent, ServiceMessage,
    ServiceReply,
};

/// Service-side behaviour behind a loopback binding.
pub trait MitmBackend: Send + Sync {
    /// Returns the CA certificate as PEM.
    fn ca_certificate(&self) -> Option<String>;

    /// Starts proxying over `endpoint`.
    fn start_mitm(&self, endpoint: UnixStream, config: MitmConfig);

    /// Stops proxying.
    fn stop_mitm(&self);

    /// Relaxes power management. Nothing to do by default.
    fn disable_doze(&self) {}
}

struct LoopbackEndpoint {
    backend: Arc<dyn MitmBackend>,
    events: EventSender,
    alive: AtomicBool,
}

impl ServiceEndpoint for LoopbackEndpoint {
    fn send(&self, message: ServiceMessage) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MitmError::SendFailed("binding released".into()));
        }

        tracing::debug!("Loopback service received message {}", message.code());
        match message {
            ServiceMessage::GetCaCertificate => {
                let pem = self.backend.ca_certificate();
                self.events
                    .send(ServiceEvent::Reply(ServiceReply::certificate(pem.as_deref())))?;
            }
            ServiceMessage::StartMitm { endpoint, config } => {
                self.backend.start_mitm(endpoint, config);
            }
            ServiceMessage::StopMitm => self.backend.stop_mitm(),
            ServiceMessage::DisableDoze => self.backend.disable_doze(),
        }
        Ok(())
    }
}

/// Binder hosting a backend in-process.
pub struct LoopbackBinder {
    backend: Arc<dyn MitmBackend>,
    package: String,
    available: AtomicBool,
    current: Mutex<Option<Arc<LoopbackEndpoint>>>,
}

impl LoopbackBinder {
    /// Hosts `backend` as the service of `package`.
    pub fn new(backend: Arc<dyn MitmBackend>, package: impl Into<String>) -> Self {
        Self {
            backend,
            package: package.into(),
            available: AtomicBool::new(true),
            current: Mutex::new(None),
        }
    }

    /// Makes the service (un)available for new bindings.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns true while a binding is held.
    pub fn is_bound(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Simulates the service process dying.
    pub fn kill(&self) {
        if let Some(endpoint) = self.current.lock().take() {
            endpoint.alive.store(false, Ordering::SeqCst);
            let _ = endpoint.events.send(ServiceEvent::Disconnected);
            tracing::info!("Loopback service killed");
        }
    }
}

impl ServiceBinder for LoopbackBinder {
    fn bind(&self, package: &str, service: &str, events: EventSender) -> Result<()> {
        if package != self.package || !self.available.load(Ordering::SeqCst) {
            return Err(MitmError::BindFailed(format!(
                "{}/{} not available",
                package, service
            )));
        }

        let endpoint = Arc::new(LoopbackEndpoint {
            backend: self.backend.clone(),
            events: events.clone(),
            alive: AtomicBool::new(true),
        });
        if let Some(previous) = self.current.lock().replace(endpoint.clone()) {
            previous.alive.store(false, Ordering::SeqCst);
        }

        events
            .send(ServiceEvent::Connected(endpoint))
            .map_err(|e| MitmError::BindFailed(e.to_string()))
    }

    fn unbind(&self) {
        if let Some(endpoint) = self.current.lock().take() {
            endpoint.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalscope_core::{MitmSettings, config::MITM_PACKAGE};

    use crate::client::{ClientEvent, MitmServiceClient};

    #[derive(Default)]
    struct StaticBackend {
        started: Mutex<Vec<u16>>,
        stops: Mutex<u32>,
    }

    impl MitmBackend for StaticBackend {
        fn ca_certificate(&self) -> Option<String> {
            Some("PEM".to_string())
        }

        fn start_mitm(&self, _endpoint: UnixStream, config: MitmConfig) {
            self.started.lock().push(config.proxy_port);
        }

        fn stop_mitm(&self) {
            *self.stops.lock() += 1;
        }
    }

    fn setup() -> (Arc<StaticBackend>, Arc<LoopbackBinder>, MitmServiceClient) {
        let backend = Arc::new(StaticBackend::default());
        let binder = Arc::new(LoopbackBinder::new(backend.clone(), MITM_PACKAGE));
        let client = MitmServiceClient::new(binder.clone(), &MitmSettings::default());
        (backend, binder, client)
    }

    #[tokio::test]
    async fn full_exchange() {
        let (backend, binder, client) = setup();

        assert!(client.connect());
        assert_eq!(client.next_event().await, Some(ClientEvent::Connected));
        assert!(binder.is_bound());

        assert!(client.request_ca_certificate());
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::CertificateReceived(Some("PEM".into())))
        );

        assert!(client.start_proxy(&MitmConfig::new(8050)).is_some());
        assert!(client.stop_proxy());
        assert_eq!(*backend.started.lock(), vec![8050]);
        assert_eq!(*backend.stops.lock(), 1);

        client.disconnect();
        assert!(!binder.is_bound());
    }

    #[tokio::test]
    async fn repeated_bind_cycles_leave_no_stale_binding() {
        let (backend, binder, client) = setup();

        assert!(client.connect());
        client.disconnect();
        assert_eq!(client.try_next_event(), None);
        assert!(!client.is_connected());
        assert!(!binder.is_bound());

        for _ in 0..3 {
            assert!(client.connect());
            client.disconnect();
        }
        assert!(client.connect());
        assert_eq!(client.next_event().await, Some(ClientEvent::Connected));
        assert!(client.request_ca_certificate());
        assert_eq!(
            client.next_event().await,
            Some(ClientEvent::CertificateReceived(Some("PEM".into())))
        );
        assert!(client.start_proxy(&MitmConfig::new(8050)).is_some());
        assert_eq!(*backend.started.lock(), vec![8050]);

        client.disconnect();
        assert!(!binder.is_bound());
        assert_eq!(client.try_next_event(), None);
    }

    #[test]
    fn unavailable_service_refuses_bind() {
        let (_backend, binder, client) = setup();
        binder.set_available(false);
        assert!(!client.connect());
    }

    #[tokio::test]
    async fn killed_service_disconnects_client() {
        let (_backend, binder, client) = setup();
        assert!(client.connect());
        assert_eq!(client.next_event().await, Some(ClientEvent::Connected));

        binder.kill();
        assert_eq!(client.next_event().await, Some(ClientEvent::Disconnected));
        assert!(!client.request_ca_certificate());
    }

    #[test]
    fn backend_without_certificate_replies_none() {
        let backend = Arc::new(crate::ca::CaBackend::with_certificate(None));
        let binder = Arc::new(LoopbackBinder::new(backend, MITM_PACKAGE));
        let client = MitmServiceClient::new(binder, &MitmSettings::default());

        assert!(client.connect());
        assert_eq!(
            tokio_test::block_on(client.next_event()),
            Some(ClientEvent::Connected)
        );
        assert!(client.request_ca_certificate());
        assert_eq!(
            tokio_test::block_on(client.next_event()),
            Some(ClientEvent::CertificateReceived(None))
        );
    }

    #[tokio::test]
    async fn deferred_stop_reaches_backend() {
        let (backend, _binder, client) = setup();
        assert!(client.stop_proxy());
        assert_eq!(*backend.stops.lock(), 0);

        assert!(client.connect());
        assert!(client.try_next_event().is_none());
        assert_eq!(*backend.stops.lock(), 1);
    }
}
