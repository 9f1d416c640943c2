//! Telemetry listener.
//!
//! Receives the packet datagrams forwarded by the capture process on a
//! loopback UDP socket and hands them to a bounded sink channel. The socket
//! is bound synchronously so a bind failure is reported to the caller before
//! anything is declared running; the receive loop then runs on its own task
//! until [`TelemetryListener::stop`] is called or the listener is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{CaptureError, Result};

/// Pause after a receive error before polling the socket again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A forwarded block of captured bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryDatagram {
    /// Datagram payload.
    pub bytes: Vec<u8>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
    /// 1-based arrival counter, reset at every capture start.
    pub sequence: u64,
    /// Sender address.
    pub source: SocketAddr,
}

/// Receiving side of the telemetry sink.
pub type TelemetryReceiver = mpsc::Receiver<TelemetryDatagram>;

/// Sending side of the telemetry sink.
pub type TelemetrySink = mpsc::Sender<TelemetryDatagram>;

/// Creates a bounded telemetry sink.
pub fn telemetry_channel(capacity: usize) -> (TelemetrySink, TelemetryReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Counters shared between the listener task and its owner.
#[derive(Debug, Default)]
pub struct ListenerCounters {
    received: AtomicU64,
    dropped: AtomicU64,
}

impl ListenerCounters {
    /// Returns the number of datagrams received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Returns the number of datagrams the sink could not accept.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resets both counters.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// A bound, running telemetry listener.
pub struct TelemetryListener {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TelemetryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryListener")
            .field("addr", &self.addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl TelemetryListener {
    /// Binds `addr` and starts the receive loop on the current runtime.
    pub fn bind(
        addr: SocketAddr,
        max_datagram_size: usize,
        sink: Option<TelemetrySink>,
        counters: Arc<ListenerCounters>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;

        let std_socket = std::net::UdpSocket::bind(addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                CaptureError::PortInUse(addr)
            } else {
                CaptureError::Bind(addr, e)
            }
        })?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;

        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(std_socket)?
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = runtime.spawn(receive_loop(
            socket,
            max_datagram_size.max(1),
            sink,
            counters,
            shutdown_rx,
        ));

        tracing::info!("Telemetry listener bound on {}", local_addr);

        Ok(Self {
            addr: local_addr,
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns true while the receive loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the receive loop and waits until the socket is closed.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!("Telemetry listener task failed: {}", e);
                }
            }
        }
        tracing::info!("Telemetry listener on {} stopped", self.addr);
    }
}

impl Drop for TelemetryListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown_tx.send(());
            handle.abort();
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    max_datagram_size: usize,
    sink: Option<TelemetrySink>,
    counters: Arc<ListenerCounters>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; max_datagram_size];
    let mut sink_closed_logged = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => {
                    let sequence = counters.received.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!("Datagram #{} ({} bytes) from {}", sequence, len, source);

                    let Some(sink) = &sink else { continue };
                    let datagram = TelemetryDatagram {
                        bytes: buf[..len].to_vec(),
                        received_at: Utc::now(),
                        sequence,
                        source,
                    };
                    match sink.try_send(datagram) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            if !sink_closed_logged {
                                tracing::warn!("Telemetry sink closed, counting datagrams only");
                                sink_closed_logged = true;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Telemetry receive error: {}", e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }
}
