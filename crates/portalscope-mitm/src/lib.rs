//! Portalscope MITM - decryption addon client and CA provisioning.
//!
//! The decryption addon is a privileged local service reached through a
//! bind/connect handshake and a four-message protocol:
//!
//! - [`protocol`]: message codes, [`MitmConfig`] and the binder seams
//! - [`client`]: [`MitmServiceClient`], owning the binding
//! - [`loopback`]: an in-process service host for development and tests
//! - [`ca`]: the CA served by the development addon
//! - [`install`]: installing or exporting the CA certificate
//!
//! The proxy endpoint is a Unix domain socket pair, so this crate only
//! builds on Unix platforms.
//!
//! ## Usage
//!
//! ```ignore
//! let backend = Arc::new(CaBackend::new(&CaAuthority::new(data_dir.join("ca")))?);
//! let binder = Arc::new(LoopbackBinder::new(backend, &config.mitm.package));
//! let client = MitmServiceClient::new(binder, &config.mitm);
//! if client.connect() {
//!     while let Some(event) = client.next_event().await { /* ... */ }
//! }
//! ```

#![cfg(unix)]

pub mod ca;
pub mod client;
pub mod error;
pub mod install;
pub mod loopback;
pub mod protocol;

pub use ca::{CaAuthority, CaBackend};
pub use client::{ClientEvent, MitmServiceClient};
pub use error::{CaError, InstallError, MitmError, Result};
pub use install::{export_pem, CertificateInstaller, SystemTrustInstaller};
pub use loopback::{LoopbackBinder, MitmBackend};
pub use protocol::{
    MitmConfig, ServiceBinder, ServiceEndpoint, ServiceEvent, ServiceMessage, ServiceReply,
};
