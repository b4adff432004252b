//! # Local P2P
//!
//! A secure peer-to-peer file synchronization engine for two endpoints on a
//! trusted local network. One side initiates, the other responds; after an
//! ephemeral key exchange both users compare a four-emoji Short
//! Authentication String out of band, and from then on every frame is
//! authenticated encryption. It provides:
//!
//! - **Security**: per-connection P-256 ECDH, HKDF-SHA256 key schedule with
//!   directionally separated keys, AES-256-GCM on every frame after the
//!   cutover, SAS verification against man-in-the-middle
//! - **Simplicity**: fixed cryptographic suite, no negotiation
//! - **Robustness**: single-consumer engine actor, strict offset ordering,
//!   atomic rename-on-complete for every downloaded file
//!
//! ## Modules
//!
//! - [`core`]: constants and error types
//! - [`transport`]: byte-stream transports and the length-prefixed frame codec
//! - [`wire`]: typed protocol messages
//! - [`crypto`]: key exchange, AEAD session, SAS
//! - [`engine`]: the session state machine actor
//! - [`sync`]: scanner, diff, and the sync orchestrator
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use local_p2p::prelude::*;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Client side: dial the peer, show the SAS, pull the remote tree.
//! let (transport_tx, transport_rx) = mpsc::unbounded_channel();
//! let transport = TcpTransport::connect_to("192.168.1.20:9940".parse()?, transport_tx);
//!
//! let (engine, events) = Engine::spawn(
//!     EngineConfig::new("laptop", Role::Initiator),
//!     Arc::new(transport),
//!     transport_rx,
//! );
//! let mut session = SyncSession::new(engine.clone(), events, "/home/me/sync");
//!
//! engine.start_connection();
//! let sas = session.wait_for_sas().await?;
//! println!("compare with the other device: {sas}");
//! engine.confirm_sas(true); // after the user actually compared!
//! session.wait_until_secured().await?;
//!
//! let report = session.sync().await?;
//! println!("downloaded {} file(s)", report.downloaded);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod engine;
pub mod sync;
pub mod transport;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::crypto::*;
    pub use crate::engine::*;
    pub use crate::sync::*;
    pub use crate::transport::*;
    pub use crate::wire::*;
}

// Re-export commonly used items at crate root.
pub use crate::core::{CodecError, CryptoError, EngineError, FrameError};
pub use crate::crypto::{AeadSession, Role, Sas, SessionCrypto};
pub use crate::engine::{Engine, EngineConfig, EngineEvent, EngineHandle, EngineState};
pub use crate::sync::{diff, scan, SyncError, SyncPlan, SyncReport, SyncSession};
pub use crate::transport::{
    FrameCodec, LoopbackTransport, TcpTransport, Transport, TransportEvent,
};
pub use crate::wire::{FileEntry, Frame};
