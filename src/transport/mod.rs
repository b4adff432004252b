//! Transport layer.
//!
//! A transport is any byte-stream connection that can be started, written to
//! and torn down, and that reports its lifecycle through [`TransportEvent`]s.
//! The stream is *not* framed; the [`FrameCodec`] turns arriving chunks into
//! whole frames.
//!
//! Two implementations ship with the crate:
//!
//! - [`TcpTransport`]: the production transport over a tokio TCP stream.
//! - [`LoopbackTransport`]: an in-process pair of FIFOs for tests, with an
//!   optional fragmenting mode so reassembly is exercised with arbitrarily
//!   split byte spans.

mod codec;
mod loopback;
mod tcp;

pub use codec::{encode_frame, FrameCodec};
pub use loopback::{FragmentPolicy, LoopbackTransport};
pub use tcp::TcpTransport;

use tokio::sync::mpsc;

/// Lifecycle and data events a transport delivers to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is up; sending is now possible.
    Connected,
    /// A chunk of the inbound byte stream arrived.
    BytesReceived(Vec<u8>),
    /// The connection is gone, locally or remotely initiated.
    Disconnected,
}

/// Channel on which a transport publishes its events.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half handed to the engine.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A byte-oriented, order-preserving connection.
///
/// `send` enqueues bytes for transmission and returns once they are accepted
/// for send, not once they are delivered. Implementations must preserve send
/// order per connection and must deliver inbound bytes in arrival order.
pub trait Transport: Send + Sync {
    /// Start connecting. Signals [`TransportEvent::Connected`] on success and
    /// [`TransportEvent::Disconnected`] on failure.
    fn connect(&self);

    /// Queue bytes for in-order transmission.
    fn send(&self, bytes: Vec<u8>);

    /// Close the connection. Eventually signals
    /// [`TransportEvent::Disconnected`].
    fn disconnect(&self);
}
