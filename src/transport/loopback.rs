//! In-process loopback transport for tests.
//!
//! A pair of [`LoopbackTransport`]s connected back-to-back: bytes sent on one
//! end surface as [`TransportEvent::BytesReceived`] on the other. The
//! fragmenting mode re-splits every send into randomly sized chunks so the
//! frame codec's reassembly path is exercised the way a real TCP stream would
//! exercise it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::{Transport, TransportEvent, TransportEventSender};

/// How a loopback end delivers each sent buffer to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPolicy {
    /// Deliver each send as a single chunk.
    Whole,
    /// Re-split each send into random chunks of `1..=max` bytes.
    Random {
        /// Upper bound on chunk size, inclusive.
        max: usize,
    },
}

/// One end of an in-process transport pair.
pub struct LoopbackTransport {
    own_events: TransportEventSender,
    peer_events: TransportEventSender,
    policy: FragmentPolicy,
    closed: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Create a connected pair. Each end publishes its events on the sender
    /// passed for it.
    pub fn pair(
        a_events: TransportEventSender,
        b_events: TransportEventSender,
        policy: FragmentPolicy,
    ) -> (Self, Self) {
        let closed = Arc::new(AtomicBool::new(false));
        let a = Self {
            own_events: a_events.clone(),
            peer_events: b_events.clone(),
            policy,
            closed: Arc::clone(&closed),
        };
        let b = Self {
            own_events: b_events,
            peer_events: a_events,
            policy,
            closed,
        };
        (a, b)
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.own_events.send(TransportEvent::Connected);
        }
    }

    fn send(&self, bytes: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match self.policy {
            FragmentPolicy::Whole => {
                let _ = self.peer_events.send(TransportEvent::BytesReceived(bytes));
            }
            FragmentPolicy::Random { max } => {
                let mut rng = rand::thread_rng();
                let mut cursor = 0;
                while cursor < bytes.len() {
                    let take = rng.gen_range(1..=max).min(bytes.len() - cursor);
                    let _ = self.peer_events.send(TransportEvent::BytesReceived(
                        bytes[cursor..cursor + take].to_vec(),
                    ));
                    cursor += take;
                }
            }
        }
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.own_events.send(TransportEvent::Disconnected);
        let _ = self.peer_events.send(TransportEvent::Disconnected);
    }
}
