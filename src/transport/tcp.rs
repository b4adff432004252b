//! TCP transport.
//!
//! Wraps a tokio [`TcpStream`] behind the [`Transport`] contract: a writer
//! task drains an order-preserving outbound queue, a reader task forwards
//! 64 KiB reads as [`TransportEvent::BytesReceived`] and end-of-stream as
//! [`TransportEvent::Disconnected`].

use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent, TransportEventSender};

const READ_BUFFER_SIZE: usize = 64 * 1024;

enum WriterMsg {
    Data(Vec<u8>),
    Close,
}

/// [`Transport`] implementation over a TCP stream.
pub struct TcpTransport {
    /// Peer to dial when this end initiates; `None` for accepted sockets.
    peer: Option<SocketAddr>,
    events: TransportEventSender,
    outbound: mpsc::UnboundedSender<WriterMsg>,
    /// Writer-side receiver, handed to the I/O task on startup.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<WriterMsg>>>,
    /// Accepted stream, if this transport wraps one.
    accepted: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    /// Create a transport that will dial `peer` when [`Transport::connect`]
    /// is called.
    pub fn connect_to(peer: SocketAddr, events: TransportEventSender) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            peer: Some(peer),
            events,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            accepted: Mutex::new(None),
        }
    }

    /// Wrap an already-accepted stream (the responding side).
    /// [`Transport::connect`] then only starts the I/O tasks.
    pub fn from_stream(stream: TcpStream, events: TransportEventSender) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            peer: None,
            events,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            accepted: Mutex::new(Some(stream)),
        }
    }

    fn start_io(
        stream: TcpStream,
        events: TransportEventSender,
        mut outbound_rx: mpsc::UnboundedReceiver<WriterMsg>,
    ) {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let _ = events.send(TransportEvent::Connected);

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match msg {
                    WriterMsg::Data(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    WriterMsg::Close => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if events
                            .send(TransportEvent::BytesReceived(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let _ = events.send(TransportEvent::Disconnected);
        });
    }
}

impl Transport for TcpTransport {
    fn connect(&self) {
        let outbound_rx = match self.outbound_rx.lock().unwrap().take() {
            Some(rx) => rx,
            // Second connect call; the transport is single-use.
            None => return,
        };

        if let Some(stream) = self.accepted.lock().unwrap().take() {
            Self::start_io(stream, self.events.clone(), outbound_rx);
            return;
        }

        let Some(peer) = self.peer else {
            let _ = self.events.send(TransportEvent::Disconnected);
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            match TcpStream::connect(peer).await {
                Ok(stream) => Self::start_io(stream, events, outbound_rx),
                Err(err) => {
                    tracing::warn!(%peer, %err, "tcp connect failed");
                    let _ = events.send(TransportEvent::Disconnected);
                }
            }
        });
    }

    fn send(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(WriterMsg::Data(bytes));
    }

    fn disconnect(&self) {
        let _ = self.outbound.send(WriterMsg::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn expect_connected(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
    }

    async fn collect_bytes(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        wanted: usize,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < wanted {
            match rx.recv().await {
                Some(TransportEvent::BytesReceived(chunk)) => out.extend(chunk),
                other => panic!("unexpected transport event: {other:?}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_tcp_pair_exchanges_bytes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_events_tx, mut client_events) = mpsc::unbounded_channel();
        let client = TcpTransport::connect_to(addr, client_events_tx);
        client.connect();

        let (stream, _) = listener.accept().await.unwrap();
        let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
        let server = TcpTransport::from_stream(stream, server_events_tx);
        server.connect();

        expect_connected(&mut client_events).await;
        expect_connected(&mut server_events).await;

        client.send(b"abc".to_vec());
        client.send(b"defg".to_vec());
        let got = collect_bytes(&mut server_events, 7).await;
        assert_eq!(got, b"abcdefg");

        server.send(b"reply".to_vec());
        let got = collect_bytes(&mut client_events, 5).await;
        assert_eq!(got, b"reply");
    }

    #[tokio::test]
    async fn test_disconnect_reaches_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_events_tx, mut client_events) = mpsc::unbounded_channel();
        let client = TcpTransport::connect_to(addr, client_events_tx);
        client.connect();

        let (stream, _) = listener.accept().await.unwrap();
        let (server_events_tx, mut server_events) = mpsc::unbounded_channel();
        let server = TcpTransport::from_stream(stream, server_events_tx);
        server.connect();

        expect_connected(&mut client_events).await;
        expect_connected(&mut server_events).await;

        client.disconnect();
        loop {
            match server_events.recv().await {
                Some(TransportEvent::Disconnected) | None => break,
                Some(_) => continue,
            }
        }
    }
}
