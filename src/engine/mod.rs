//! Session engine.
//!
//! The engine is a message-passing actor: producers (transport callbacks,
//! application callers) enqueue [`EngineCommand`]s on an unbounded MPSC
//! queue, and a single consumer task drains them in FIFO order. Every state
//! transition and every encrypt/decrypt happens on that consumer, which is
//! what makes the crypto cutover rule sound: once the state reaches
//! [`EngineState::AwaitingSas`], every inbound frame body is AEAD ciphertext
//! and every outbound frame is encrypted before it leaves.
//!
//! ```text
//! Idle ── StartConnection ──▶ transport.connect()
//! Idle ── TransportConnected ──▶ TcpConnected ──(send Hello)──▶ HandshakingCrypto
//! HandshakingCrypto ── KeyExchange in ──▶ AwaitingSas   (SAS emitted)
//! AwaitingSas ── AuthVerify in, accepted ──▶ SessionSecured
//! anywhere ── disconnect or fatal ──▶ Terminated        (absorbing)
//! ```
//!
//! The engine never returns errors to callers; fatal conditions surface as
//! [`EngineEvent::Error`] followed by termination.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::core::{CodecError, EngineError, PROTOCOL_VERSION};
use crate::crypto::{AeadSession, Role, Sas, SessionCrypto};
use crate::transport::{encode_frame, FrameCodec, Transport, TransportEvent};
use crate::wire::{FileEntry, Frame, Hello, PathPayload};

/// Connection lifecycle states, totally ordered for cutover comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    /// Nothing started yet.
    Idle,
    /// Transport is up; Hello not yet sent.
    TcpConnected,
    /// Hello sent; exchanging Hello/KeyExchange in the clear.
    HandshakingCrypto,
    /// Keys derived; waiting for both SAS confirmations. Frames are
    /// encrypted from here on.
    AwaitingSas,
    /// Both sides accepted the SAS; application traffic flows.
    SessionSecured,
    /// Dead. No command leaves this state.
    Terminated,
}

/// Static configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name announced in the Hello message.
    pub device_name: String,
    /// Which side of the key schedule this endpoint takes.
    pub role: Role,
}

impl EngineConfig {
    /// Convenience constructor.
    pub fn new(device_name: impl Into<String>, role: Role) -> Self {
        Self {
            device_name: device_name.into(),
            role,
        }
    }
}

/// Inputs to the engine's command queue.
#[derive(Debug)]
pub enum EngineCommand {
    /// Start the transport. Only meaningful in `Idle`; ignored elsewhere.
    StartConnection,
    /// The transport reported `Connected`.
    TransportConnected,
    /// A whole frame (`[type || payload]`) arrived from the codec.
    NetworkFrameReceived(Vec<u8>),
    /// The codec rejected the inbound stream; fatal.
    CodecFailed(CodecError),
    /// The local user's SAS verdict.
    ConfirmSas(bool),
    /// The transport reported `Disconnected`.
    TransportDisconnected,
    /// Ask the peer for its manifest.
    RequestTree,
    /// Send our manifest to the peer.
    SendTree(Vec<FileEntry>),
    /// Ask the peer to stream a file.
    RequestFile(String),
    /// Send one chunk of a file we are streaming.
    SendFileChunk {
        /// Path of the file being streamed.
        path: String,
        /// Byte offset of `data` within the file.
        offset: u64,
        /// Chunk contents.
        data: Vec<u8>,
    },
    /// Mark a streamed file as complete.
    SendFileComplete(String),
}

/// Outputs of the engine, fired from the consumer in processing order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Keys are derived; show these tokens to the user.
    SasGenerated(Sas),
    /// The session is authenticated and encrypted in both directions.
    SessionSecured,
    /// Fatal condition; the engine has terminated.
    Error(String),
    /// The peer asked for our manifest.
    RemoteTreeRequested,
    /// The peer's manifest arrived.
    RemoteTreeReceived(Vec<FileEntry>),
    /// The peer asked us to stream a file.
    FileRequested(String),
    /// A chunk of a file we requested arrived.
    FileChunkReceived {
        /// Path of the file being streamed.
        path: String,
        /// Byte offset of `data` within the file.
        offset: u64,
        /// Chunk contents.
        data: Vec<u8>,
    },
    /// The peer finished streaming a file.
    FileCompleteReceived(String),
}

/// Cloneable handle for enqueueing commands from any task.
///
/// Every method is fire-and-forget: it appends a command and returns.
/// Commands sent after termination are silently dropped.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<EngineState>,
}

impl EngineHandle {
    /// Start connecting (client side).
    pub fn start_connection(&self) {
        let _ = self.commands.send(EngineCommand::StartConnection);
    }

    /// Report the local user's SAS verdict.
    pub fn confirm_sas(&self, accepted: bool) {
        let _ = self.commands.send(EngineCommand::ConfirmSas(accepted));
    }

    /// Ask the peer for its file manifest.
    pub fn request_remote_tree(&self) {
        let _ = self.commands.send(EngineCommand::RequestTree);
    }

    /// Send our file manifest to the peer.
    pub fn send_file_tree(&self, files: Vec<FileEntry>) {
        let _ = self.commands.send(EngineCommand::SendTree(files));
    }

    /// Ask the peer to stream a file.
    pub fn request_file(&self, path: impl Into<String>) {
        let _ = self
            .commands
            .send(EngineCommand::RequestFile(path.into()));
    }

    /// Send one chunk of a file we are streaming to the peer.
    pub fn send_file_chunk(&self, path: impl Into<String>, offset: u64, data: Vec<u8>) {
        let _ = self.commands.send(EngineCommand::SendFileChunk {
            path: path.into(),
            offset,
            data,
        });
    }

    /// Mark a file we streamed as complete.
    pub fn send_file_complete(&self, path: impl Into<String>) {
        let _ = self
            .commands
            .send(EngineCommand::SendFileComplete(path.into()));
    }

    /// Terminate the session (the universal cancel).
    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::TransportDisconnected);
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `predicate` (or the engine is gone,
    /// in which case the last observed state is returned).
    pub async fn state_when(
        &self,
        predicate: impl Fn(EngineState) -> bool,
    ) -> EngineState {
        let mut rx = self.state.clone();
        loop {
            let current = *rx.borrow();
            if predicate(current) || rx.changed().await.is_err() {
                return current;
            }
        }
    }
}

/// The engine actor. Exclusively owned by its consumer task.
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    transport: Arc<dyn Transport>,
    crypto: Option<SessionCrypto>,
    aead: Option<AeadSession>,
    events: mpsc::UnboundedSender<EngineEvent>,
    state_tx: watch::Sender<EngineState>,
}

impl Engine {
    /// Spawn an engine plus its transport pump.
    ///
    /// Returns the command handle and the event stream. The transport's
    /// event receiver is consumed by a pump task that runs the frame codec
    /// and feeds the command queue.
    pub fn spawn(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        tokio::spawn(pump_transport(transport_events, cmd_tx.clone()));

        let engine = Engine {
            config,
            state: EngineState::Idle,
            transport,
            crypto: None,
            aead: None,
            events: event_tx,
            state_tx,
        };
        tokio::spawn(engine.run(cmd_rx));

        (
            EngineHandle {
                commands: cmd_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            if let Err(err) = self.handle_command(command) {
                self.fail(err);
            }
            if self.state == EngineState::Terminated {
                // Tear the transport down and drop the receiver; later
                // enqueues become no-ops.
                self.transport.disconnect();
                break;
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        match command {
            EngineCommand::StartConnection => {
                if self.state == EngineState::Idle {
                    self.transport.connect();
                }
                Ok(())
            }
            EngineCommand::TransportConnected => {
                if self.state >= EngineState::HandshakingCrypto {
                    return Ok(());
                }
                self.set_state(EngineState::TcpConnected);
                self.send_hello()?;
                self.set_state(EngineState::HandshakingCrypto);
                Ok(())
            }
            EngineCommand::NetworkFrameReceived(payload) => self.handle_network_frame(payload),
            EngineCommand::CodecFailed(err) => Err(err.into()),
            EngineCommand::ConfirmSas(accepted) => {
                // The peer's own AuthVerify may already have secured us; the
                // local verdict must still go out so the peer can secure too.
                if self.state != EngineState::AwaitingSas
                    && self.state != EngineState::SessionSecured
                {
                    return Err(EngineError::ProtocolViolation(format!(
                        "SAS confirmation in state {:?}",
                        self.state
                    )));
                }
                if !accepted {
                    return Err(EngineError::SasRejected);
                }
                self.send_frame(&Frame::AuthVerify { accepted: true })
            }
            EngineCommand::TransportDisconnected => {
                self.set_state(EngineState::Terminated);
                Ok(())
            }
            EngineCommand::RequestTree => {
                self.require_secured("request tree")?;
                self.send_frame(&Frame::RequestTree)
            }
            EngineCommand::SendTree(files) => {
                self.require_secured("send tree")?;
                self.send_frame(&Frame::FileTreeChunk(files))
            }
            EngineCommand::RequestFile(path) => {
                self.require_secured("request file")?;
                self.send_frame(&Frame::FileRequest(PathPayload {
                    relative_path: path,
                }))
            }
            EngineCommand::SendFileChunk { path, offset, data } => {
                self.require_secured("send file chunk")?;
                self.send_frame(&Frame::FileChunk {
                    relative_path: path,
                    offset,
                    data,
                })
            }
            EngineCommand::SendFileComplete(path) => {
                self.require_secured("send file complete")?;
                self.send_frame(&Frame::FileComplete(PathPayload {
                    relative_path: path,
                }))
            }
        }
    }

    fn handle_network_frame(&mut self, payload: Vec<u8>) -> Result<(), EngineError> {
        if payload.is_empty() {
            return Err(EngineError::ProtocolViolation("empty frame".into()));
        }
        let msg_type = payload[0];

        // Crypto cutover: from AwaitingSas on, every frame body is AEAD
        // ciphertext bound to its message type.
        let body = if self.state >= EngineState::AwaitingSas {
            let aead = self
                .aead
                .as_mut()
                .ok_or_else(|| EngineError::ProtocolViolation("no session keys".into()))?;
            aead.decrypt(&payload[1..], &[msg_type])?
        } else {
            payload[1..].to_vec()
        };

        match Frame::decode(msg_type, &body)? {
            Frame::Hello(hello) => self.handle_hello(hello),
            Frame::KeyExchange { public_key, salt } => self.handle_key_exchange(&public_key, &salt),
            Frame::AuthVerify { accepted } => self.handle_auth_verify(accepted),
            Frame::RequestTree => {
                self.require_secured_frame(msg_type)?;
                self.emit(EngineEvent::RemoteTreeRequested);
                Ok(())
            }
            Frame::FileTreeChunk(files) => {
                self.require_secured_frame(msg_type)?;
                self.emit(EngineEvent::RemoteTreeReceived(files));
                Ok(())
            }
            Frame::FileRequest(path) => {
                self.require_secured_frame(msg_type)?;
                self.emit(EngineEvent::FileRequested(path.relative_path));
                Ok(())
            }
            Frame::FileChunk {
                relative_path,
                offset,
                data,
            } => {
                self.require_secured_frame(msg_type)?;
                self.emit(EngineEvent::FileChunkReceived {
                    path: relative_path,
                    offset,
                    data,
                });
                Ok(())
            }
            Frame::FileComplete(path) => {
                self.require_secured_frame(msg_type)?;
                self.emit(EngineEvent::FileCompleteReceived(path.relative_path));
                Ok(())
            }
        }
    }

    fn handle_hello(&mut self, hello: Hello) -> Result<(), EngineError> {
        // The passive side answers the first Hello with its own.
        if self.state < EngineState::HandshakingCrypto {
            self.send_hello()?;
            self.set_state(EngineState::HandshakingCrypto);
        }
        if self.state != EngineState::HandshakingCrypto {
            return Err(EngineError::ProtocolViolation(format!(
                "Hello in state {:?}",
                self.state
            )));
        }
        if hello.version != PROTOCOL_VERSION {
            return Err(EngineError::VersionMismatch {
                expected: PROTOCOL_VERSION.into(),
                actual: hello.version,
            });
        }
        tracing::debug!(peer = %hello.device_name, "hello received");

        if self.crypto.is_none() {
            self.crypto = Some(SessionCrypto::new()?);
        }
        let crypto = self
            .crypto
            .as_ref()
            .ok_or_else(|| EngineError::ProtocolViolation("no session crypto".into()))?;
        let key_exchange = Frame::KeyExchange {
            public_key: crypto.public_key_der().to_vec(),
            salt: *crypto.salt(),
        };
        self.send_frame(&key_exchange)
    }

    fn handle_key_exchange(
        &mut self,
        public_key: &[u8],
        salt: &[u8; 32],
    ) -> Result<(), EngineError> {
        if self.state != EngineState::HandshakingCrypto {
            return Err(EngineError::ProtocolViolation(format!(
                "KeyExchange in state {:?}",
                self.state
            )));
        }
        let crypto = self
            .crypto
            .take()
            .ok_or_else(|| EngineError::ProtocolViolation("KeyExchange before Hello".into()))?;

        let (keys, sas) = crypto.derive(public_key, salt, self.config.role.is_server())?;
        self.aead = Some(AeadSession::new(keys));
        self.set_state(EngineState::AwaitingSas);
        self.emit(EngineEvent::SasGenerated(sas));
        Ok(())
    }

    fn handle_auth_verify(&mut self, accepted: bool) -> Result<(), EngineError> {
        if self.state == EngineState::SessionSecured {
            // An in-flight duplicate; tolerated.
            tracing::debug!("duplicate AuthVerify ignored");
            return Ok(());
        }
        if self.state != EngineState::AwaitingSas {
            return Err(EngineError::ProtocolViolation(format!(
                "AuthVerify in state {:?}",
                self.state
            )));
        }
        if !accepted {
            return Err(EngineError::PeerRejectedSas);
        }
        self.set_state(EngineState::SessionSecured);
        self.emit(EngineEvent::SessionSecured);
        Ok(())
    }

    fn send_hello(&mut self) -> Result<(), EngineError> {
        self.send_frame(&Frame::Hello(Hello {
            version: PROTOCOL_VERSION.into(),
            device_name: self.config.device_name.clone(),
        }))
    }

    /// Encode, encrypt past the cutover, length-prefix and hand to the
    /// transport. Sends are not awaited; the transport preserves order.
    fn send_frame(&mut self, frame: &Frame) -> Result<(), EngineError> {
        let (msg_type, mut payload) = frame.encode()?;
        if self.state >= EngineState::AwaitingSas {
            let aead = self
                .aead
                .as_mut()
                .ok_or_else(|| EngineError::ProtocolViolation("no session keys".into()))?;
            payload = aead.encrypt(&payload, &[msg_type])?;
        }
        self.transport.send(encode_frame(msg_type, &payload));
        Ok(())
    }

    fn require_secured(&self, what: &str) -> Result<(), EngineError> {
        if self.state == EngineState::SessionSecured {
            Ok(())
        } else {
            Err(EngineError::ProtocolViolation(format!(
                "{what} requires a secured session, state is {:?}",
                self.state
            )))
        }
    }

    fn require_secured_frame(&self, msg_type: u8) -> Result<(), EngineError> {
        if self.state == EngineState::SessionSecured {
            Ok(())
        } else {
            Err(EngineError::ProtocolViolation(format!(
                "message 0x{msg_type:02x} requires a secured session, state is {:?}",
                self.state
            )))
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "engine state");
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&mut self, err: EngineError) {
        tracing::error!(%err, "engine terminated");
        self.set_state(EngineState::Terminated);
        self.emit(EngineEvent::Error(err.to_string()));
    }
}

/// Bridge transport events into the command queue, running the frame codec
/// between the raw byte stream and `NetworkFrameReceived`.
async fn pump_transport(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedSender<EngineCommand>,
) {
    let mut codec = FrameCodec::new();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                if commands.send(EngineCommand::TransportConnected).is_err() {
                    break;
                }
            }
            TransportEvent::Disconnected => {
                let _ = commands.send(EngineCommand::TransportDisconnected);
                break;
            }
            TransportEvent::BytesReceived(chunk) => match codec.feed(&chunk) {
                Ok(frames) => {
                    for frame in frames {
                        if commands
                            .send(EngineCommand::NetworkFrameReceived(frame))
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = commands.send(EngineCommand::CodecFailed(err));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FragmentPolicy, LoopbackTransport};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct Peer {
        handle: EngineHandle,
        events: UnboundedReceiver<EngineEvent>,
    }

    fn engine_pair(policy: FragmentPolicy) -> (Peer, Peer) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a_transport, b_transport) = LoopbackTransport::pair(a_tx, b_tx, policy);

        let (a_handle, a_events) = Engine::spawn(
            EngineConfig::new("client", Role::Initiator),
            Arc::new(a_transport),
            a_rx,
        );
        let (b_handle, b_events) = Engine::spawn(
            EngineConfig::new("server", Role::Responder),
            Arc::new(b_transport),
            b_rx,
        );
        (
            Peer {
                handle: a_handle,
                events: a_events,
            },
            Peer {
                handle: b_handle,
                events: b_events,
            },
        )
    }

    async fn next_event(peer: &mut Peer) -> EngineEvent {
        timeout(Duration::from_secs(5), peer.events.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("engine event stream closed")
    }

    async fn secure_pair(client: &mut Peer, server: &mut Peer) {
        client.handle.start_connection();
        server.handle.start_connection();

        assert!(matches!(
            next_event(client).await,
            EngineEvent::SasGenerated(_)
        ));
        assert!(matches!(
            next_event(server).await,
            EngineEvent::SasGenerated(_)
        ));

        client.handle.confirm_sas(true);
        server.handle.confirm_sas(true);

        assert_eq!(next_event(client).await, EngineEvent::SessionSecured);
        assert_eq!(next_event(server).await, EngineEvent::SessionSecured);
    }

    #[tokio::test]
    async fn test_handshake_reaches_secured_on_both_sides() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        secure_pair(&mut client, &mut server).await;

        assert_eq!(client.handle.state(), EngineState::SessionSecured);
        assert_eq!(server.handle.state(), EngineState::SessionSecured);
    }

    #[tokio::test]
    async fn test_handshake_survives_fragmented_stream() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Random { max: 3 });
        secure_pair(&mut client, &mut server).await;
    }

    #[tokio::test]
    async fn test_both_sides_derive_identical_sas() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        client.handle.start_connection();
        server.handle.start_connection();

        let client_sas = match next_event(&mut client).await {
            EngineEvent::SasGenerated(sas) => sas,
            other => panic!("unexpected event: {other:?}"),
        };
        let server_sas = match next_event(&mut server).await {
            EngineEvent::SasGenerated(sas) => sas,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(client_sas, server_sas);
    }

    #[tokio::test]
    async fn test_local_sas_rejection_is_fatal() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        client.handle.start_connection();
        server.handle.start_connection();

        assert!(matches!(
            next_event(&mut client).await,
            EngineEvent::SasGenerated(_)
        ));
        assert!(matches!(
            next_event(&mut server).await,
            EngineEvent::SasGenerated(_)
        ));

        client.handle.confirm_sas(false);
        assert!(matches!(
            next_event(&mut client).await,
            EngineEvent::Error(_)
        ));
        client
            .handle
            .state_when(|s| s == EngineState::Terminated)
            .await;
    }

    #[tokio::test]
    async fn test_sas_rejection_tears_down_both_ends() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        client.handle.start_connection();
        server.handle.start_connection();

        assert!(matches!(
            next_event(&mut client).await,
            EngineEvent::SasGenerated(_)
        ));
        assert!(matches!(
            next_event(&mut server).await,
            EngineEvent::SasGenerated(_)
        ));

        server.handle.confirm_sas(false);
        assert!(matches!(
            next_event(&mut server).await,
            EngineEvent::Error(_)
        ));
        client
            .handle
            .state_when(|s| s == EngineState::Terminated)
            .await;
    }

    /// A scripted peer speaking raw frames, for driving the engine into
    /// corners the honest implementation never produces.
    struct ManualPeer {
        transport: LoopbackTransport,
        rx: UnboundedReceiver<TransportEvent>,
        codec: FrameCodec,
    }

    impl ManualPeer {
        fn send_clear(&self, frame: &Frame) {
            let (tag, payload) = frame.encode().unwrap();
            self.transport.send(encode_frame(tag, &payload));
        }

        fn send_encrypted(&self, aead: &mut AeadSession, frame: &Frame) {
            let (tag, payload) = frame.encode().unwrap();
            let ciphertext = aead.encrypt(&payload, &[tag]).unwrap();
            self.transport.send(encode_frame(tag, &ciphertext));
        }

        async fn read_frame(&mut self) -> Vec<u8> {
            loop {
                match timeout(Duration::from_secs(5), self.rx.recv())
                    .await
                    .expect("timed out")
                    .expect("loopback closed")
                {
                    TransportEvent::BytesReceived(chunk) => {
                        let mut frames = self.codec.feed(&chunk).unwrap();
                        if !frames.is_empty() {
                            return frames.remove(0);
                        }
                    }
                    TransportEvent::Connected => continue,
                    TransportEvent::Disconnected => panic!("peer disconnected early"),
                }
            }
        }

        /// Play the responder through Hello/KeyExchange; afterwards the
        /// engine under test has emitted its SAS and our [`AeadSession`]
        /// mirrors its keys.
        async fn handshake(&mut self) -> AeadSession {
            let frame = self.read_frame().await;
            assert_eq!(frame[0], crate::core::MSG_HELLO);

            let crypto = SessionCrypto::new().unwrap();
            self.send_clear(&Frame::Hello(Hello {
                version: PROTOCOL_VERSION.into(),
                device_name: "scripted".into(),
            }));

            let frame = self.read_frame().await;
            let (client_pub, client_salt) =
                match Frame::decode(frame[0], &frame[1..]).unwrap() {
                    Frame::KeyExchange { public_key, salt } => (public_key, salt),
                    other => panic!("expected KeyExchange, got {other:?}"),
                };

            self.send_clear(&Frame::KeyExchange {
                public_key: crypto.public_key_der().to_vec(),
                salt: *crypto.salt(),
            });

            let (keys, _) = crypto.derive(&client_pub, &client_salt, true).unwrap();
            AeadSession::new(keys)
        }
    }

    fn engine_with_manual_peer() -> (EngineHandle, UnboundedReceiver<EngineEvent>, ManualPeer)
    {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a_transport, b_transport) =
            LoopbackTransport::pair(a_tx, b_tx, FragmentPolicy::Whole);

        let (handle, events) = Engine::spawn(
            EngineConfig::new("client", Role::Initiator),
            Arc::new(a_transport),
            a_rx,
        );
        handle.start_connection();

        (
            handle,
            events,
            ManualPeer {
                transport: b_transport,
                rx: b_rx,
                codec: FrameCodec::new(),
            },
        )
    }

    async fn expect_error(
        events: &mut UnboundedReceiver<EngineEvent>,
        needle: &str,
    ) -> String {
        loop {
            match timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for error")
                .expect("event stream closed without error")
            {
                EngineEvent::Error(message) => {
                    assert!(
                        message.contains(needle),
                        "error {message:?} does not mention {needle:?}"
                    );
                    return message;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_peer_auth_verify_rejection_is_fatal() {
        let (handle, mut events, mut peer) = engine_with_manual_peer();
        let mut aead = peer.handshake().await;

        peer.send_encrypted(&mut aead, &Frame::AuthVerify { accepted: false });

        expect_error(&mut events, "peer").await;
        handle.state_when(|s| s == EngineState::Terminated).await;
    }

    #[tokio::test]
    async fn test_duplicate_auth_verify_is_tolerated() {
        let (handle, mut events, mut peer) = engine_with_manual_peer();
        let mut aead = peer.handshake().await;

        // Only confirm once the SAS is actually out, so the verdict cannot
        // overtake the engine's own key derivation.
        assert!(matches!(
            timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap(),
            EngineEvent::SasGenerated(_)
        ));
        handle.confirm_sas(true);

        // Two acceptances in flight; the second must be ignored, and the
        // sequence counters must stay aligned for what follows.
        peer.send_encrypted(&mut aead, &Frame::AuthVerify { accepted: true });
        peer.send_encrypted(&mut aead, &Frame::AuthVerify { accepted: true });
        peer.send_encrypted(&mut aead, &Frame::RequestTree);

        let mut secured = false;
        let mut tree_requested = false;
        while !(secured && tree_requested) {
            match timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out")
                .expect("event stream closed")
            {
                EngineEvent::SessionSecured => secured = true,
                EngineEvent::RemoteTreeRequested => tree_requested = true,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(handle.state(), EngineState::SessionSecured);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let (handle, mut events, mut peer) = engine_with_manual_peer();

        let frame = peer.read_frame().await;
        assert_eq!(frame[0], crate::core::MSG_HELLO);
        peer.send_clear(&Frame::Hello(Hello {
            version: "9.9".into(),
            device_name: "old".into(),
        }));

        expect_error(&mut events, "version").await;
        handle.state_when(|s| s == EngineState::Terminated).await;
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_fatal() {
        let (handle, mut events, mut peer) = engine_with_manual_peer();
        let mut aead = peer.handshake().await;

        let (tag, payload) = Frame::AuthVerify { accepted: true }.encode().unwrap();
        let mut ciphertext = aead.encrypt(&payload, &[tag]).unwrap();
        ciphertext[0] ^= 0xFF;
        peer.transport.send(encode_frame(tag, &ciphertext));

        expect_error(&mut events, "authentication").await;
        handle.state_when(|s| s == EngineState::Terminated).await;
    }

    #[tokio::test]
    async fn test_tree_request_before_secured_is_fatal() {
        let (mut client, _server) = engine_pair(FragmentPolicy::Whole);
        client.handle.request_remote_tree();
        assert!(matches!(
            next_event(&mut client).await,
            EngineEvent::Error(message) if message.contains("secured")
        ));
    }

    #[tokio::test]
    async fn test_commands_after_termination_are_dropped() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        secure_pair(&mut client, &mut server).await;

        client.handle.shutdown();
        client
            .handle
            .state_when(|s| s == EngineState::Terminated)
            .await;

        // Must neither panic nor produce an event.
        client.handle.request_remote_tree();
        assert!(client.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_terminates_peer() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Whole);
        secure_pair(&mut client, &mut server).await;

        client.handle.shutdown();
        server
            .handle
            .state_when(|s| s == EngineState::Terminated)
            .await;
        assert!(server.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_application_frames_flow_after_cutover() {
        let (mut client, mut server) = engine_pair(FragmentPolicy::Random { max: 11 });
        secure_pair(&mut client, &mut server).await;

        client.handle.request_remote_tree();
        assert_eq!(next_event(&mut server).await, EngineEvent::RemoteTreeRequested);

        let files = vec![FileEntry {
            relative_path: "test1.txt".into(),
            size: 1024,
            last_write_ticks: 123_456_789,
            hash: None,
        }];
        server.handle.send_file_tree(files.clone());
        assert_eq!(
            next_event(&mut client).await,
            EngineEvent::RemoteTreeReceived(files)
        );

        client.handle.request_file("test1.txt");
        assert_eq!(
            next_event(&mut server).await,
            EngineEvent::FileRequested("test1.txt".into())
        );

        server.handle.send_file_chunk("test1.txt", 0, vec![7; 1024]);
        server.handle.send_file_complete("test1.txt");
        assert_eq!(
            next_event(&mut client).await,
            EngineEvent::FileChunkReceived {
                path: "test1.txt".into(),
                offset: 0,
                data: vec![7; 1024],
            }
        );
        assert_eq!(
            next_event(&mut client).await,
            EngineEvent::FileCompleteReceived("test1.txt".into())
        );
    }
}
