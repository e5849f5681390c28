//! Test doubles: an in-memory WebRTC engine and a loopback WebSocket server.
//!
//! Enabled for this crate's unit tests and, through the `test-util` feature,
//! for downstream integration tests.

use crate::peer::{
    ChannelCore, ChannelError, DataChannel, DataChannelState, MessageHandler, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, PeerEventSender,
};
use crate::signaling::message::SDP_ANSWER;
use crate::signaling::{IceCandidateData, IceServer, SessionDescription};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Failures a [`FakeEngine`] injects into the peers it creates.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub fail_initialize: bool,
    pub fail_create_offer: bool,
    pub fail_set_answer: bool,
    pub fail_add_candidate: bool,
    /// Data channels start out open instead of connecting.
    pub open_channels_immediately: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    script: Mutex<FakeScript>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: FakeScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Applies to peers created after the call.
    pub fn set_script(&self, script: FakeScript) {
        *self.script.lock() = script;
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

impl PeerConnectionFactory for FakeEngine {
    fn create(&self, events: PeerEventSender) -> Arc<dyn PeerConnection> {
        let peer = Arc::new(FakePeer {
            events,
            script: self.script.lock().clone(),
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        });
        self.peers.lock().push(peer.clone());
        peer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    Initialize { ice_servers: Vec<IceServer> },
    CreateDataChannel(String),
    CreateOffer,
    SetRemoteAnswer(String),
    AddIceCandidate(String),
    Close,
}

pub struct FakePeer {
    events: PeerEventSender,
    script: FakeScript,
    calls: Mutex<Vec<PeerCall>>,
    channels: Mutex<Vec<Arc<FakeDataChannel>>>,
    initialized: AtomicBool,
    answered: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeDataChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label() == label)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of times `close` released resources; never above one.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn emit_ice_candidate(&self, candidate: IceCandidateData) {
        let _ = self.events.send(PeerEvent::IceCandidate(candidate));
    }

    pub fn emit_connection_state(&self, state: PeerConnectionState) {
        let _ = self.events.send(PeerEvent::ConnectionState(state));
    }

    /// Simulates the remote side opening a channel of its own.
    pub fn emit_remote_channel(&self, label: &str) -> Arc<FakeDataChannel> {
        let channel = FakeDataChannel::new(label, DataChannelState::Connecting);
        let _ = self.events.send(PeerEvent::DataChannel(channel.clone()));
        channel
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }

    fn ensure_usable(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else if !self.initialized.load(Ordering::SeqCst) {
            Err(PeerError::NotInitialized)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn initialize(&self, ice_servers: &[IceServer]) -> Result<(), PeerError> {
        self.record(PeerCall::Initialize {
            ice_servers: ice_servers.to_vec(),
        });
        if self.script.fail_initialize {
            return Err(PeerError::Engine("scripted initialize failure".into()));
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyInitialized);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer);
        self.ensure_usable()?;
        if self.script.fail_create_offer {
            return Err(PeerError::Engine("scripted offer failure".into()));
        }
        let labels: Vec<String> = self
            .channels
            .lock()
            .iter()
            .map(|channel| channel.label().to_owned())
            .collect();
        Ok(SessionDescription::offer(format!(
            "v=0 fake-offer channels={}",
            labels.join(",")
        )))
    }

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemoteAnswer(answer.sdp.clone()));
        self.ensure_usable()?;
        if self.script.fail_set_answer || answer.kind != SDP_ANSWER {
            return Err(PeerError::InvalidDescription(answer.kind.clone()));
        }
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateData) -> Result<(), PeerError> {
        self.record(PeerCall::AddIceCandidate(candidate.candidate.clone()));
        self.ensure_usable()?;
        if self.script.fail_add_candidate {
            return Err(PeerError::Engine("scripted candidate failure".into()));
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        self.record(PeerCall::CreateDataChannel(label.to_owned()));
        self.ensure_usable()?;
        let initial = if self.script.open_channels_immediately {
            DataChannelState::Open
        } else {
            DataChannelState::Connecting
        };
        let channel = FakeDataChannel::new(label, initial);
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record(PeerCall::Close);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.core.advance(DataChannelState::Closed);
        }
    }
}

pub struct FakeDataChannel {
    core: ChannelCore,
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    close_count: AtomicUsize,
}

impl FakeDataChannel {
    pub fn new(label: &str, initial: DataChannelState) -> Arc<Self> {
        Arc::new(Self {
            core: ChannelCore::new(label, initial),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn open(&self) {
        self.core.advance(DataChannelState::Open);
    }

    /// Simulates the remote end closing the channel.
    pub fn close_remotely(&self) {
        self.core.advance(DataChannelState::Closed);
    }

    /// Delivers an inbound message as if it arrived from the remote peer.
    pub fn deliver(&self, text: impl Into<String>) {
        self.core.deliver(text.into());
    }

    /// Every later `send` fails as a broken transport would.
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn state(&self) -> watch::Receiver<DataChannelState> {
        self.core.subscribe()
    }

    async fn send(&self, message: &str) -> Result<(), ChannelError> {
        if self.core.current() != DataChannelState::Open {
            tracing::warn!(target: "ma::engine", label = self.core.label(), "fake channel not open; dropping");
            return Ok(());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Send("scripted send failure".into()));
        }
        self.sent.lock().push(message.to_owned());
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_handler(handler);
    }

    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.core.advance(DataChannelState::Closed);
    }
}

/// WebSocket server on 127.0.0.1 that hands each accepted socket to the test
/// as a [`LoopbackConnection`].
pub struct LoopbackServer {
    addr: SocketAddr,
    path: String,
    connections: mpsc::UnboundedReceiver<LoopbackConnection>,
    accept_task: JoinHandle<()>,
}

impl LoopbackServer {
    pub async fn bind(path: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, connections) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(socket) = tokio_tungstenite::accept_async(stream).await {
                        let _ = tx.send(LoopbackConnection::spawn(socket));
                    }
                });
            }
        });
        Ok(Self {
            addr,
            path: path.to_owned(),
            connections,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn next_connection(&mut self, wait: Duration) -> Option<LoopbackConnection> {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stops accepting; later connection attempts are refused. Existing
    /// connections stay up.
    pub fn stop_accepting(&self) {
        self.accept_task.abort();
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub struct LoopbackConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl LoopbackConnection {
    fn spawn(socket: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (mut sink, mut stream) = socket.split();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let _ = inbound_tx.send(text);
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if sink.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Self {
            inbound,
            outbound,
            task,
        }
    }

    pub async fn recv_text(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv_json(&mut self, wait: Duration) -> Option<Value> {
        let text = self.recv_text(wait).await?;
        serde_json::from_str(&text).ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.send(Message::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Sends a close frame and stops the connection.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    /// Drops the socket without a close handshake.
    pub fn drop_abruptly(self) {
        self.task.abort();
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
