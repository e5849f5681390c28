//! Connection state machine for one remote server at a time.
//!
//! ```text
//! Idle -> ConnectingToSignaling -> NegotiatingPeerConnection -> GatheringIceCandidates -> Connected
//!            any of the above -> Error -> (connect) ConnectingToSignaling
//!            any -> Disconnecting -> Idle
//! ```
//!
//! Every attempt gets a generation number. Background tasks carry the
//! generation they were started for and become inert once a newer attempt or
//! a disconnect has replaced it.

use crate::peer::{
    API_CHANNEL_LABEL, ChannelError, DataChannel, DataChannelState, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerEventSender,
};
use crate::remote_id::RemoteId;
use crate::signaling::{
    IceCandidateData, IceServer, SessionDescription, SignalingClient, SignalingMessage,
    SignalingState,
};
use crate::state::{WebRtcConnectionState, WebRtcError};
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on the time between `connect` and an open data channel.
    /// `None` waits indefinitely.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        }
    }
}

pub struct WebRtcConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    signaling: Arc<SignalingClient>,
    engine: Arc<dyn PeerConnectionFactory>,
    config: ManagerConfig,
    /// Serializes connect, disconnect and failure teardown.
    op_lock: AsyncMutex<()>,
    generation: AtomicU64,
    state_tx: watch::Sender<WebRtcConnectionState>,
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    remote_id: Option<RemoteId>,
    session_id: Option<String>,
    peer: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    listener: Option<JoinHandle<()>>,
    channel_watcher: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Stop,
}

impl WebRtcConnectionManager {
    pub fn new(signaling: Arc<SignalingClient>, engine: Arc<dyn PeerConnectionFactory>) -> Self {
        Self::with_config(signaling, engine, ManagerConfig::default())
    }

    pub fn with_config(
        signaling: Arc<SignalingClient>,
        engine: Arc<dyn PeerConnectionFactory>,
        config: ManagerConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(WebRtcConnectionState::Idle);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                signaling,
                engine,
                config,
                op_lock: AsyncMutex::new(()),
                generation: AtomicU64::new(0),
                state_tx,
                incoming_tx,
                incoming_rx: Mutex::new(Some(incoming_rx)),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<WebRtcConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> WebRtcConnectionState {
        self.inner.current_state()
    }

    /// Text messages received on the `ma-api` channel, in arrival order and
    /// without loss. There is a single consumer: the receiver is handed out
    /// once and later calls return `None`.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.inner.incoming_rx.lock().take()
    }

    pub fn remote_id(&self) -> Option<RemoteId> {
        self.inner.session.lock().remote_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().session_id.clone()
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.inner.signaling
    }

    /// Starts a connection attempt. Does nothing unless the manager is idle
    /// or in an error state; leftovers of a failed attempt are released
    /// first. Progress and failures are reported through [`Self::state`].
    pub async fn connect(&self, remote_id: RemoteId) {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        match inner.current_state() {
            WebRtcConnectionState::Idle => {}
            WebRtcConnectionState::Error(previous) => {
                tracing::debug!(
                    target: "ma::webrtc",
                    %previous,
                    "releasing failed session before reconnecting"
                );
                inner.teardown().await;
            }
            state => {
                tracing::warn!(
                    target: "ma::webrtc",
                    ?state,
                    "connect ignored: a connection is already active"
                );
                return;
            }
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            target: "ma::webrtc",
            remote_id = %remote_id.full_formatted(),
            generation,
            "connecting to remote server"
        );
        inner.session.lock().remote_id = Some(remote_id.clone());
        inner
            .state_tx
            .send_replace(WebRtcConnectionState::ConnectingToSignaling);

        let messages = inner.signaling.incoming();
        if let Err(err) = inner.signaling.connect().await {
            inner.state_tx.send_replace(WebRtcConnectionState::Error(
                WebRtcError::Signaling(format!("failed to connect to signaling server: {err}")),
            ));
            inner.teardown().await;
            return;
        }

        let listener = tokio::spawn(inner.clone().listen(
            generation,
            messages,
            inner.signaling.state(),
        ));
        let deadline = inner
            .config
            .negotiation_timeout
            .map(|limit| tokio::spawn(inner.clone().negotiation_deadline(generation, limit)));
        {
            let mut session = inner.session.lock();
            session.listener = Some(listener);
            session.deadline = deadline;
        }

        let request = SignalingMessage::ConnectRequest {
            remote_id: remote_id.as_str().to_owned(),
        };
        if let Err(err) = inner.signaling.send_message(&request).await {
            inner.state_tx.send_replace(WebRtcConnectionState::Error(
                WebRtcError::Signaling(format!("failed to send connect request: {err}")),
            ));
            inner.teardown().await;
        }
    }

    /// Sends one text message over the `ma-api` channel. Without a channel
    /// the message is logged and dropped.
    pub async fn send(&self, message: &str) {
        if let Err(err) = self.try_send(message).await {
            tracing::error!(target: "ma::webrtc", error = %err, "data channel send failed");
        }
    }

    /// Like [`Self::send`], but reports a missing channel or a failed write.
    pub async fn try_send(&self, message: &str) -> Result<(), ChannelError> {
        let channel = self.inner.session.lock().channel.clone();
        let Some(channel) = channel else {
            return Err(ChannelError::NoChannel);
        };
        channel.send(message).await
    }

    /// Releases every resource of the current attempt and returns to idle.
    /// Safe to call from any state, any number of times.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        let idle = inner.current_state() == WebRtcConnectionState::Idle;
        if !idle {
            tracing::info!(target: "ma::webrtc", "disconnecting");
            inner
                .state_tx
                .send_replace(WebRtcConnectionState::Disconnecting);
        }
        inner.teardown().await;
        inner.state_tx.send_if_modified(|state| {
            if *state == WebRtcConnectionState::Idle {
                false
            } else {
                *state = WebRtcConnectionState::Idle;
                true
            }
        });
    }
}

impl Drop for WebRtcConnectionManager {
    fn drop(&mut self) {
        let Session {
            peer,
            channel,
            listener,
            channel_watcher,
            deadline,
            ..
        } = std::mem::take(&mut *self.inner.session.lock());
        for task in [listener, channel_watcher, deadline].into_iter().flatten() {
            task.abort();
        }
        if peer.is_some() || channel.is_some() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Some(channel) = channel {
                        channel.close().await;
                    }
                    if let Some(peer) = peer {
                        peer.close().await;
                    }
                });
            }
        }
        self.inner.signaling.close();
    }
}

impl Inner {
    fn current_state(&self) -> WebRtcConnectionState {
        self.state_tx.borrow().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn listen(
        self: Arc<Self>,
        generation: u64,
        mut messages: broadcast::Receiver<SignalingMessage>,
        mut signaling_state: watch::Receiver<SignalingState>,
    ) {
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        signaling_state.borrow_and_update();
        loop {
            let flow = tokio::select! {
                biased;
                received = messages.recv() => match received {
                    Ok(message) => self.handle_signaling(generation, message, &peer_tx).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "ma::webrtc", skipped, "signaling listener lagged");
                        Flow::Continue
                    }
                    Err(RecvError::Closed) => Flow::Stop,
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                changed = signaling_state.changed() => match changed {
                    Ok(()) => {
                        let state = signaling_state.borrow_and_update().clone();
                        self.handle_signaling_state(generation, state)
                    }
                    Err(_) => Flow::Stop,
                },
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        tracing::debug!(target: "ma::webrtc", generation, "signaling listener stopped");
    }

    async fn handle_signaling(
        self: &Arc<Self>,
        generation: u64,
        message: SignalingMessage,
        peer_tx: &PeerEventSender,
    ) -> Flow {
        match message {
            SignalingMessage::Connected {
                session_id,
                ice_servers,
            } => {
                self.on_session_ready(generation, session_id, ice_servers, peer_tx)
                    .await
            }
            SignalingMessage::Answer { session_id, data } => {
                self.on_answer(generation, &session_id, data).await
            }
            SignalingMessage::IceCandidate {
                session_id, data, ..
            } => self.on_remote_candidate(&session_id, data).await,
            SignalingMessage::Error { error, .. } => self.on_remote_error(generation, error),
            SignalingMessage::PeerDisconnected { session_id } => {
                tracing::info!(target: "ma::webrtc", %session_id, "remote peer disconnected");
                self.fail(
                    generation,
                    WebRtcError::Connection("Remote peer disconnected".into()),
                )
            }
            SignalingMessage::Unknown { kind } => {
                tracing::warn!(target: "ma::webrtc", %kind, "ignoring unknown signaling message");
                Flow::Continue
            }
            other => {
                tracing::debug!(
                    target: "ma::webrtc",
                    kind = other.kind(),
                    "ignoring signaling message"
                );
                Flow::Continue
            }
        }
    }

    async fn on_session_ready(
        self: &Arc<Self>,
        generation: u64,
        session_id: String,
        ice_servers: Vec<IceServer>,
        peer_tx: &PeerEventSender,
    ) -> Flow {
        if self.current_state() != WebRtcConnectionState::ConnectingToSignaling
            || self.session.lock().peer.is_some()
        {
            tracing::warn!(
                target: "ma::webrtc",
                %session_id,
                "ignoring session-ready for an established session"
            );
            return Flow::Continue;
        }
        tracing::info!(
            target: "ma::webrtc",
            %session_id,
            ice_servers = ice_servers.len(),
            "signaling session ready"
        );
        self.state_tx
            .send_replace(WebRtcConnectionState::NegotiatingPeerConnection {
                session_id: session_id.clone(),
            });

        let peer = self.engine.create(peer_tx.clone());
        let remote_id = {
            let mut session = self.session.lock();
            session.session_id = Some(session_id.clone());
            session.peer = Some(peer.clone());
            session.remote_id.clone()
        };

        match self
            .negotiate(generation, &peer, &session_id, &ice_servers, remote_id)
            .await
        {
            Ok(()) => {
                // The channel may already be open, in which case Connected stands.
                self.state_tx.send_if_modified(|state| match state {
                    WebRtcConnectionState::NegotiatingPeerConnection { session_id: current }
                        if *current == session_id =>
                    {
                        *state = WebRtcConnectionState::GatheringIceCandidates { session_id };
                        true
                    }
                    _ => false,
                });
                Flow::Continue
            }
            Err(err) => self.fail(generation, err),
        }
    }

    async fn negotiate(
        self: &Arc<Self>,
        generation: u64,
        peer: &Arc<dyn PeerConnection>,
        session_id: &str,
        ice_servers: &[IceServer],
        remote_id: Option<RemoteId>,
    ) -> Result<(), WebRtcError> {
        peer.initialize(ice_servers)
            .await
            .map_err(|err| peer_failure("initialize peer connection", err))?;
        let channel = peer
            .create_data_channel(API_CHANNEL_LABEL)
            .await
            .map_err(|err| peer_failure("create data channel", err))?;
        self.attach_channel(generation, session_id, channel);
        let offer = peer
            .create_offer()
            .await
            .map_err(|err| peer_failure("create offer", err))?;
        let message = SignalingMessage::Offer {
            remote_id: remote_id.map(RemoteId::into_string),
            session_id: session_id.to_owned(),
            data: offer,
        };
        self.signaling
            .send_message(&message)
            .await
            .map_err(|err| peer_failure("send offer", err))?;
        tracing::debug!(target: "ma::webrtc", %session_id, "offer sent");
        Ok(())
    }

    fn attach_channel(
        self: &Arc<Self>,
        generation: u64,
        session_id: &str,
        channel: Arc<dyn DataChannel>,
    ) {
        let incoming = self.incoming_tx.clone();
        channel.on_message(Arc::new(move |text: String| {
            tracing::trace!(target: "ma::webrtc", len = text.len(), "data channel message");
            if incoming.send(text).is_err() {
                tracing::debug!(target: "ma::webrtc", "incoming receiver dropped; discarding message");
            }
        }));
        let watcher = tokio::spawn(self.clone().watch_channel(
            generation,
            session_id.to_owned(),
            channel.clone(),
        ));
        let previous = {
            let mut session = self.session.lock();
            session.channel = Some(channel);
            session.channel_watcher.replace(watcher)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// The channel opening is the only signal that promotes to Connected.
    async fn watch_channel(
        self: Arc<Self>,
        generation: u64,
        session_id: String,
        channel: Arc<dyn DataChannel>,
    ) {
        let mut states = channel.state();
        let mut opened = false;
        loop {
            let state = *states.borrow_and_update();
            match state {
                DataChannelState::Open if !opened => {
                    opened = true;
                    self.mark_connected(generation, &session_id);
                }
                DataChannelState::Closed => {
                    let message = if opened {
                        "data channel closed"
                    } else {
                        "data channel closed before opening"
                    };
                    self.fail(
                        generation,
                        WebRtcError::DataChannel {
                            message: message.into(),
                            channel: Some(channel.label().to_owned()),
                        },
                    );
                    return;
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    }

    fn mark_connected(&self, generation: u64, session_id: &str) {
        if !self.is_current(generation) {
            return;
        }
        let Some(remote_id) = self.session.lock().remote_id.clone() else {
            return;
        };
        let promoted = self.state_tx.send_if_modified(|state| match state {
            WebRtcConnectionState::NegotiatingPeerConnection { .. }
            | WebRtcConnectionState::GatheringIceCandidates { .. } => {
                *state = WebRtcConnectionState::Connected {
                    session_id: session_id.to_owned(),
                    remote_id,
                };
                true
            }
            _ => false,
        });
        if promoted {
            tracing::info!(target: "ma::webrtc", %session_id, "webrtc connection established");
            if let Some(deadline) = self.session.lock().deadline.take() {
                deadline.abort();
            }
        }
    }

    async fn on_answer(
        self: &Arc<Self>,
        generation: u64,
        session_id: &str,
        answer: SessionDescription,
    ) -> Flow {
        let peer = self.session.lock().peer.clone();
        let Some(peer) = peer else {
            tracing::warn!(target: "ma::webrtc", "answer without a peer connection; ignoring");
            return Flow::Continue;
        };
        if self.is_foreign_session(session_id) {
            tracing::warn!(target: "ma::webrtc", %session_id, "answer for another session; ignoring");
            return Flow::Continue;
        }
        tracing::info!(target: "ma::webrtc", %session_id, "applying remote answer");
        match peer.set_remote_answer(&answer).await {
            Ok(()) => Flow::Continue,
            Err(err) => self.fail(generation, peer_failure("apply remote answer", err)),
        }
    }

    async fn on_remote_candidate(&self, session_id: &str, candidate: IceCandidateData) -> Flow {
        let peer = self.session.lock().peer.clone();
        let Some(peer) = peer else {
            tracing::debug!(target: "ma::webrtc", "ice candidate without a peer connection; ignoring");
            return Flow::Continue;
        };
        if self.is_foreign_session(session_id) {
            tracing::debug!(target: "ma::webrtc", %session_id, "ice candidate for another session; ignoring");
            return Flow::Continue;
        }
        if let Err(err) = peer.add_ice_candidate(&candidate).await {
            tracing::warn!(
                target: "ma::webrtc",
                error = %err,
                candidate_type = candidate.candidate_type().as_str(),
                "failed to add remote ice candidate"
            );
        }
        Flow::Continue
    }

    fn on_remote_error(self: &Arc<Self>, generation: u64, error: String) -> Flow {
        tracing::error!(target: "ma::webrtc", %error, "signaling server reported an error");
        let remote_id = self.session.lock().remote_id.clone();
        let failure = match (self.current_state(), remote_id) {
            (WebRtcConnectionState::ConnectingToSignaling, Some(remote_id))
                if error.to_ascii_lowercase().contains("not found") =>
            {
                WebRtcError::RemoteIdNotFound(remote_id)
            }
            _ => WebRtcError::Signaling(error),
        };
        self.fail(generation, failure)
    }

    async fn handle_peer_event(&self, event: PeerEvent) -> Flow {
        match event {
            PeerEvent::IceCandidate(candidate) => self.forward_local_candidate(candidate).await,
            PeerEvent::DataChannel(channel) => {
                tracing::info!(
                    target: "ma::webrtc",
                    label = channel.label(),
                    "remote peer opened a data channel"
                );
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(target: "ma::webrtc", ?state, "peer connection state");
            }
        }
        Flow::Continue
    }

    async fn forward_local_candidate(&self, candidate: IceCandidateData) {
        let (remote_id, session_id) = {
            let session = self.session.lock();
            (session.remote_id.clone(), session.session_id.clone())
        };
        let Some(session_id) = session_id else {
            tracing::debug!(target: "ma::webrtc", "local ice candidate without a session; dropping");
            return;
        };
        tracing::debug!(
            target: "ma::webrtc",
            candidate_type = candidate.candidate_type().as_str(),
            "forwarding local ice candidate"
        );
        let message = SignalingMessage::IceCandidate {
            remote_id: remote_id.map(RemoteId::into_string),
            session_id,
            data: candidate,
        };
        if let Err(err) = self.signaling.send_message(&message).await {
            tracing::warn!(target: "ma::webrtc", error = %err, "failed to forward local ice candidate");
        }
    }

    fn handle_signaling_state(self: &Arc<Self>, generation: u64, state: SignalingState) -> Flow {
        let reason = match state {
            SignalingState::Disconnected => "connection closed".to_owned(),
            SignalingState::Error(err) => err,
            SignalingState::Connecting | SignalingState::Connected => return Flow::Continue,
        };
        if self.current_state().is_negotiating() {
            self.fail(
                generation,
                WebRtcError::Signaling(format!("signaling connection lost: {reason}")),
            )
        } else {
            tracing::info!(
                target: "ma::webrtc",
                %reason,
                "signaling connection closed; peer connection unaffected"
            );
            Flow::Continue
        }
    }

    async fn negotiation_deadline(self: Arc<Self>, generation: u64, limit: Duration) {
        tokio::time::sleep(limit).await;
        if self.is_current(generation) && self.current_state().is_negotiating() {
            tracing::warn!(
                target: "ma::webrtc",
                timeout_ms = limit.as_millis() as u64,
                "negotiation timed out"
            );
            self.fail(
                generation,
                WebRtcError::Connection("negotiation timed out".into()),
            );
        }
    }

    fn is_foreign_session(&self, session_id: &str) -> bool {
        let session = self.session.lock();
        matches!(
            session.session_id.as_deref(),
            Some(current) if !current.is_empty() && !session_id.is_empty() && current != session_id
        )
    }

    /// Moves a live attempt to `Error` and schedules its teardown. Stale
    /// generations and already-settled states are left alone.
    fn fail(self: &Arc<Self>, generation: u64, error: WebRtcError) -> Flow {
        if !self.is_current(generation) {
            return Flow::Stop;
        }
        let message = error.to_string();
        let applied = self.state_tx.send_if_modified(|state| {
            if state.is_negotiating() || state.is_connected() {
                *state = WebRtcConnectionState::Error(error);
                true
            } else {
                false
            }
        });
        if !applied {
            return Flow::Stop;
        }
        tracing::error!(target: "ma::webrtc", error = %message, "webrtc connection failed");
        let inner = self.clone();
        tokio::spawn(async move {
            let _guard = inner.op_lock.lock().await;
            if inner.is_current(generation)
                && matches!(inner.current_state(), WebRtcConnectionState::Error(_))
            {
                inner.teardown().await;
            }
        });
        Flow::Stop
    }

    /// Cleanup order: listener, channel watcher, channel, peer, signaling,
    /// then the session identifiers.
    async fn teardown(&self) {
        let Session {
            peer,
            channel,
            listener,
            channel_watcher,
            deadline,
            ..
        } = std::mem::take(&mut *self.session.lock());
        for task in [listener, channel_watcher, deadline].into_iter().flatten() {
            task.abort();
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.signaling.disconnect().await;
    }
}

fn peer_failure(stage: &str, err: impl Display) -> WebRtcError {
    WebRtcError::PeerConnection(format!("failed to {stage}: {err}"))
}
