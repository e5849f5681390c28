//! [`PeerConnectionFactory`] backed by the `webrtc` crate.

use crate::peer::{
    ChannelCore, ChannelError, DataChannel, DataChannelState, MessageHandler, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, PeerEventSender,
};
use crate::signaling::message::SDP_ANSWER;
use crate::signaling::{IceCandidateData, IceServer, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Creates [`RtcPeer`]s. ICE servers handed out by the signaling server win;
/// the fallback list is used only when the server sends none.
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngine {
    fallback_ice_servers: Vec<IceServer>,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.fallback_ice_servers = servers;
        self
    }
}

impl PeerConnectionFactory for WebRtcEngine {
    fn create(&self, events: PeerEventSender) -> Arc<dyn PeerConnection> {
        Arc::new(RtcPeer {
            events,
            fallback_ice_servers: self.fallback_ice_servers.clone(),
            connection: Mutex::new(None),
            remote: AsyncMutex::new(RemoteSide::default()),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct RemoteSide {
    answered: bool,
    pending: Vec<RTCIceCandidateInit>,
}

pub struct RtcPeer {
    events: PeerEventSender,
    fallback_ice_servers: Vec<IceServer>,
    connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    remote: AsyncMutex<RemoteSide>,
    closed: AtomicBool,
}

impl RtcPeer {
    fn connection(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        self.connection
            .lock()
            .clone()
            .ok_or(PeerError::NotInitialized)
    }

    fn wire_callbacks(&self, pc: &RTCPeerConnection) {
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target: "ma::engine", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidateData {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index.map(u32::from),
                        }));
                    }
                    Err(err) => tracing::warn!(
                        target: "ma::engine",
                        error = %err,
                        "failed to serialize local ice candidate"
                    ),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events.clone();
            Box::pin(async move {
                let channel: Arc<dyn DataChannel> = RtcDataChannel::attach(channel);
                let _ = events.send(PeerEvent::DataChannel(channel));
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(target: "ma::engine", ?state, "peer connection state changed");
            if let Some(state) = map_peer_state(state) {
                let _ = events.send(PeerEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn initialize(&self, ice_servers: &[IceServer]) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        if self.connection.lock().is_some() {
            return Err(PeerError::AlreadyInitialized);
        }
        let servers = if ice_servers.is_empty() {
            &self.fallback_ice_servers
        } else {
            ice_servers
        };
        let config = RTCConfiguration {
            ice_servers: servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(engine_error)?);
        self.wire_callbacks(&pc);

        let mut slot = self.connection.lock();
        if slot.is_some() {
            return Err(PeerError::AlreadyInitialized);
        }
        *slot = Some(pc);
        tracing::debug!(
            target: "ma::engine",
            ice_servers = servers.len(),
            "peer connection initialized"
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let pc = self.connection()?;
        let offer = pc.create_offer(None).await.map_err(engine_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(engine_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<(), PeerError> {
        let pc = self.connection()?;
        if answer.kind != SDP_ANSWER {
            return Err(PeerError::InvalidDescription(format!(
                "expected an answer, got {:?}",
                answer.kind
            )));
        }
        let description = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;

        let mut remote = self.remote.lock().await;
        pc.set_remote_description(description)
            .await
            .map_err(engine_error)?;
        remote.answered = true;
        let pending = std::mem::take(&mut remote.pending);
        let buffered = pending.len();
        for candidate in pending {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target: "ma::engine",
                    error = %err,
                    "failed to apply buffered ice candidate"
                );
            }
        }
        tracing::debug!(target: "ma::engine", buffered, "remote answer applied");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateData) -> Result<(), PeerError> {
        let pc = self.connection()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            // The engine takes a u16; an index past that leaves matching to sdpMid.
            sdp_mline_index: candidate
                .sdp_m_line_index
                .and_then(|index| u16::try_from(index).ok()),
            username_fragment: None,
        };
        let mut remote = self.remote.lock().await;
        if !remote.answered {
            remote.pending.push(init);
            tracing::trace!(target: "ma::engine", "buffering ice candidate until answer");
            return Ok(());
        }
        pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let pc = self.connection()?;
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(engine_error)?;
        Ok(RtcDataChannel::attach(channel))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = self.connection.lock().take();
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                tracing::debug!(target: "ma::engine", error = %err, "peer connection close failed");
            }
        }
    }
}

pub struct RtcDataChannel {
    core: ChannelCore,
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn attach(channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let wrapped = Arc::new(Self {
            core: ChannelCore::new(channel.label(), map_channel_state(channel.ready_state())),
            inner: channel.clone(),
        });

        let weak = Arc::downgrade(&wrapped);
        channel.on_open(Box::new(move || {
            advance(&weak, DataChannelState::Open);
            Box::pin(async {})
        }));
        let weak = Arc::downgrade(&wrapped);
        channel.on_close(Box::new(move || {
            advance(&weak, DataChannelState::Closed);
            Box::pin(async {})
        }));
        let label = wrapped.core.label().to_owned();
        channel.on_error(Box::new(move |err| {
            tracing::warn!(target: "ma::engine", label = %label, error = %err, "data channel error");
            Box::pin(async {})
        }));
        let weak = Arc::downgrade(&wrapped);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            if let Some(channel) = weak.upgrade() {
                if !message.is_string {
                    tracing::debug!(
                        target: "ma::engine",
                        label = channel.core.label(),
                        "binary data channel message treated as text"
                    );
                }
                channel
                    .core
                    .deliver(String::from_utf8_lossy(&message.data).into_owned());
            }
            Box::pin(async {})
        }));

        // The channel may have opened before the handlers were installed.
        wrapped
            .core
            .advance(map_channel_state(channel.ready_state()));
        wrapped
    }
}

fn advance(channel: &Weak<RtcDataChannel>, state: DataChannelState) {
    if let Some(channel) = channel.upgrade() {
        if channel.core.advance(state) {
            tracing::debug!(
                target: "ma::engine",
                label = channel.core.label(),
                %state,
                "data channel state changed"
            );
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn state(&self) -> watch::Receiver<DataChannelState> {
        self.core.subscribe()
    }

    async fn send(&self, message: &str) -> Result<(), ChannelError> {
        let state = self.core.current();
        if state != DataChannelState::Open {
            tracing::warn!(
                target: "ma::engine",
                label = self.core.label(),
                %state,
                "data channel not open; dropping message"
            );
            return Ok(());
        }
        self.inner
            .send_text(message.to_owned())
            .await
            .map(|_| ())
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_handler(handler);
    }

    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }
        self.core.advance(DataChannelState::Closing);
        if let Err(err) = self.inner.close().await {
            tracing::debug!(
                target: "ma::engine",
                label = self.core.label(),
                error = %err,
                "data channel close failed"
            );
        }
        self.core.advance(DataChannelState::Closed);
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(engine_error)?;
    let registry =
        register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
            DataChannelState::Connecting
        }
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn engine_error(err: webrtc::Error) -> PeerError {
    PeerError::Engine(err.to_string())
}
