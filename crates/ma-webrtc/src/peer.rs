//! Engine-neutral contracts for peer connections and data channels.
//!
//! The manager only talks to these traits; [`crate::engine`] binds them to the
//! `webrtc` crate and [`crate::testing`] provides an in-memory double.

use crate::signaling::{IceCandidateData, IceServer, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

/// Label of the channel that carries the Music Assistant JSON API.
pub const API_CHANNEL_LABEL: &str = "ma-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl DataChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            DataChannelState::Connecting => "connecting",
            DataChannelState::Open => "open",
            DataChannelState::Closing => "closing",
            DataChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection is not initialized")]
    NotInitialized,
    #[error("peer connection is already initialized")]
    AlreadyInitialized,
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("webrtc engine error: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("no data channel")]
    NoChannel,
    #[error("data channel send failed: {0}")]
    Send(String),
}

pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Observable lifecycle. Only ever moves forward.
    fn state(&self) -> watch::Receiver<DataChannelState>;

    fn current_state(&self) -> DataChannelState {
        *self.state().borrow()
    }

    /// Sends one text message. When the channel is not open the message is
    /// dropped with a warning and `Ok` is returned.
    async fn send(&self, message: &str) -> Result<(), ChannelError>;

    /// Installs the inbound text handler, replacing any previous one.
    /// Messages that arrived before the first handler are replayed to it.
    fn on_message(&self, handler: MessageHandler);

    /// Idempotent; the underlying channel is released exactly once.
    async fn close(&self);
}

pub enum PeerEvent {
    IceCandidate(IceCandidateData),
    DataChannel(Arc<dyn DataChannel>),
    ConnectionState(PeerConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn initialize(&self, ice_servers: &[IceServer]) -> Result<(), PeerError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<(), PeerError>;

    /// Candidates that arrive before the remote answer are buffered and
    /// applied once it is set.
    async fn add_ice_candidate(&self, candidate: &IceCandidateData) -> Result<(), PeerError>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError>;

    /// Idempotent; safe before `initialize`.
    async fn close(&self);
}

/// Produces peer connections wired to an event sink. One factory serves many
/// sessions.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, events: PeerEventSender) -> Arc<dyn PeerConnection>;
}

struct Delivery {
    handler: Option<MessageHandler>,
    backlog: VecDeque<String>,
}

/// State, delivery and close bookkeeping shared by every [`DataChannel`]
/// implementation in this crate.
pub(crate) struct ChannelCore {
    label: String,
    state: watch::Sender<DataChannelState>,
    delivery: Mutex<Delivery>,
    closed: AtomicBool,
}

impl ChannelCore {
    pub(crate) fn new(label: impl Into<String>, initial: DataChannelState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            label: label.into(),
            state,
            delivery: Mutex::new(Delivery {
                handler: None,
                backlog: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DataChannelState> {
        self.state.subscribe()
    }

    pub(crate) fn current(&self) -> DataChannelState {
        *self.state.borrow()
    }

    /// Moves the lifecycle forward; backward or repeated transitions are
    /// ignored. Returns whether the state changed.
    pub(crate) fn advance(&self, next: DataChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn deliver(&self, text: String) {
        let mut delivery = self.delivery.lock();
        match &delivery.handler {
            Some(handler) => handler(text),
            None => delivery.backlog.push_back(text),
        }
    }

    pub(crate) fn set_handler(&self, handler: MessageHandler) {
        let mut delivery = self.delivery.lock();
        while let Some(text) = delivery.backlog.pop_front() {
            handler(text);
        }
        delivery.handler = Some(handler);
    }

    /// True for the first caller only.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}
