//! WebRTC remote-access core for Music Assistant clients.
//!
//! A [`WebRtcConnectionManager`] drives one connection attempt at a time:
//! it talks to the signaling server through a [`SignalingClient`], negotiates
//! a peer connection through a [`PeerConnectionFactory`] and exposes the
//! `ma-api` data channel as a stream of text messages.

pub mod engine;
pub mod manager;
pub mod peer;
pub mod remote_id;
pub mod signaling;
pub mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use engine::WebRtcEngine;
pub use manager::{ManagerConfig, WebRtcConnectionManager};
pub use peer::{
    API_CHANNEL_LABEL, ChannelError, DataChannel, DataChannelState, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
};
pub use remote_id::{InvalidRemoteId, RemoteId};
pub use signaling::{
    DEFAULT_SIGNALING_URL, IceCandidateData, IceServer, SessionDescription, SignalingClient,
    SignalingError, SignalingMessage, SignalingState,
};
pub use state::{WebRtcConnectionState, WebRtcError};
