mod client;
pub mod message;

pub use client::{DEFAULT_SIGNALING_URL, SignalingClient, SignalingError, SignalingState};
pub use message::{
    DecodeError, IceCandidateData, IceCandidateType, IceServer, SessionDescription,
    SignalingMessage,
};
