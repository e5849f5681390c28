use crate::remote_id::RemoteId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRtcConnectionState {
    Idle,
    ConnectingToSignaling,
    NegotiatingPeerConnection { session_id: String },
    GatheringIceCandidates { session_id: String },
    Connected { session_id: String, remote_id: RemoteId },
    Error(WebRtcError),
    Disconnecting,
}

impl WebRtcConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// True while a connection attempt is in flight and not yet usable.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            Self::ConnectingToSignaling
                | Self::NegotiatingPeerConnection { .. }
                | Self::GatheringIceCandidates { .. }
        )
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::NegotiatingPeerConnection { session_id }
            | Self::GatheringIceCandidates { session_id }
            | Self::Connected { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&WebRtcError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebRtcError {
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("remote id {} not found", .0.full_formatted())]
    RemoteIdNotFound(RemoteId),
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("data channel {} error: {message}", .channel.as_deref().unwrap_or("?"))]
    DataChannel {
        message: String,
        channel: Option<String>,
    },
    #[error("connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_exposed_while_negotiating_and_connected() {
        let remote_id = RemoteId::new("ABCD1234").unwrap();
        assert_eq!(WebRtcConnectionState::Idle.session_id(), None);
        assert_eq!(
            WebRtcConnectionState::GatheringIceCandidates {
                session_id: "s".into()
            }
            .session_id(),
            Some("s")
        );
        let connected = WebRtcConnectionState::Connected {
            session_id: "s".into(),
            remote_id,
        };
        assert!(connected.is_connected());
        assert!(!connected.is_negotiating());
        assert!(WebRtcConnectionState::ConnectingToSignaling.is_negotiating());
    }

    #[test]
    fn error_messages_read_naturally() {
        let err = WebRtcError::RemoteIdNotFound(RemoteId::new("ABCD1234").unwrap());
        assert_eq!(err.to_string(), "remote id MA-ABCD-1234 not found");
        let err = WebRtcError::DataChannel {
            message: "closed".into(),
            channel: Some("ma-api".into()),
        };
        assert_eq!(err.to_string(), "data channel ma-api error: closed");
    }
}
