use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SDP_OFFER: &str = "offer";
pub const SDP_ANSWER: &str = "answer";

/// Discriminators accepted on the wire, aliases included. Anything else
/// decodes to [`SignalingMessage::Unknown`].
const KNOWN_KINDS: &[&str] = &[
    "connect",
    "connect-request",
    "connected",
    "session-ready",
    "offer",
    "answer",
    "ice-candidate",
    "error",
    "peer-disconnected",
    "client-disconnected",
    "registered",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SDP_OFFER.to_owned(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SDP_ANSWER.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateData {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidateData {
    /// Candidate type parsed from the `typ` attribute of the candidate line.
    pub fn candidate_type(&self) -> IceCandidateType {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return tokens
                    .next()
                    .map(IceCandidateType::from_token)
                    .unwrap_or(IceCandidateType::Unknown);
            }
        }
        IceCandidateType::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceCandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl IceCandidateType {
    fn from_token(token: &str) -> Self {
        match token {
            "host" => Self::Host,
            "srflx" => Self::ServerReflexive,
            "prflx" => Self::PeerReflexive,
            "relay" => Self::Relay,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
            Self::Unknown => "unknown",
        }
    }
}

/// Messages exchanged with the signaling server. The JSON discriminator lives
/// in the `type` field and payload fields are camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "connect-request", alias = "connect", rename_all = "camelCase")]
    ConnectRequest { remote_id: String },
    #[serde(rename = "connected", alias = "session-ready", rename_all = "camelCase")]
    Connected {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
        #[serde(default)]
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        #[serde(default)]
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
        #[serde(default)]
        session_id: String,
        data: IceCandidateData,
    },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(
        rename = "peer-disconnected",
        alias = "client-disconnected",
        rename_all = "camelCase"
    )]
    PeerDisconnected {
        #[serde(default)]
        session_id: String,
    },
    #[serde(rename = "registered", rename_all = "camelCase")]
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
    },
    /// A well-formed frame whose `type` this client does not understand.
    #[serde(skip)]
    Unknown { kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed signaling frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signaling frame has no string `type` field")]
    MissingType,
}

impl SignalingMessage {
    /// Decodes one text frame. Unrecognized discriminators are not an error;
    /// they come back as [`SignalingMessage::Unknown`].
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        if !KNOWN_KINDS.contains(&kind) {
            return Ok(Self::Unknown {
                kind: kind.to_owned(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::ConnectRequest { .. } => "connect-request",
            Self::Connected { .. } => "connected",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Error { .. } => "error",
            Self::PeerDisconnected { .. } => "peer-disconnected",
            Self::Registered { .. } => "registered",
            Self::Unknown { kind } => kind,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Connected { session_id, .. }
            | Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::PeerDisconnected { session_id } => Some(session_id.as_str()),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::ConnectRequest { .. } | Self::Registered { .. } | Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(message: &SignalingMessage) -> Value {
        serde_json::from_str(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn connect_request_wire_shape() {
        let message = SignalingMessage::ConnectRequest {
            remote_id: "VVPN3TLP".into(),
        };
        assert_eq!(
            to_value(&message),
            json!({"type": "connect-request", "remoteId": "VVPN3TLP"})
        );
    }

    #[test]
    fn offer_carries_remote_id_and_description() {
        let message = SignalingMessage::Offer {
            remote_id: Some("VVPN3TLP".into()),
            session_id: "s-1".into(),
            data: SessionDescription::offer("v=0"),
        };
        assert_eq!(
            to_value(&message),
            json!({
                "type": "offer",
                "remoteId": "VVPN3TLP",
                "sessionId": "s-1",
                "data": {"sdp": "v=0", "type": "offer"}
            })
        );
    }

    #[test]
    fn ice_candidate_uses_sdp_m_line_index_spelling() {
        let message = SignalingMessage::IceCandidate {
            remote_id: None,
            session_id: "s-1".into(),
            data: IceCandidateData {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        };
        let value = to_value(&message);
        assert_eq!(value["data"]["sdpMLineIndex"], json!(0));
        assert_eq!(value["data"]["sdpMid"], json!("0"));
        assert!(value.get("remoteId").is_none());
    }

    #[test]
    fn large_m_line_index_still_decodes() {
        let text = r#"{"type":"ice-candidate","sessionId":"s-1","data":{
            "candidate":"candidate:7 1 udp 1 203.0.113.4 9 typ relay","sdpMid":"0","sdpMLineIndex":70000}}"#;
        match SignalingMessage::decode(text).unwrap() {
            SignalingMessage::IceCandidate { data, .. } => {
                assert_eq!(data.sdp_m_line_index, Some(70000));
                assert_eq!(data.candidate_type(), IceCandidateType::Relay);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_session_ready_alias_with_ice_servers() {
        let text = r#"{"type":"session-ready","sessionId":"abc","iceServers":[
            {"urls":["stun:stun.l.google.com:19302"]},
            {"urls":["turn:turn.example.org"],"username":"u","credential":"p"}]}"#;
        let message = SignalingMessage::decode(text).unwrap();
        assert_eq!(
            message,
            SignalingMessage::Connected {
                session_id: "abc".into(),
                ice_servers: vec![
                    IceServer::new("stun:stun.l.google.com:19302"),
                    IceServer::new("turn:turn.example.org").with_credentials("u", "p"),
                ],
            }
        );
    }

    #[test]
    fn decodes_connected_without_session_id() {
        let message = SignalingMessage::decode(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(
            message,
            SignalingMessage::Connected {
                session_id: String::new(),
                ice_servers: Vec::new(),
            }
        );
    }

    #[test]
    fn decodes_answer_and_error() {
        let answer = SignalingMessage::decode(
            r#"{"type":"answer","sessionId":"s","data":{"sdp":"v=0 answer","type":"answer"}}"#,
        )
        .unwrap();
        assert_eq!(
            answer,
            SignalingMessage::Answer {
                session_id: "s".into(),
                data: SessionDescription::answer("v=0 answer"),
            }
        );

        let error = SignalingMessage::decode(r#"{"type":"error","error":"Remote not found"}"#)
            .unwrap();
        assert_eq!(
            error,
            SignalingMessage::Error {
                error: "Remote not found".into(),
                session_id: None,
            }
        );
    }

    #[test]
    fn client_disconnected_alias() {
        let message =
            SignalingMessage::decode(r#"{"type":"client-disconnected","sessionId":"s"}"#).unwrap();
        assert_eq!(
            message,
            SignalingMessage::PeerDisconnected {
                session_id: "s".into()
            }
        );
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let message = SignalingMessage::decode(r#"{"type":"ping","ts":1}"#).unwrap();
        assert_eq!(
            message,
            SignalingMessage::Unknown {
                kind: "ping".into()
            }
        );
        assert!(message.encode().is_err());
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(matches!(
            SignalingMessage::decode("not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            SignalingMessage::decode(r#"{"sessionId":"s"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            SignalingMessage::decode(r#"{"type":"answer"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn candidate_type_from_line() {
        let candidate = |line: &str| IceCandidateData {
            candidate: line.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert_eq!(
            candidate("candidate:1 1 udp 1 10.0.0.1 5000 typ host").candidate_type(),
            IceCandidateType::Host
        );
        assert_eq!(
            candidate("candidate:2 1 udp 1 1.2.3.4 5000 typ srflx raddr 0.0.0.0 rport 0")
                .candidate_type(),
            IceCandidateType::ServerReflexive
        );
        assert_eq!(
            candidate("candidate:3 1 udp 1 1.2.3.4 5000 typ relay").candidate_type(),
            IceCandidateType::Relay
        );
        assert_eq!(candidate("garbage").candidate_type(), IceCandidateType::Unknown);
    }
}
