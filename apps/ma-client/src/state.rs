use crate::model::{ServerInfo, User};
use crate::settings::{ConnectionInfo, ConnectionMode};
use ma_webrtc::RemoteId;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Direct(ConnectionInfo),
    WebRtc(RemoteId),
}

impl Transport {
    pub fn mode(&self) -> ConnectionMode {
        match self {
            Transport::Direct(_) => ConnectionMode::Direct,
            Transport::WebRtc(_) => ConnectionMode::WebRtc,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Direct(info) => write!(f, "direct {info}"),
            Transport::WebRtc(remote_id) => write!(f, "webrtc {remote_id}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthProcessState {
    #[default]
    NotStarted,
    InProgress,
    Failed(String),
    LoggedOut,
}

/// What the session knows about the server and the signed-in user. Carried
/// unchanged from `Connected` into `Reconnecting` and back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDetails {
    pub server_info: Option<ServerInfo>,
    pub user: Option<User>,
    pub auth_process_state: AuthProcessState,
    pub was_auto_login: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Initial,
    ByUser,
    NoServerData,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected(DisconnectReason),
    Connecting,
    Connected {
        transport: Transport,
        details: SessionDetails,
    },
    Reconnecting {
        attempt: u32,
        transport: Transport,
        details: SessionDetails,
    },
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Disconnected(DisconnectReason::Initial)
    }
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, SessionState::Reconnecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, SessionState::Disconnected(_))
    }

    pub fn transport(&self) -> Option<&Transport> {
        match self {
            SessionState::Connected { transport, .. }
            | SessionState::Reconnecting { transport, .. } => Some(transport),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&SessionDetails> {
        match self {
            SessionState::Connected { details, .. }
            | SessionState::Reconnecting { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Applies `change` to the details of a `Connected` state. Returns false,
    /// leaving the state untouched, for every other variant.
    pub fn update_connected(&mut self, change: impl FnOnce(&mut SessionDetails)) -> bool {
        match self {
            SessionState::Connected { details, .. } => {
                let before = details.clone();
                change(details);
                *details != before
            }
            _ => false,
        }
    }
}
