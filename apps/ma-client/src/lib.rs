pub mod config;
pub mod direct;
pub mod model;
pub mod service;
pub mod settings;
pub mod state;
pub mod telemetry;

pub use config::{ClientConfig, ReconnectPolicy};
pub use model::{Answer, Event, Request, ServerInfo, User};
pub use service::{ServiceClient, SessionError};
pub use settings::{ConnectionInfo, ConnectionMode, Settings, SettingsError, SettingsStore};
pub use state::{AuthProcessState, DisconnectReason, SessionDetails, SessionState, Transport};
