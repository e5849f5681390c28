//! Music Assistant server API frames: commands sent by the client, answers
//! correlated by `message_id`, server-info pushes and domain events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Answer `error_code` the server uses when the session is not authenticated.
pub const ERROR_CODE_UNAUTHORIZED: i64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub message_id: String,
}

impl Request {
    pub fn new(command: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            command: command.into(),
            args,
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn auth_login(username: &str, password: &str, device_name: &str) -> Self {
        Self::new(
            "auth/login",
            Some(json!({
                "username": username,
                "password": password,
                "device_name": device_name,
            })),
        )
    }

    pub fn auth_authorize(token: &str, device_name: &str) -> Self {
        Self::new(
            "auth",
            Some(json!({
                "token": token,
                "device_name": device_name,
            })),
        )
    }

    pub fn auth_logout() -> Self {
        Self::new("auth/logout", None)
    }
}

/// Raw answer object. Kept as a map because the payload shape depends on the
/// command that was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    json: Map<String, Value>,
}

impl Answer {
    pub fn new(json: Map<String, Value>) -> Self {
        Self { json }
    }

    pub fn json(&self) -> &Map<String, Value> {
        &self.json
    }

    pub fn message_id(&self) -> Option<&str> {
        self.json.get("message_id").and_then(Value::as_str)
    }

    pub fn result(&self) -> Option<&Value> {
        self.json.get("result")
    }

    pub fn error_code(&self) -> Option<i64> {
        self.json.get("error_code").and_then(Value::as_i64)
    }

    pub fn is_error(&self) -> bool {
        self.json.contains_key("error_code")
    }

    /// Human readable error text, from `error` or the server's `details`.
    pub fn error(&self) -> Option<&str> {
        self.json
            .get("error")
            .or_else(|| self.json.get("details"))
            .and_then(Value::as_str)
    }

    pub fn result_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.result()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub min_supported_schema_version: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub homeassistant_addon: bool,
    #[serde(default)]
    pub onboard_done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationResponse {
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug)]
pub enum Inbound {
    Answer(Answer),
    ServerInfo(ServerInfo),
    Event(Event),
    Unrecognized(Map<String, Value>),
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object")]
    NotAnObject,
}

/// Classifies one inbound frame by its top-level keys, in priority order
/// `message_id`, `server_id`, `event`.
pub fn classify(text: &str) -> Result<Inbound, InboundError> {
    let Value::Object(object) = serde_json::from_str::<Value>(text)? else {
        return Err(InboundError::NotAnObject);
    };
    if object.contains_key("message_id") {
        return Ok(Inbound::Answer(Answer::new(object)));
    }
    if object.contains_key("server_id") {
        let info = serde_json::from_value(Value::Object(object))?;
        return Ok(Inbound::ServerInfo(info));
    }
    if object.contains_key("event") {
        let event = serde_json::from_value(Value::Object(object))?;
        return Ok(Inbound::Event(event));
    }
    Ok(Inbound::Unrecognized(object))
}
