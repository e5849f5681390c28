//! Persisted connection settings, stored as TOML under `~/.ma-client/`.

use directories::BaseDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unable to determine home directory")]
    NoHomeDir,
    #[error("settings io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub is_tls: bool,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16, is_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            is_tls,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_tls { "wss" } else { "ws" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Direct,
    WebRtc,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Direct => "direct",
            ConnectionMode::WebRtc => "webrtc",
        }
    }
}

/// On-disk shape. `last_connection_mode` stays a string so unknown values
/// survive a round trip and can be reported instead of failing the load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_mode: Option<String>,
    #[serde(default)]
    pub webrtc_remote_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    // Tables must follow plain keys in TOML output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
}

/// Settings shared by the session layer. Every mutation is written through
/// to disk when the store is file-backed; write failures are logged and the
/// in-memory copy stays authoritative.
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: Mutex<Settings>,
}

impl SettingsStore {
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let base = BaseDirs::new().ok_or(SettingsError::NoHomeDir)?;
        Ok(base.home_dir().join(".ma-client").join("settings.toml"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = load(&path)?;
        Ok(Self {
            path: Some(path),
            current: Mutex::new(settings),
        })
    }

    pub fn open_default() -> Result<Self, SettingsError> {
        Self::open(Self::default_path()?)
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Settings {
        self.current.lock().clone()
    }

    pub fn update(&self, change: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut current = self.current.lock();
            let before = current.clone();
            change(&mut current);
            if *current == before {
                return;
            }
            current.clone()
        };
        if let Some(path) = &self.path {
            if let Err(err) = save(path, &snapshot) {
                tracing::warn!(
                    target: "ma::settings",
                    path = %path.display(),
                    error = %err,
                    "failed to persist settings"
                );
            }
        }
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.current.lock().connection_info.clone()
    }

    pub fn set_connection_info(&self, info: ConnectionInfo) {
        self.update(|settings| settings.connection_info = Some(info));
    }

    pub fn last_connection_mode(&self) -> Option<String> {
        self.current.lock().last_connection_mode.clone()
    }

    pub fn set_last_connection_mode(&self, mode: ConnectionMode) {
        self.update(|settings| settings.last_connection_mode = Some(mode.as_str().to_string()));
    }

    pub fn webrtc_remote_id(&self) -> String {
        self.current.lock().webrtc_remote_id.clone()
    }

    pub fn set_webrtc_remote_id(&self, remote_id: &str) {
        self.update(|settings| settings.webrtc_remote_id = remote_id.to_string());
    }

    pub fn token(&self) -> Option<String> {
        self.current.lock().token.clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        self.update(|settings| settings.token = token);
    }

    pub fn device_name(&self) -> Option<String> {
        self.current.lock().device_name.clone()
    }
}

fn load(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&raw)?)
}

fn save(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let serialized = toml::to_string_pretty(settings)?;
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    // The file holds the auth token.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(serialized.as_bytes()).map_err(io_err)?;
    Ok(())
}
