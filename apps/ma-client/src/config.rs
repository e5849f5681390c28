use ma_webrtc::DEFAULT_SIGNALING_URL;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DEVICE_NAME: &str = "ma-client";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    /// `None` resolves to `~/.ma-client/settings.toml`.
    pub settings_path: Option<PathBuf>,
    pub request_timeout: Duration,
    /// `None` lets WebRTC negotiation run without a deadline.
    pub negotiation_timeout: Option<Duration>,
    pub device_name: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Load configuration from `MA_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let negotiation_timeout = match millis("MA_NEGOTIATION_TIMEOUT_MS") {
            Some(limit) if limit.is_zero() => None,
            Some(limit) => Some(limit),
            None => defaults.negotiation_timeout,
        };
        let mut reconnect = defaults.reconnect;
        if let Some(attempts) = lookup("MA_RECONNECT_MAX_ATTEMPTS")
            .and_then(|raw| raw.trim().parse::<u32>().ok())
        {
            reconnect.max_attempts = attempts;
        }

        Self {
            signaling_url: lookup("MA_SIGNALING_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.signaling_url),
            settings_path: lookup("MA_SETTINGS_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            request_timeout: millis("MA_REQUEST_TIMEOUT_MS")
                .filter(|limit| !limit.is_zero())
                .unwrap_or(defaults.request_timeout),
            negotiation_timeout,
            device_name: lookup("MA_DEVICE_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.device_name),
            reconnect,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            settings_path: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Backoff for automatic reconnection after an unexpected transport loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delays before the first attempts, in order.
    pub schedule: Vec<Duration>,
    /// Delay for every attempt past the end of `schedule`.
    pub steady_delay: Duration,
    pub max_attempts: u32,
    /// Time a direct attempt gets before its outcome is checked.
    pub grace: Duration,
    /// Same for WebRTC attempts, which need a full signaling round trip.
    pub webrtc_grace: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.schedule
            .get(attempt as usize)
            .copied()
            .unwrap_or(self.steady_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            schedule: [500, 1000, 2000, 3000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            steady_delay: Duration::from_millis(5000),
            max_attempts: 10,
            grace: Duration::from_millis(2000),
            webrtc_grace: Duration::from_secs(15),
        }
    }
}
