//! Session layer over one server link at a time, either a direct WebSocket
//! or a WebRTC data channel. Owns request/response correlation, the auth
//! handshake and automatic reconnection.

use crate::config::ClientConfig;
use crate::direct::DirectConnection;
use crate::model::{
    Answer, AuthorizationResponse, ERROR_CODE_UNAUTHORIZED, Event, Inbound, LoginResponse,
    Request, classify,
};
use crate::settings::{ConnectionInfo, ConnectionMode, SettingsStore};
use crate::state::{AuthProcessState, DisconnectReason, SessionDetails, SessionState, Transport};
use ma_webrtc::{
    ManagerConfig, PeerConnectionFactory, RemoteId, SignalingClient, WebRtcConnectionManager,
    WebRtcConnectionState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const EVENTS_CAPACITY: usize = 64;
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("command {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("connection lost before an answer arrived")]
    Disconnected,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
enum Link {
    Direct(Arc<DirectConnection>),
    WebRtc(Arc<WebRtcConnectionManager>),
}

impl Link {
    async fn send(&self, text: String) -> Result<(), SessionError> {
        match self {
            Link::Direct(connection) => connection
                .send(text)
                .await
                .map_err(|err| SessionError::Transport(err.to_string())),
            Link::WebRtc(manager) => {
                if !manager.current_state().is_connected() {
                    return Err(SessionError::Transport(
                        "webrtc data channel is not open".into(),
                    ));
                }
                manager
                    .try_send(&text)
                    .await
                    .map_err(|err| SessionError::Transport(err.to_string()))
            }
        }
    }

    async fn close(&self) {
        match self {
            Link::Direct(connection) => connection.close().await,
            Link::WebRtc(manager) => manager.disconnect().await,
        }
    }
}

/// The link currently backing a `Connected` session, plus the tasks that
/// pump it. `epoch` lets a task tell whether its link is still current.
struct ActiveLink {
    epoch: u64,
    link: Link,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.link.close().await;
    }
}

pub struct ServiceClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    settings: Arc<SettingsStore>,
    engine: Arc<dyn PeerConnectionFactory>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<Event>,
    pending: Mutex<HashMap<String, oneshot::Sender<Answer>>>,
    active: Mutex<Option<ActiveLink>>,
    epoch: AtomicU64,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceClient {
    pub fn new(
        config: ClientConfig,
        settings: Arc<SettingsStore>,
        engine: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                engine,
                state_tx,
                events_tx,
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
                epoch: AtomicU64::new(0),
                reconnect: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Domain events pushed by the server.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.inner.settings
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Autoconnects from persisted settings when the session has never been
    /// started. Settings that do not describe a reachable server leave the
    /// session in `Disconnected(NoServerData)`.
    pub async fn start(&self) {
        self.inner.start().await;
    }

    pub async fn connect(&self, info: ConnectionInfo) {
        self.inner.connect_direct(info).await;
    }

    pub async fn connect_webrtc(&self, remote_id: RemoteId) {
        self.inner.connect_webrtc(remote_id).await;
    }

    pub async fn send_request(&self, request: Request) -> Result<Answer, SessionError> {
        self.inner.send_request(request).await
    }

    pub async fn login(&self, username: &str, password: &str) {
        self.inner.login(username, password).await;
    }

    pub async fn authorize(&self, token: &str, is_auto_login: bool) {
        self.inner.authorize(token, is_auto_login).await;
    }

    pub fn logout(&self) {
        self.inner.logout();
    }

    pub async fn disconnect_by_user(&self) {
        if let Some(task) = self.inner.reconnect.lock().take() {
            task.abort();
        }
        self.inner.disconnect(DisconnectReason::ByUser).await;
    }

    /// Drops the link and every background task without a close handshake.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Inner {
    async fn start(self: &Arc<Self>) {
        if *self.state_tx.borrow() != SessionState::Disconnected(DisconnectReason::Initial) {
            return;
        }
        let settings = self.settings.snapshot();
        match settings.last_connection_mode.as_deref() {
            Some("webrtc") => match RemoteId::parse(&settings.webrtc_remote_id) {
                Some(remote_id) => self.connect_webrtc(remote_id).await,
                None => {
                    tracing::info!(
                        target: "ma::session",
                        "webrtc mode saved without a valid remote id"
                    );
                    self.no_server_data();
                }
            },
            Some("direct") | None => match settings.connection_info {
                Some(info) => self.connect_direct(info).await,
                None => self.no_server_data(),
            },
            Some(other) => {
                tracing::warn!(target: "ma::session", mode = other, "unknown saved connection mode");
                self.no_server_data();
            }
        }
    }

    fn no_server_data(&self) {
        self.state_tx
            .send_replace(SessionState::Disconnected(DisconnectReason::NoServerData));
    }

    /// Claims the session for a new attempt. Returns `Some(true)` when the
    /// attempt belongs to a reconnection, `Some(false)` for a fresh connect
    /// and `None` when the attempt must not run.
    fn begin_attempt(&self, mode: ConnectionMode) -> Option<bool> {
        let mut claim = None;
        self.state_tx.send_if_modified(|state| match state {
            SessionState::Disconnected(_) => {
                *state = SessionState::Connecting;
                claim = Some(false);
                true
            }
            SessionState::Reconnecting { transport, .. } => {
                if transport.mode() == mode {
                    claim = Some(true);
                } else {
                    tracing::warn!(
                        target: "ma::session",
                        requested = mode.as_str(),
                        current = transport.mode().as_str(),
                        "cannot switch transport during reconnection"
                    );
                }
                false
            }
            SessionState::Connecting | SessionState::Connected { .. } => {
                tracing::debug!(
                    target: "ma::session",
                    requested = mode.as_str(),
                    "connect ignored: session already active"
                );
                false
            }
        });
        claim
    }

    fn attempt_failed(&self, reconnecting: bool, reason: String) {
        if reconnecting {
            tracing::warn!(target: "ma::session", %reason, "reconnect attempt failed");
            return;
        }
        tracing::warn!(target: "ma::session", %reason, "connection attempt failed");
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Disconnected(DisconnectReason::Error(reason));
                true
            } else {
                false
            }
        });
    }

    /// Moves `Connecting` or `Reconnecting` to `Connected`, carrying over
    /// whatever the reconnecting state knew. Any other state means the
    /// attempt was overtaken and the link must be dropped.
    fn promote(&self, transport: Transport) -> bool {
        self.state_tx.send_if_modified(|state| {
            let details = match state {
                SessionState::Connecting => SessionDetails::default(),
                SessionState::Reconnecting { details, .. } => details.clone(),
                _ => return false,
            };
            *state = SessionState::Connected { transport, details };
            true
        })
    }

    /// Installs `link` as the active link if the session can still accept
    /// it. Returns the link's epoch.
    fn install(&self, link: Link, transport: Transport) -> Option<u64> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = {
            let mut active = self.active.lock();
            if !self.promote(transport.clone()) {
                return None;
            }
            active.replace(ActiveLink {
                epoch,
                link,
                tasks: Vec::new(),
            })
        };
        if let Some(previous) = previous {
            tokio::spawn(previous.shutdown());
        }
        self.remember(&transport);
        tracing::info!(target: "ma::session", %transport, epoch, "session connected");
        Some(epoch)
    }

    fn track(&self, epoch: u64, tasks: Vec<JoinHandle<()>>) {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(current) if current.epoch == epoch => current.tasks.extend(tasks),
            _ => tasks.iter().for_each(JoinHandle::abort),
        }
    }

    fn remember(&self, transport: &Transport) {
        match transport {
            Transport::Direct(info) => {
                self.settings.set_connection_info(info.clone());
                self.settings.set_last_connection_mode(ConnectionMode::Direct);
            }
            Transport::WebRtc(remote_id) => {
                self.settings.set_webrtc_remote_id(remote_id.as_str());
                self.settings.set_last_connection_mode(ConnectionMode::WebRtc);
            }
        }
    }

    async fn connect_direct(self: &Arc<Self>, info: ConnectionInfo) {
        let Some(reconnecting) = self.begin_attempt(ConnectionMode::Direct) else {
            return;
        };
        tracing::info!(target: "ma::session", %info, reconnecting, "connecting to server");
        let (connection, inbound) = match DirectConnection::connect(&info).await {
            Ok(opened) => opened,
            Err(err) => {
                self.attempt_failed(reconnecting, format!("Connection failed: {err}"));
                return;
            }
        };
        let connection = Arc::new(connection);
        let Some(epoch) = self.install(
            Link::Direct(connection.clone()),
            Transport::Direct(info),
        ) else {
            tracing::debug!(target: "ma::session", "direct attempt overtaken; closing socket");
            connection.close().await;
            return;
        };
        let pump = tokio::spawn(self.clone().pump_direct(epoch, inbound));
        self.track(epoch, vec![pump]);
    }

    async fn connect_webrtc(self: &Arc<Self>, remote_id: RemoteId) {
        let Some(reconnecting) = self.begin_attempt(ConnectionMode::WebRtc) else {
            return;
        };
        tracing::info!(
            target: "ma::session",
            remote_id = %remote_id.full_formatted(),
            reconnecting,
            "connecting over webrtc"
        );
        let signaling = match SignalingClient::new(&self.config.signaling_url) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                self.attempt_failed(reconnecting, format!("WebRTC connection failed: {err}"));
                return;
            }
        };
        // A fresh manager per attempt; peer connections are not restartable.
        let manager = Arc::new(WebRtcConnectionManager::with_config(
            signaling,
            self.engine.clone(),
            ManagerConfig {
                negotiation_timeout: self.config.negotiation_timeout,
            },
        ));
        let Some(incoming) = manager.take_incoming() else {
            self.attempt_failed(
                reconnecting,
                "WebRTC connection failed: incoming stream unavailable".into(),
            );
            return;
        };
        let mut manager_states = manager.state();
        let mut session_states = self.state_tx.subscribe();

        manager.connect(remote_id.clone()).await;
        let outcome = tokio::select! {
            outcome = settled(&mut manager_states) => outcome,
            _ = left_session(&mut session_states) => {
                tracing::debug!(target: "ma::session", "webrtc attempt abandoned");
                manager.disconnect().await;
                return;
            }
        };

        match outcome {
            Some(WebRtcConnectionState::Connected { .. }) => {
                let Some(epoch) = self.install(
                    Link::WebRtc(manager.clone()),
                    Transport::WebRtc(remote_id),
                ) else {
                    tracing::debug!(target: "ma::session", "webrtc attempt overtaken");
                    manager.disconnect().await;
                    return;
                };
                let pump = tokio::spawn(self.clone().pump_webrtc(incoming));
                let watcher = tokio::spawn(self.clone().watch_manager(epoch, manager_states));
                self.track(epoch, vec![pump, watcher]);
            }
            Some(WebRtcConnectionState::Error(err)) => {
                manager.disconnect().await;
                self.attempt_failed(reconnecting, format!("WebRTC connection failed: {err}"));
            }
            other => {
                manager.disconnect().await;
                self.attempt_failed(
                    reconnecting,
                    format!("WebRTC connection failed: manager stopped in {other:?}"),
                );
            }
        }
    }

    async fn pump_direct(self: Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            self.handle_incoming(&text);
        }
        self.link_lost(epoch, "server socket closed");
    }

    async fn pump_webrtc(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = incoming.recv().await {
            self.handle_incoming(&text);
        }
    }

    async fn watch_manager(
        self: Arc<Self>,
        epoch: u64,
        mut states: watch::Receiver<WebRtcConnectionState>,
    ) {
        let left = states.wait_for(|state| !state.is_connected()).await.map(|state| state.clone());
        let cause = match left {
            Ok(WebRtcConnectionState::Error(err)) => err.to_string(),
            Ok(state) => format!("webrtc link left connected state: {state:?}"),
            Err(_) => "webrtc manager dropped".to_string(),
        };
        self.link_lost(epoch, &cause);
    }

    /// Called by a link task when its link dies on its own. Stale epochs are
    /// ignored; a live `Connected` session moves to `Reconnecting`.
    fn link_lost(self: &Arc<Self>, epoch: u64, cause: &str) {
        let lost = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if current.epoch == epoch => active.take(),
                _ => None,
            }
        };
        let Some(lost) = lost else {
            return;
        };
        tokio::spawn(lost.shutdown());
        self.fail_pending();

        let mut resumed = None;
        self.state_tx.send_if_modified(|state| {
            let SessionState::Connected { transport, details } = state else {
                return false;
            };
            let transport = transport.clone();
            let details = details.clone();
            resumed = Some(transport.clone());
            *state = SessionState::Reconnecting {
                attempt: 0,
                transport,
                details,
            };
            true
        });
        let Some(transport) = resumed else {
            tracing::debug!(target: "ma::session", cause, "link closed outside a connected session");
            return;
        };
        tracing::warn!(target: "ma::session", %transport, cause, "connection lost; reconnecting");
        let task = tokio::spawn(self.clone().reconnect_loop());
        if let Some(previous) = self.reconnect.lock().replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let mut states = self.state_tx.subscribe();
        for attempt in 0..policy.max_attempts {
            let Some(transport) = self.state_tx.borrow().transport().cloned() else {
                return;
            };
            if !self.state_tx.borrow().is_reconnecting() {
                tracing::info!(target: "ma::session", "session left reconnecting; stopping");
                return;
            }
            let delay = policy.delay_for(attempt);
            tracing::info!(
                target: "ma::session",
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            if interrupted(&mut states, delay).await {
                tracing::info!(target: "ma::session", "reconnect cancelled");
                return;
            }

            // Endpoint may have been edited while we were waiting.
            let transport = match transport {
                Transport::Direct(previous) => {
                    Transport::Direct(self.settings.connection_info().unwrap_or(previous))
                }
                other => other,
            };
            let advanced = self.state_tx.send_if_modified(|state| {
                let SessionState::Reconnecting { details, .. } = state else {
                    return false;
                };
                let details = details.clone();
                *state = SessionState::Reconnecting {
                    attempt: attempt + 1,
                    transport: transport.clone(),
                    details,
                };
                true
            });
            if !advanced {
                return;
            }

            let grace = match transport {
                Transport::Direct(_) => policy.grace,
                Transport::WebRtc(_) => policy.webrtc_grace,
            };
            let started = Instant::now();
            let attempt_run = async {
                match transport {
                    Transport::Direct(info) => self.connect_direct(info).await,
                    Transport::WebRtc(remote_id) => self.connect_webrtc(remote_id).await,
                }
            };
            if tokio::time::timeout(grace, attempt_run).await.is_err() {
                tracing::warn!(target: "ma::session", ?grace, "reconnect attempt abandoned");
            }
            if self.state_tx.borrow().is_connected() {
                tracing::info!(target: "ma::session", attempt = attempt + 1, "reconnected");
                return;
            }
            if interrupted(&mut states, grace.saturating_sub(started.elapsed())).await {
                if self.state_tx.borrow().is_connected() {
                    tracing::info!(target: "ma::session", attempt = attempt + 1, "reconnected");
                }
                return;
            }
        }

        if self.state_tx.borrow().is_reconnecting() {
            tracing::error!(
                target: "ma::session",
                attempts = policy.max_attempts,
                "giving up on reconnection"
            );
            self.disconnect(DisconnectReason::Error(format!(
                "Failed to reconnect after {} attempts",
                policy.max_attempts
            )))
            .await;
        }
    }

    fn handle_incoming(&self, text: &str) {
        match classify(text) {
            Ok(Inbound::Answer(answer)) => {
                let Some(message_id) = answer.message_id().map(str::to_owned) else {
                    return;
                };
                let waiter = self.pending.lock().remove(&message_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(answer);
                    }
                    None => tracing::debug!(
                        target: "ma::session",
                        %message_id,
                        "answer for an unknown request"
                    ),
                }
            }
            Ok(Inbound::ServerInfo(info)) => {
                tracing::info!(
                    target: "ma::session",
                    server_id = %info.server_id,
                    version = info.server_version.as_deref().unwrap_or("?"),
                    "server info received"
                );
                self.state_tx
                    .send_if_modified(|state| state.update_connected(|d| d.server_info = Some(info)));
            }
            Ok(Inbound::Event(event)) => {
                tracing::trace!(target: "ma::session", event = %event.event, "server event");
                let _ = self.events_tx.send(event);
            }
            Ok(Inbound::Unrecognized(object)) => {
                let keys: Vec<&str> = object.keys().map(String::as_str).collect();
                tracing::info!(target: "ma::session", ?keys, "unrecognized server message");
            }
            Err(err) => {
                let preview: String = text.chars().take(PREVIEW_CHARS).collect();
                tracing::warn!(target: "ma::session", error = %err, %preview, "undecodable server message");
            }
        }
    }

    fn current_link(&self) -> Option<Link> {
        if !self.state_tx.borrow().is_connected() {
            return None;
        }
        self.active.lock().as_ref().map(|active| active.link.clone())
    }

    async fn send_request(&self, request: Request) -> Result<Answer, SessionError> {
        let Some(link) = self.current_link() else {
            return Err(SessionError::NotConnected);
        };
        let text = serde_json::to_string(&request)?;
        let Request {
            command,
            message_id,
            ..
        } = request;

        let (waiter, answer) = oneshot::channel();
        self.pending.lock().insert(message_id.clone(), waiter);
        tracing::debug!(target: "ma::session", %command, %message_id, "sending command");
        if let Err(err) = link.send(text).await {
            self.pending.lock().remove(&message_id);
            tracing::error!(target: "ma::session", %command, error = %err, "command send failed");
            self.disconnect(DisconnectReason::Error(format!("Error sending command: {err}")))
                .await;
            return Err(err);
        }

        let timeout = self.config.request_timeout;
        let answer = match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(SessionError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&message_id);
                return Err(SessionError::Timeout { command, timeout });
            }
        };
        if answer.is_error() {
            tracing::error!(
                target: "ma::session",
                %command,
                error_code = ?answer.error_code(),
                error = answer.error().unwrap_or(""),
                "command failed"
            );
            if answer.error_code() == Some(ERROR_CODE_UNAUTHORIZED) {
                self.state_tx.send_if_modified(|state| {
                    state.update_connected(|d| {
                        d.user = None;
                        d.auth_process_state = AuthProcessState::NotStarted;
                    })
                });
            }
        }
        Ok(answer)
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    fn set_auth(&self, auth: AuthProcessState) {
        self.state_tx
            .send_if_modified(|state| state.update_connected(|d| d.auth_process_state = auth));
    }

    fn device_name(&self) -> String {
        self.settings
            .device_name()
            .unwrap_or_else(|| self.config.device_name.clone())
    }

    async fn login(&self, username: &str, password: &str) {
        if !self.is_connected() {
            return;
        }
        self.set_auth(AuthProcessState::InProgress);
        let result = self
            .send_request(Request::auth_login(username, password, &self.device_name()))
            .await;
        if !self.is_connected() {
            return;
        }
        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target: "ma::session", error = %err, "login request failed");
                self.set_auth(AuthProcessState::Failed("No response from server".into()));
                return;
            }
        };
        if answer.is_error() {
            self.settings.set_token(None);
            let message = answer.error().unwrap_or("Authentication failed").to_string();
            self.set_auth(AuthProcessState::Failed(message));
            return;
        }
        let Some(login) = answer.result_as::<LoginResponse>() else {
            self.set_auth(AuthProcessState::Failed("Failed to parse auth data".into()));
            return;
        };
        if !login.success {
            let message = login.error.unwrap_or_else(|| "Authentication failed".into());
            self.set_auth(AuthProcessState::Failed(message));
            return;
        }
        let Some(token) = login.token.filter(|token| !token.trim().is_empty()) else {
            self.set_auth(AuthProcessState::Failed("No token received".into()));
            return;
        };
        if login.user.is_none() {
            self.set_auth(AuthProcessState::Failed("No user data received".into()));
            return;
        }
        self.authorize(&token, false).await;
    }

    async fn authorize(&self, token: &str, is_auto_login: bool) {
        if !self.is_connected() {
            return;
        }
        self.set_auth(AuthProcessState::InProgress);
        let result = self
            .send_request(Request::auth_authorize(token, &self.device_name()))
            .await;
        if !self.is_connected() {
            return;
        }
        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target: "ma::session", error = %err, "authorize request failed");
                self.set_auth(AuthProcessState::Failed("No response from server".into()));
                return;
            }
        };
        if answer.is_error() {
            self.settings.set_token(None);
            let message = answer.error().unwrap_or("Authentication failed").to_string();
            self.set_auth(AuthProcessState::Failed(message));
            return;
        }
        match answer
            .result_as::<AuthorizationResponse>()
            .and_then(|auth| auth.user)
        {
            Some(user) => {
                tracing::info!(target: "ma::session", username = %user.username, "authorized");
                self.settings.set_token(Some(token.to_string()));
                self.state_tx.send_if_modified(|state| {
                    state.update_connected(|d| {
                        d.auth_process_state = AuthProcessState::NotStarted;
                        d.user = Some(user);
                        d.was_auto_login = is_auto_login;
                    })
                });
            }
            None => self.set_auth(AuthProcessState::Failed("Failed to parse user data".into())),
        }
    }

    fn logout(self: &Arc<Self>) {
        self.settings.set_token(None);
        if !self.is_connected() {
            return;
        }
        self.state_tx.send_if_modified(|state| {
            state.update_connected(|d| {
                d.auth_process_state = AuthProcessState::LoggedOut;
                d.user = None;
            })
        });
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.send_request(Request::auth_logout()).await {
                tracing::debug!(target: "ma::session", error = %err, "logout request failed");
            }
        });
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        let active = self.active.lock().take();
        tracing::info!(target: "ma::session", ?reason, "disconnecting");
        self.state_tx.send_replace(SessionState::Disconnected(reason));
        if let Some(active) = active {
            active.shutdown().await;
        }
        self.fail_pending();
    }

    /// Drops every waiter; their `send_request` calls resolve to
    /// [`SessionError::Disconnected`].
    fn fail_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            tracing::debug!(target: "ma::session", count = dropped.len(), "failing pending requests");
        }
    }

    fn close(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            task.abort();
        }
        if let Some(active) = self.active.lock().take() {
            for task in &active.tasks {
                task.abort();
            }
        }
        self.fail_pending();
    }
}

/// Waits until the manager either connects or gives up.
async fn settled(
    states: &mut watch::Receiver<WebRtcConnectionState>,
) -> Option<WebRtcConnectionState> {
    let state = states
        .wait_for(|state| {
            state.is_connected()
                || matches!(
                    state,
                    WebRtcConnectionState::Error(_) | WebRtcConnectionState::Idle
                )
        })
        .await
        .ok()
        .map(|state| state.clone());
    state
}

async fn left_session(states: &mut watch::Receiver<SessionState>) {
    let _ = states.wait_for(SessionState::is_disconnected).await;
}

/// Sleeps for `wait`, returning early with `true` once the session is no
/// longer reconnecting.
async fn interrupted(states: &mut watch::Receiver<SessionState>, wait: Duration) -> bool {
    if !states.borrow_and_update().is_reconnecting() {
        return true;
    }
    let cancelled = tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = left_reconnecting(states) => true,
    };
    cancelled || !states.borrow().is_reconnecting()
}

async fn left_reconnecting(states: &mut watch::Receiver<SessionState>) {
    let _ = states.wait_for(|state| !state.is_reconnecting()).await;
}
