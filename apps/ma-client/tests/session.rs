use ma_client::{
    AuthProcessState, ClientConfig, ConnectionInfo, DisconnectReason, ReconnectPolicy, Request,
    ServiceClient, SessionDetails, SessionError, SessionState, Settings, SettingsStore, Transport,
};
use ma_webrtc::testing::{FakeEngine, FakeScript, LoopbackConnection, LoopbackServer};
use ma_webrtc::{API_CHANNEL_LABEL, RemoteId};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const REMOTE_ID: &str = "VVPN3TLP34YMGIZDINCEKQKSIR";

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        schedule: vec![Duration::from_millis(20), Duration::from_millis(40)],
        steady_delay: Duration::from_millis(60),
        max_attempts: 3,
        grace: Duration::from_millis(150),
        webrtc_grace: Duration::from_secs(2),
    }
}

fn test_config() -> ClientConfig {
    ClientConfig {
        signaling_url: "ws://127.0.0.1:9/ws".into(),
        request_timeout: Duration::from_secs(2),
        negotiation_timeout: Some(Duration::from_secs(3)),
        device_name: "test-device".into(),
        reconnect: fast_policy(),
        ..ClientConfig::default()
    }
}

fn client_with(config: ClientConfig, settings: Settings) -> (ServiceClient, Arc<SettingsStore>) {
    let settings = Arc::new(SettingsStore::in_memory(settings));
    let client = ServiceClient::new(config, settings.clone(), FakeEngine::new());
    (client, settings)
}

async fn wait_for(
    client: &ServiceClient,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut states = client.state();
    let state = timeout(WAIT, states.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed")
        .clone();
    state
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Reads the next request frame and returns it with its message id.
async fn next_request(conn: &mut LoopbackConnection) -> (Value, String) {
    let frame = conn.recv_json(WAIT).await.expect("request frame");
    let id = frame["message_id"].as_str().expect("message_id").to_string();
    (frame, id)
}

fn user_json() -> Value {
    json!({"user_id": "u1", "username": "alice", "display_name": "Alice", "role": "admin"})
}

struct DirectHarness {
    server: LoopbackServer,
    client: ServiceClient,
    settings: Arc<SettingsStore>,
    info: ConnectionInfo,
}

impl DirectHarness {
    async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    async fn with_config(config: ClientConfig) -> Self {
        let server = LoopbackServer::bind("/ws").await.unwrap();
        let info = ConnectionInfo::new("127.0.0.1", server.port(), false);
        let (client, settings) = client_with(config, Settings::default());
        Self {
            server,
            client,
            settings,
            info,
        }
    }

    async fn connect(&mut self) -> LoopbackConnection {
        self.client.connect(self.info.clone()).await;
        assert!(self.client.current_state().is_connected());
        self.server
            .next_connection(WAIT)
            .await
            .expect("server socket")
    }

    /// Connects and signs in with `token`, answering the authorize command.
    async fn connect_authorized(&mut self, token: &str) -> LoopbackConnection {
        let mut conn = self.connect().await;
        let server = async {
            let (frame, id) = next_request(&mut conn).await;
            assert_eq!(frame["command"], "auth");
            assert_eq!(frame["args"]["token"], token);
            assert_eq!(frame["args"]["device_name"], "test-device");
            conn.send_json(&json!({"message_id": id, "result": {"user": user_json()}}));
        };
        tokio::join!(self.client.authorize(token, true), server);
        conn
    }
}

#[tokio::test]
async fn direct_connect_tracks_server_info_and_persists_settings() {
    let mut h = DirectHarness::new().await;
    let conn = h.connect().await;
    assert_eq!(
        h.client.current_state(),
        SessionState::Connected {
            transport: Transport::Direct(h.info.clone()),
            details: SessionDetails::default(),
        }
    );
    assert_eq!(h.settings.connection_info(), Some(h.info.clone()));
    assert_eq!(h.settings.last_connection_mode().as_deref(), Some("direct"));

    conn.send_json(&json!({
        "server_id": "srv-1",
        "server_version": "2.5.0",
        "schema_version": 27,
        "onboard_done": true
    }));
    let state = wait_for(&h.client, |state| {
        state
            .details()
            .is_some_and(|details| details.server_info.is_some())
    })
    .await;
    let info = state.details().unwrap().server_info.clone().unwrap();
    assert_eq!(info.server_id, "srv-1");
    assert_eq!(info.server_version.as_deref(), Some("2.5.0"));
}

#[tokio::test]
async fn failed_direct_connect_reports_error() {
    let server = LoopbackServer::bind("/ws").await.unwrap();
    let info = ConnectionInfo::new("127.0.0.1", server.port(), false);
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (client, settings) = client_with(test_config(), Settings::default());
    client.connect(info).await;
    match client.current_state() {
        SessionState::Disconnected(DisconnectReason::Error(reason)) => {
            assert!(reason.starts_with("Connection failed"), "{reason}");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert!(settings.connection_info().is_none());
}

#[tokio::test]
async fn answers_are_matched_by_message_id() {
    let mut h = DirectHarness::new().await;
    let mut conn = h.connect().await;

    let server = async {
        let (first, first_id) = next_request(&mut conn).await;
        let (second, second_id) = next_request(&mut conn).await;
        // Answer in reverse order.
        for (frame, id) in [(second, second_id), (first, first_id)] {
            conn.send_json(&json!({"message_id": id, "result": frame["command"]}));
        }
    };
    let (players, queues, ()) = tokio::join!(
        h.client
            .send_request(Request::new("players/all", None)),
        h.client
            .send_request(Request::new("player_queues/all", Some(json!({"limit": 5})))),
        server,
    );
    assert_eq!(players.unwrap().result(), Some(&json!("players/all")));
    assert_eq!(queues.unwrap().result(), Some(&json!("player_queues/all")));
    assert_eq!(h.client.pending_count(), 0);
}

#[tokio::test]
async fn requests_fail_fast_without_a_session() {
    let (client, _) = client_with(test_config(), Settings::default());
    let result = client.send_request(Request::new("players/all", None)).await;
    assert!(matches!(result, Err(SessionError::NotConnected)));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn unanswered_requests_time_out_and_are_forgotten() {
    let mut config = test_config();
    config.request_timeout = Duration::from_millis(200);
    let mut h = DirectHarness::with_config(config).await;
    let mut conn = h.connect().await;

    let result = h
        .client
        .send_request(Request::new("music/sync", None))
        .await;
    assert!(matches!(result, Err(SessionError::Timeout { .. })));
    assert_eq!(h.client.pending_count(), 0);
    // A late answer is ignored.
    let (_, id) = next_request(&mut conn).await;
    conn.send_json(&json!({"message_id": id, "result": null}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.client.current_state().is_connected());
}

#[tokio::test]
async fn server_events_are_broadcast() {
    let mut h = DirectHarness::new().await;
    let mut events = h.client.events();
    let conn = h.connect().await;

    conn.send_text("not json at all");
    conn.send_json(&json!({"greeting": "hello"}));
    conn.send_json(&json!({
        "event": "player_updated",
        "object_id": "player-1",
        "data": {"volume_level": 30}
    }));
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.event, "player_updated");
    assert_eq!(event.object_id.as_deref(), Some("player-1"));
    assert_eq!(event.data["volume_level"], 30);
    assert!(h.client.current_state().is_connected());
}

#[tokio::test]
async fn authorize_stores_user_and_token() {
    let mut h = DirectHarness::new().await;
    let _conn = h.connect_authorized("tok-1").await;
    let state = h.client.current_state();
    let details = state.details().unwrap();
    assert_eq!(details.user.as_ref().unwrap().username, "alice");
    assert_eq!(details.auth_process_state, AuthProcessState::NotStarted);
    assert!(details.was_auto_login);
    assert_eq!(h.settings.token().as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn unauthorized_answer_drops_the_user() {
    let mut h = DirectHarness::new().await;
    let mut conn = h.connect_authorized("tok-1").await;

    let server = async {
        let (_, id) = next_request(&mut conn).await;
        conn.send_json(&json!({
            "message_id": id,
            "error_code": 20,
            "details": "Authentication required"
        }));
    };
    let (answer, ()) = tokio::join!(
        h.client.send_request(Request::new("players/all", None)),
        server
    );
    let answer = answer.unwrap();
    assert!(answer.is_error());
    let state = h.client.current_state();
    let details = state.details().unwrap();
    assert!(details.user.is_none());
    assert_eq!(details.auth_process_state, AuthProcessState::NotStarted);
}

#[tokio::test]
async fn login_exchanges_credentials_for_a_token() {
    let mut h = DirectHarness::new().await;
    let mut conn = h.connect().await;

    let server = async {
        let (login, id) = next_request(&mut conn).await;
        assert_eq!(login["command"], "auth/login");
        assert_eq!(login["args"]["username"], "alice");
        assert_eq!(login["args"]["password"], "hunter2");
        conn.send_json(&json!({
            "message_id": id,
            "result": {"success": true, "token": "fresh-token", "user": user_json()}
        }));
        let (auth, id) = next_request(&mut conn).await;
        assert_eq!(auth["command"], "auth");
        assert_eq!(auth["args"]["token"], "fresh-token");
        conn.send_json(&json!({"message_id": id, "result": {"user": user_json()}}));
    };
    tokio::join!(h.client.login("alice", "hunter2"), server);

    let state = h.client.current_state();
    let details = state.details().unwrap();
    assert_eq!(details.user.as_ref().unwrap().user_id, "u1");
    assert!(!details.was_auto_login);
    assert_eq!(h.settings.token().as_deref(), Some("fresh-token"));
}

#[tokio::test]
async fn rejected_login_clears_the_stored_token() {
    let mut h = DirectHarness::new().await;
    h.settings.set_token(Some("stale".into()));
    let mut conn = h.connect().await;

    let server = async {
        let (_, id) = next_request(&mut conn).await;
        conn.send_json(&json!({
            "message_id": id,
            "error_code": 1,
            "error": "Invalid credentials"
        }));
    };
    tokio::join!(h.client.login("alice", "wrong"), server);

    let state = h.client.current_state();
    assert_eq!(
        state.details().unwrap().auth_process_state,
        AuthProcessState::Failed("Invalid credentials".into())
    );
    assert_eq!(h.settings.token(), None);
}

#[tokio::test]
async fn unsuccessful_login_reports_the_server_error() {
    let mut h = DirectHarness::new().await;
    let mut conn = h.connect().await;

    let server = async {
        let (_, id) = next_request(&mut conn).await;
        conn.send_json(&json!({
            "message_id": id,
            "result": {"success": false, "error": "Account locked"}
        }));
    };
    tokio::join!(h.client.login("alice", "pw"), server);
    assert_eq!(
        h.client.current_state().details().unwrap().auth_process_state,
        AuthProcessState::Failed("Account locked".into())
    );
}

#[tokio::test]
async fn logout_is_local_first() {
    let mut h = DirectHarness::new().await;
    let mut conn = h.connect_authorized("tok-1").await;

    h.client.logout();
    let state = h.client.current_state();
    let details = state.details().unwrap();
    assert_eq!(details.auth_process_state, AuthProcessState::LoggedOut);
    assert!(details.user.is_none());
    assert_eq!(h.settings.token(), None);

    let (frame, _) = next_request(&mut conn).await;
    assert_eq!(frame["command"], "auth/logout");
}

#[tokio::test]
async fn reconnect_keeps_details_until_the_budget_runs_out() {
    let mut h = DirectHarness::new().await;
    let conn = h.connect_authorized("tok-1").await;
    let expected = h.client.current_state().details().cloned().unwrap();

    let mut states = h.client.state();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            let done = state.is_disconnected();
            seen.push(state);
            if done {
                break;
            }
        }
        seen
    });

    h.server.stop_accepting();
    conn.drop_abruptly();

    let seen = timeout(WAIT, recorder).await.unwrap().unwrap();
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|state| match state {
            SessionState::Reconnecting { attempt, details, .. } => {
                assert_eq!(details, &expected);
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);
    assert_eq!(
        seen.last(),
        Some(&SessionState::Disconnected(DisconnectReason::Error(
            "Failed to reconnect after 3 attempts".into()
        )))
    );
}

#[tokio::test]
async fn reconnect_follows_an_edited_endpoint() {
    let mut h = DirectHarness::new().await;
    let conn = h.connect_authorized("tok-1").await;
    let expected = h.client.current_state().details().cloned().unwrap();

    let mut replacement = LoopbackServer::bind("/ws").await.unwrap();
    let moved = ConnectionInfo::new("127.0.0.1", replacement.port(), false);
    h.settings.set_connection_info(moved.clone());
    conn.drop_abruptly();

    let state = wait_for(&h.client, |state| {
        matches!(
            state,
            SessionState::Connected { transport: Transport::Direct(info), .. }
                if info.port == moved.port
        )
    })
    .await;
    assert_eq!(
        state,
        SessionState::Connected {
            transport: Transport::Direct(moved),
            details: expected,
        }
    );
    assert!(replacement.next_connection(WAIT).await.is_some());
}

#[tokio::test]
async fn user_disconnect_stops_reconnecting() {
    let mut config = test_config();
    config.reconnect.schedule = vec![Duration::from_millis(400)];
    let mut h = DirectHarness::with_config(config).await;
    let conn = h.connect().await;

    conn.drop_abruptly();
    wait_for(&h.client, SessionState::is_reconnecting).await;
    h.client.disconnect_by_user().await;
    assert_eq!(
        h.client.current_state(),
        SessionState::Disconnected(DisconnectReason::ByUser)
    );

    assert!(
        h.server
            .next_connection(Duration::from_millis(700))
            .await
            .is_none()
    );
    assert_eq!(
        h.client.current_state(),
        SessionState::Disconnected(DisconnectReason::ByUser)
    );
}

#[tokio::test]
async fn user_disconnect_is_not_reconnected() {
    let mut h = DirectHarness::new().await;
    let _conn = h.connect().await;
    h.client.disconnect_by_user().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.client.current_state(),
        SessionState::Disconnected(DisconnectReason::ByUser)
    );
    assert!(h.server.next_connection(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn autoconnect_needs_server_data() {
    let (client, _) = client_with(test_config(), Settings::default());
    client.start().await;
    assert_eq!(
        client.current_state(),
        SessionState::Disconnected(DisconnectReason::NoServerData)
    );

    let (client, _) = client_with(
        test_config(),
        Settings {
            last_connection_mode: Some("webrtc".into()),
            webrtc_remote_id: "not-an-id".into(),
            ..Settings::default()
        },
    );
    client.start().await;
    assert_eq!(
        client.current_state(),
        SessionState::Disconnected(DisconnectReason::NoServerData)
    );

    let (client, _) = client_with(
        test_config(),
        Settings {
            last_connection_mode: Some("bluetooth".into()),
            connection_info: Some(ConnectionInfo::new("127.0.0.1", 8095, false)),
            ..Settings::default()
        },
    );
    client.start().await;
    assert_eq!(
        client.current_state(),
        SessionState::Disconnected(DisconnectReason::NoServerData)
    );
}

#[tokio::test]
async fn autoconnect_uses_saved_direct_server() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let info = ConnectionInfo::new("127.0.0.1", server.port(), false);
    let (client, _) = client_with(
        test_config(),
        Settings {
            connection_info: Some(info.clone()),
            ..Settings::default()
        },
    );
    client.start().await;
    assert!(server.next_connection(WAIT).await.is_some());
    assert_eq!(
        client.current_state().transport(),
        Some(&Transport::Direct(info))
    );
    // Only the initial state triggers autoconnect.
    client.start().await;
    assert!(server.next_connection(Duration::from_millis(100)).await.is_none());
}

struct WebRtcHarness {
    signaling: LoopbackServer,
    engine: Arc<FakeEngine>,
    client: Arc<ServiceClient>,
    settings: Arc<SettingsStore>,
    remote_id: RemoteId,
}

impl WebRtcHarness {
    async fn new() -> Self {
        let signaling = LoopbackServer::bind("/ws").await.unwrap();
        let engine = FakeEngine::with_script(FakeScript {
            open_channels_immediately: true,
            ..FakeScript::default()
        });
        let config = ClientConfig {
            signaling_url: signaling.url(),
            ..test_config()
        };
        let settings = Arc::new(SettingsStore::in_memory(Settings::default()));
        let client = Arc::new(ServiceClient::new(config, settings.clone(), engine.clone()));
        Self {
            signaling,
            engine,
            client,
            settings,
            remote_id: RemoteId::new(REMOTE_ID).unwrap(),
        }
    }

    /// Plays the signaling side of one negotiation. Returns the socket so
    /// the test controls when it goes away.
    async fn serve_signaling(&mut self, session_id: &str) -> LoopbackConnection {
        let mut conn = self
            .signaling
            .next_connection(WAIT)
            .await
            .expect("signaling socket");
        let request = conn.recv_json(WAIT).await.expect("connect request");
        assert_eq!(request["type"], "connect-request");
        assert_eq!(request["remoteId"], REMOTE_ID);
        conn.send_json(&json!({"type": "connected", "sessionId": session_id, "iceServers": []}));
        let offer = conn.recv_json(WAIT).await.expect("offer");
        assert_eq!(offer["sessionId"], session_id);
        conn
    }

    async fn connect(&mut self) -> LoopbackConnection {
        let client = self.client.clone();
        let remote_id = self.remote_id.clone();
        let attempt = tokio::spawn(async move { client.connect_webrtc(remote_id).await });
        let conn = self.serve_signaling("session-1").await;
        timeout(WAIT, attempt).await.unwrap().unwrap();
        conn
    }
}

#[tokio::test]
async fn webrtc_session_carries_requests_over_the_data_channel() {
    let mut h = WebRtcHarness::new().await;
    let _signaling = h.connect().await;
    assert_eq!(
        h.client.current_state().transport(),
        Some(&Transport::WebRtc(h.remote_id.clone()))
    );
    assert_eq!(h.settings.last_connection_mode().as_deref(), Some("webrtc"));
    assert_eq!(h.settings.webrtc_remote_id(), REMOTE_ID);

    let channel = h
        .engine
        .last_peer()
        .and_then(|peer| peer.channel(API_CHANNEL_LABEL))
        .expect("api channel");
    let client = h.client.clone();
    let request = tokio::spawn(async move {
        client
            .send_request(Request::new("players/all", None))
            .await
    });
    timeout(WAIT, async {
        while channel.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let frame: Value = serde_json::from_str(&channel.sent()[0]).unwrap();
    assert_eq!(frame["command"], "players/all");
    channel.deliver(json!({"message_id": frame["message_id"], "result": []}).to_string());

    let answer = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
    assert_eq!(answer.result(), Some(&json!([])));

    channel.deliver(json!({"server_id": "srv-rtc"}).to_string());
    let state = wait_for(&h.client, |state| {
        state
            .details()
            .is_some_and(|details| details.server_info.is_some())
    })
    .await;
    assert_eq!(
        state.details().unwrap().server_info.as_ref().unwrap().server_id,
        "srv-rtc"
    );
}

#[tokio::test]
async fn webrtc_send_failure_ends_the_session() {
    let mut h = WebRtcHarness::new().await;
    let _signaling = h.connect().await;
    let channel = h
        .engine
        .last_peer()
        .and_then(|peer| peer.channel(API_CHANNEL_LABEL))
        .expect("api channel");
    channel.fail_sends();

    let result = timeout(
        WAIT,
        h.client.send_request(Request::new("players/all", None)),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(h.client.pending_count(), 0);
    match h.client.current_state() {
        SessionState::Disconnected(DisconnectReason::Error(reason)) => {
            assert!(reason.starts_with("Error sending command:"), "{reason}");
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn webrtc_link_loss_reconnects_with_a_fresh_peer() {
    let mut h = WebRtcHarness::new().await;
    let _first = h.connect().await;
    let first_peer = h.engine.last_peer().unwrap();

    first_peer
        .channel(API_CHANNEL_LABEL)
        .expect("api channel")
        .close_remotely();
    wait_for(&h.client, SessionState::is_reconnecting).await;
    wait_until(|| first_peer.is_closed()).await;

    let _second = h.serve_signaling("session-2").await;
    let state = wait_for(&h.client, SessionState::is_connected).await;
    assert_eq!(state.transport(), Some(&Transport::WebRtc(h.remote_id.clone())));
    assert_eq!(h.engine.peer_count(), 2);

    h.client.disconnect_by_user().await;
    assert!(h.engine.last_peer().unwrap().is_closed());
}

#[tokio::test]
async fn switching_transport_during_reconnect_is_refused() {
    let mut h = WebRtcHarness::new().await;
    let _first = h.connect().await;
    h.engine
        .last_peer()
        .and_then(|peer| peer.channel(API_CHANNEL_LABEL))
        .expect("api channel")
        .close_remotely();
    wait_for(&h.client, SessionState::is_reconnecting).await;

    let direct = LoopbackServer::bind("/ws").await.unwrap();
    h.client
        .connect(ConnectionInfo::new("127.0.0.1", direct.port(), false))
        .await;
    assert!(h.client.current_state().is_reconnecting());
    h.client.disconnect_by_user().await;
}
