use ma_webrtc::testing::LoopbackServer;
use ma_webrtc::{SignalingClient, SignalingError, SignalingMessage, SignalingState};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_state(client: &SignalingClient, expected: SignalingState) {
    let mut states = client.state();
    timeout(WAIT, states.wait_for(|state| *state == expected))
        .await
        .expect("timed out waiting for signaling state")
        .expect("state channel closed");
}

#[tokio::test]
async fn malformed_frames_do_not_stop_the_receive_loop() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let client = SignalingClient::new(&server.url()).unwrap();
    let mut incoming = client.incoming();
    client.connect().await.unwrap();
    assert_eq!(client.current_state(), SignalingState::Connected);

    let conn = server.next_connection(WAIT).await.expect("client connected");
    assert!(conn.send_text("{ this is not json"));
    assert!(conn.send_text(r#"{"no_type":true}"#));
    assert!(conn.send_text(r#"{"type":"mystery","x":1}"#));
    assert!(conn.send_json(&json!({"type": "connected", "sessionId": "s-1"})));

    let first = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(
        first,
        SignalingMessage::Unknown {
            kind: "mystery".into()
        }
    );
    let second = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(
        second,
        SignalingMessage::Connected {
            session_id: "s-1".into(),
            ice_servers: Vec::new(),
        }
    );
    assert_eq!(client.current_state(), SignalingState::Connected);
}

#[tokio::test]
async fn outbound_messages_reach_the_server() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let client = SignalingClient::new(&server.url()).unwrap();
    client.connect().await.unwrap();
    let mut conn = server.next_connection(WAIT).await.unwrap();

    client
        .send_message(&SignalingMessage::ConnectRequest {
            remote_id: "VVPN3TLP".into(),
        })
        .await
        .unwrap();
    let frame = conn.recv_json(WAIT).await.unwrap();
    assert_eq!(frame, json!({"type": "connect-request", "remoteId": "VVPN3TLP"}));
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let client = SignalingClient::new(&server.url()).unwrap();
    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert!(server.next_connection(WAIT).await.is_some());
    assert!(
        server
            .next_connection(Duration::from_millis(200))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn server_close_moves_to_disconnected_and_blocks_sends() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let client = SignalingClient::new(&server.url()).unwrap();
    client.connect().await.unwrap();
    let conn = server.next_connection(WAIT).await.unwrap();

    conn.close();
    wait_for_state(&client, SignalingState::Disconnected).await;

    let result = client
        .send_message(&SignalingMessage::ConnectRequest {
            remote_id: "VVPN3TLP".into(),
        })
        .await;
    assert!(matches!(result, Err(SignalingError::NotConnected)));
}

#[tokio::test]
async fn unreachable_server_reports_error_state() {
    let server = LoopbackServer::bind("/ws").await.unwrap();
    let url = server.url();
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = SignalingClient::new(&url).unwrap();
    assert!(client.connect().await.is_err());
    assert!(matches!(client.current_state(), SignalingState::Error(_)));
}

#[tokio::test]
async fn disconnect_sends_close_and_allows_reconnect() {
    let mut server = LoopbackServer::bind("/ws").await.unwrap();
    let client = SignalingClient::new(&server.url()).unwrap();
    client.connect().await.unwrap();
    let mut first = server.next_connection(WAIT).await.unwrap();

    client.disconnect().await;
    assert_eq!(client.current_state(), SignalingState::Disconnected);
    // Inbound side ends once the close frame arrives.
    assert!(first.recv_text(WAIT).await.is_none());

    client.connect().await.unwrap();
    assert!(server.next_connection(WAIT).await.is_some());
    assert_eq!(client.current_state(), SignalingState::Connected);
}
