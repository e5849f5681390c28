use super::message::SignalingMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling.music-assistant.io/ws";

const INCOMING_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const PREVIEW_CHARS: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl SignalingState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SignalingState::Connected)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported signaling url scheme {0:?} (expected ws or wss)")]
    UnsupportedScheme(String),
    #[error("not connected to the signaling server")]
    NotConnected,
    #[error("signaling websocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Outbound {
    text: String,
    ack: oneshot::Sender<Result<(), WsError>>,
}

struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Link {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// WebSocket client for the signaling service.
///
/// Decoded frames are fanned out on a broadcast channel; connection health is
/// published on a watch channel. Outbound frames go through a writer task so
/// the socket is owned by exactly two tasks that [`SignalingClient::close`]
/// can abort without awaiting anything.
pub struct SignalingClient {
    url: Url,
    state_tx: watch::Sender<SignalingState>,
    incoming_tx: broadcast::Sender<SignalingMessage>,
    link: Mutex<Option<Link>>,
}

impl SignalingClient {
    pub fn new(url: &str) -> Result<Self, SignalingError> {
        let parsed = Url::parse(url).map_err(|source| SignalingError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::UnsupportedScheme(parsed.scheme().to_owned()));
        }
        let (state_tx, _) = watch::channel(SignalingState::Disconnected);
        let (incoming_tx, _) = broadcast::channel(INCOMING_CAPACITY);
        Ok(Self {
            url: parsed,
            state_tx,
            incoming_tx,
            link: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> watch::Receiver<SignalingState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SignalingState {
        self.state_tx.borrow().clone()
    }

    /// Subscribes to decoded inbound messages. Only frames received after
    /// the call are observed.
    pub fn incoming(&self) -> broadcast::Receiver<SignalingMessage> {
        self.incoming_tx.subscribe()
    }

    /// Opens the socket. A no-op while already connecting or connected.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let started = self.state_tx.send_if_modified(|state| match state {
            SignalingState::Connecting | SignalingState::Connected => false,
            _ => {
                *state = SignalingState::Connecting;
                true
            }
        });
        if !started {
            tracing::warn!(
                target: "ma::signaling",
                url = %self.url,
                "signaling already connected or connecting"
            );
            return Ok(());
        }

        tracing::info!(target: "ma::signaling", url = %self.url, "connecting to signaling server");
        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::error!(
                    target: "ma::signaling",
                    url = %self.url,
                    error = %err,
                    "signaling connect failed"
                );
                self.state_tx
                    .send_replace(SignalingState::Error(err.to_string()));
                return Err(err.into());
            }
        };

        // disconnect() may have run while the handshake was in flight.
        let still_wanted = self.state_tx.send_if_modified(|state| {
            if *state == SignalingState::Connecting {
                *state = SignalingState::Connected;
                true
            } else {
                false
            }
        });
        if !still_wanted {
            tracing::debug!(
                target: "ma::signaling",
                "signaling connect superseded by disconnect; dropping socket"
            );
            return Err(SignalingError::NotConnected);
        }

        let (sink, stream) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            self.state_tx.clone(),
            self.incoming_tx.clone(),
        ));
        let stale = self.link.lock().replace(Link {
            outbound: outbound_tx,
            writer,
            reader,
        });
        if let Some(stale) = stale {
            stale.abort();
        }
        tracing::info!(target: "ma::signaling", url = %self.url, "signaling connected");
        Ok(())
    }

    /// Encodes and writes one message. Write failures are returned to the
    /// caller; they do not tear the connection down.
    pub async fn send_message(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        let outbound = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .filter(|_| self.state_tx.borrow().is_connected());
        let Some(outbound) = outbound else {
            tracing::error!(
                target: "ma::signaling",
                kind = message.kind(),
                "cannot send signaling message: not connected"
            );
            return Err(SignalingError::NotConnected);
        };

        let text = message.encode().map_err(|err| {
            tracing::error!(
                target: "ma::signaling",
                kind = message.kind(),
                error = %err,
                "failed to encode signaling message"
            );
            SignalingError::from(err)
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound.send(Outbound { text, ack: ack_tx }).is_err() {
            return Err(SignalingError::NotConnected);
        }
        match ack_rx.await {
            Ok(Ok(())) => {
                tracing::debug!(target: "ma::signaling", kind = message.kind(), "sent signaling message");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(
                    target: "ma::signaling",
                    kind = message.kind(),
                    error = %err,
                    "signaling write failed"
                );
                Err(err.into())
            }
            Err(_) => Err(SignalingError::NotConnected),
        }
    }

    /// Stops the receive loop, sends a close frame and waits briefly for the
    /// writer to flush it. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(Link {
            outbound,
            writer,
            reader,
        }) = link
        {
            tracing::info!(target: "ma::signaling", url = %self.url, "disconnecting from signaling server");
            reader.abort();
            drop(outbound);
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                tracing::debug!(target: "ma::signaling", "close frame not flushed in time");
                abort.abort();
            }
        }
        self.state_tx.send_replace(SignalingState::Disconnected);
    }

    /// Synchronous teardown: aborts both socket tasks without a close
    /// handshake.
    pub fn close(&self) {
        if let Some(link) = self.link.lock().take() {
            link.abort();
        }
        self.state_tx.send_if_modified(|state| {
            if *state == SignalingState::Disconnected {
                false
            } else {
                *state = SignalingState::Disconnected;
                true
            }
        });
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { text, ack }) = outbound.recv().await {
        let result = sink.send(Message::Text(text)).await;
        let _ = ack.send(result);
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(target: "ma::signaling", error = %err, "signaling close handshake failed");
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    state_tx: watch::Sender<SignalingState>,
    incoming_tx: broadcast::Sender<SignalingMessage>,
) {
    let mut failure = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => publish(&text, &incoming_tx),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => publish(&text, &incoming_tx),
                Err(_) => tracing::warn!(
                    target: "ma::signaling",
                    "dropping non-utf8 binary signaling frame"
                ),
            },
            Ok(Message::Close(frame)) => {
                tracing::debug!(target: "ma::signaling", ?frame, "signaling server closed the socket");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let next = match failure {
        Some(err) if is_benign_close(&err) => {
            tracing::debug!(target: "ma::signaling", error = %err, "signaling websocket closed");
            SignalingState::Disconnected
        }
        Some(err) => {
            tracing::warn!(target: "ma::signaling", error = %err, "signaling websocket error");
            SignalingState::Error(err.to_string())
        }
        None => SignalingState::Disconnected,
    };
    state_tx.send_if_modified(|state| {
        if state.is_connected() {
            *state = next;
            true
        } else {
            false
        }
    });
}

fn is_benign_close(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

fn publish(text: &str, incoming_tx: &broadcast::Sender<SignalingMessage>) {
    match SignalingMessage::decode(text) {
        Ok(message) => {
            tracing::trace!(
                target: "ma::signaling",
                kind = message.kind(),
                len = text.len(),
                "signaling frame received"
            );
            if incoming_tx.send(message).is_err() {
                tracing::trace!(target: "ma::signaling", "no signaling subscribers");
            }
        }
        Err(err) => tracing::warn!(
            target: "ma::signaling",
            error = %err,
            preview = %preview(text),
            "dropping undecodable signaling frame"
        ),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(
            SignalingClient::new("not a url"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            SignalingClient::new("https://signaling.example.org/ws"),
            Err(SignalingError::UnsupportedScheme(scheme)) if scheme == "https"
        ));
        let client = SignalingClient::new(DEFAULT_SIGNALING_URL).unwrap();
        assert_eq!(client.url().host_str(), Some("signaling.music-assistant.io"));
        assert_eq!(client.current_state(), SignalingState::Disconnected);
    }

    #[test]
    fn preview_is_bounded() {
        let long = "x".repeat(500);
        assert_eq!(preview(&long).len(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let client = SignalingClient::new("ws://127.0.0.1:9/ws").unwrap();
        let result = client
            .send_message(&SignalingMessage::ConnectRequest {
                remote_id: "ABCD1234".into(),
            })
            .await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_and_close_are_idempotent() {
        let client = SignalingClient::new("ws://127.0.0.1:9/ws").unwrap();
        client.disconnect().await;
        client.disconnect().await;
        client.close();
        client.close();
        assert_eq!(client.current_state(), SignalingState::Disconnected);
    }
}
