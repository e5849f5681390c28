//! Plain or TLS WebSocket link straight to a Music Assistant server.

use crate::settings::ConnectionInfo;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use url::Url;

const API_PATH: &str = "/ws";
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum DirectError {
    #[error("invalid server address {0:?}")]
    InvalidAddress(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("connection closed")]
    Closed,
}

enum Command {
    Text {
        text: String,
        ack: oneshot::Sender<Result<(), WsError>>,
    },
    Close,
}

pub struct DirectConnection {
    url: Url,
    commands: mpsc::UnboundedSender<Command>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
}

/// `ws(s)://host:port/ws`, bracketing bare IPv6 hosts.
pub fn api_url(info: &ConnectionInfo) -> Result<Url, DirectError> {
    let scheme = if info.is_tls { "wss" } else { "ws" };
    let host = if info.host.contains(':') && !info.host.starts_with('[') {
        format!("[{}]", info.host)
    } else {
        info.host.clone()
    };
    let raw = format!("{scheme}://{host}:{}{API_PATH}", info.port);
    Url::parse(&raw).map_err(|_| DirectError::InvalidAddress(raw))
}

impl DirectConnection {
    /// Opens the socket. Text frames received from the server are delivered on
    /// the returned receiver, which ends when the socket does.
    pub async fn connect(
        info: &ConnectionInfo,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), DirectError> {
        let url = api_url(info)?;
        tracing::debug!(target: "ma::direct", %url, "opening server socket");
        let (socket, _response) = connect_async(url.as_str()).await?;
        let (sink, stream) = socket.split();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, command_rx));
        let reader = tokio::spawn(read_loop(stream, inbound_tx, url.clone()));
        tracing::info!(target: "ma::direct", %url, "server socket open");
        Ok((
            Self {
                url,
                commands,
                writer: Mutex::new(Some(writer)),
                reader,
            },
            inbound_rx,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn send(&self, text: String) -> Result<(), DirectError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Text { text, ack })
            .map_err(|_| DirectError::Closed)?;
        match done.await {
            Ok(result) => result.map_err(DirectError::from),
            Err(_) => Err(DirectError::Closed),
        }
    }

    /// Sends a close frame and stops both socket tasks.
    pub async fn close(&self) {
        self.reader.abort();
        let _ = self.commands.send(Command::Close);
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        tracing::debug!(target: "ma::direct", url = %self.url, "server socket closed");
    }
}

impl Drop for DirectConnection {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Text { text, ack } => {
                let result = sink.send(Message::Text(text)).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Command::Close => break,
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<String>,
    url: Url,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if inbound.send(text).is_err() {
                    return;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    if inbound.send(text).is_err() {
                        return;
                    }
                }
                Err(_) => tracing::warn!(target: "ma::direct", "dropping non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                tracing::debug!(target: "ma::direct", %url, ?frame, "server closed the socket");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "ma::direct", %url, error = %err, "server socket error");
                return;
            }
        }
    }
}
