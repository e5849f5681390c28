use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use ma_client::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use ma_client::{
    ClientConfig, ConnectionInfo, DisconnectReason, Request, ServiceClient, SessionState,
    SettingsStore,
};
use ma_webrtc::{RemoteId, WebRtcEngine};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "ma-client",
    about = "Connect to a Music Assistant server directly or through WebRTC remote access",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "MA_SIGNALING_URL",
        help = "Signaling server used for WebRTC remote access"
    )]
    signaling_url: Option<String>,

    #[arg(
        long = "settings",
        global = true,
        value_name = "PATH",
        env = "MA_SETTINGS_PATH",
        help = "Settings file (defaults to ~/.ma-client/settings.toml)"
    )]
    settings_path: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "MA_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "MA_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalize a remote id and print its forms
    ParseId {
        #[arg(value_name = "REMOTE_ID")]
        input: String,
    },
    /// Connect and stream session state and server events until Ctrl-C
    Connect(ConnectArgs),
    /// Connect, send a single command and print the answer
    Send(SendArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    #[arg(
        long,
        value_name = "ID",
        conflicts_with = "host",
        help = "Remote id for WebRTC remote access"
    )]
    remote_id: Option<String>,

    #[arg(long, help = "Server host for a direct connection")]
    host: Option<String>,

    #[arg(long, default_value_t = 8095, help = "Server port for a direct connection")]
    port: u16,

    #[arg(long, help = "Use TLS for the direct connection")]
    tls: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long, help = "Skip authorizing with the stored token")]
    no_auth: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(value_name = "COMMAND")]
    command: String,

    #[arg(long, value_name = "JSON", help = "Command arguments as a JSON object")]
    args: Option<String>,

    #[command(flatten)]
    target: TargetArgs,
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("failed to initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    if let Command::ParseId { input } = &cli.command {
        return parse_id(input);
    }

    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.signaling_url.clone() {
        config.signaling_url = url;
    }
    if let Some(path) = cli.settings_path.clone() {
        config.settings_path = Some(path);
    }
    let settings = match &config.settings_path {
        Some(path) => SettingsStore::open(path),
        None => SettingsStore::open_default(),
    }
    .context("failed to load settings")?;
    let client = ServiceClient::new(config, Arc::new(settings), Arc::new(WebRtcEngine::new()));

    match cli.command {
        Command::ParseId { .. } => Ok(()),
        Command::Connect(args) => connect(&client, args).await,
        Command::Send(args) => send(&client, args).await,
    }
}

fn parse_id(input: &str) -> Result<()> {
    let remote_id = RemoteId::parse(input).ok_or_else(|| anyhow!("invalid remote id {input:?}"))?;
    println!("raw:   {}", remote_id.as_str());
    println!("short: {}", remote_id.formatted());
    println!("full:  {}", remote_id.full_formatted());
    Ok(())
}

async fn establish(client: &ServiceClient, target: &TargetArgs) -> Result<()> {
    if let Some(raw) = &target.remote_id {
        let remote_id =
            RemoteId::parse(raw).ok_or_else(|| anyhow!("invalid remote id {raw:?}"))?;
        client.connect_webrtc(remote_id).await;
    } else if let Some(host) = &target.host {
        client
            .connect(ConnectionInfo::new(host.clone(), target.port, target.tls))
            .await;
    } else {
        client.start().await;
    }
    match client.current_state() {
        SessionState::Connected { .. } => Ok(()),
        SessionState::Disconnected(DisconnectReason::NoServerData) => {
            bail!("no saved server; pass --host or --remote-id")
        }
        SessionState::Disconnected(DisconnectReason::Error(reason)) => bail!(reason),
        other => bail!("connection did not complete: {}", describe(&other)),
    }
}

async fn authorize_from_settings(client: &ServiceClient) {
    if let Some(token) = client.settings().token() {
        client.authorize(&token, true).await;
    }
}

async fn connect(client: &ServiceClient, args: ConnectArgs) -> Result<()> {
    establish(client, &args.target).await?;
    if !args.no_auth {
        authorize_from_settings(client).await;
    }

    let mut states = client.state();
    let mut events = client.events();
    println!("{}", describe(&states.borrow_and_update()));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                println!("{}", describe(&state));
                if matches!(state, SessionState::Disconnected(_)) {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!(
                    "event {} {} {}",
                    event.event,
                    event.object_id.as_deref().unwrap_or("-"),
                    event.data
                ),
                Err(RecvError::Lagged(skipped)) => eprintln!("skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }
    client.disconnect_by_user().await;
    Ok(())
}

async fn send(client: &ServiceClient, args: SendArgs) -> Result<()> {
    let command_args = args
        .args
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--args must be valid JSON")?;
    establish(client, &args.target).await?;
    authorize_from_settings(client).await;

    let answer = client
        .send_request(Request::new(args.command, command_args))
        .await;
    client.disconnect_by_user().await;
    let answer = answer?;
    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(answer.json().clone()))?
    );
    if answer.is_error() {
        bail!(
            "server returned error {}: {}",
            answer.error_code().unwrap_or_default(),
            answer.error().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn describe(state: &SessionState) -> String {
    match state {
        SessionState::Disconnected(reason) => format!("disconnected ({reason:?})"),
        SessionState::Connecting => "connecting".to_string(),
        SessionState::Connected { transport, details } => {
            let server = details
                .server_info
                .as_ref()
                .map(|info| info.server_id.as_str())
                .unwrap_or("?");
            let user = details
                .user
                .as_ref()
                .map(|user| user.username.as_str())
                .unwrap_or("-");
            format!(
                "connected via {transport} server={server} user={user} auth={:?}",
                details.auth_process_state
            )
        }
        SessionState::Reconnecting {
            attempt, transport, ..
        } => format!("reconnecting via {transport} (attempt {attempt})"),
    }
}
