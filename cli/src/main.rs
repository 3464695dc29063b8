use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chatsocket::{Connection, ConnectionConfig, ConnectionError, Credentials, RequestError};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing access token; pass --access-token or set CHAT_ACCESS_TOKEN")]
    MissingAccessToken,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("waiting for ctrl-c failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "chat-cli", about = "Chat websocket transport CLI")]
struct Cli {
    #[arg(long, env = "CHAT_HOST", default_value = "http://127.0.0.1:8080")]
    host: String,

    #[arg(long, env = "CHAT_ACCESS_TOKEN")]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the socket, then close it.
    Ping,
    /// Print every pushed message as JSON.
    Listen(ListenArgs),
    /// Send one request and print the matching response.
    Request(RequestArgs),
    /// Encode or decode frames offline.
    Frame(FrameCommand),
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, help = "Stop after this many seconds instead of waiting for ctrl-c")]
    seconds: Option<u64>,
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long, default_value = "GET")]
    verb: String,

    #[arg(long)]
    path: String,

    #[arg(long)]
    body: Option<String>,

    #[arg(long = "header", help = "`name:value`, repeatable")]
    headers: Vec<String>,
}

#[derive(Args, Debug)]
struct FrameCommand {
    #[command(subcommand)]
    command: FrameSubcommand,
}

#[derive(Subcommand, Debug)]
enum FrameSubcommand {
    /// Encode a request frame and print it as base64.
    Encode {
        #[arg(long)]
        id: u64,
        #[arg(long, default_value = "GET")]
        verb: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        body: Option<String>,
    },
    /// Decode a base64 frame and print it as JSON.
    Decode { frame: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ping => run_ping(&connect(cli.host, cli.access_token).await?),
        Command::Listen(args) => run_listen(&connect(cli.host, cli.access_token).await?, args).await,
        Command::Request(args) => run_request(&connect(cli.host, cli.access_token).await?, args).await,
        Command::Frame(frame) => run_frame(frame.command),
    }
}

async fn connect(host: String, access_token: Option<String>) -> Result<Connection, CliError> {
    let token = access_token.filter(|t| !t.trim().is_empty()).ok_or(CliError::MissingAccessToken)?;
    let conn = Connection::with_config(Credentials::new(host, token), ConnectionConfig::from_env());
    conn.listen().await?;
    Ok(conn)
}

fn run_ping(conn: &Connection) -> Result<(), CliError> {
    conn.stop();
    println!("ok");
    Ok(())
}

async fn run_listen(conn: &Connection, args: ListenArgs) -> Result<(), CliError> {
    conn.on_message(|incoming| match serde_json::to_string(incoming) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "cli: message not printable"),
    });
    conn.on_close(|reason| tracing::info!(?reason, "cli: socket closed"));

    match args.seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c().await?,
    }
    conn.stop();
    Ok(())
}

async fn run_request(conn: &Connection, args: RequestArgs) -> Result<(), CliError> {
    let response = conn.request(&args.verb, &args.path, args.body.as_deref(), &args.headers).await?;
    let body = response
        .body_text()
        .map(|text| serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)));
    print_json(&json!({
        "id": response.id,
        "status": response.status,
        "message": response.message,
        "headers": response.headers,
        "body": body,
    }))?;
    conn.stop();
    Ok(())
}

fn run_frame(command: FrameSubcommand) -> Result<(), CliError> {
    match command {
        FrameSubcommand::Encode { id, verb, path, body } => {
            let bytes = frames::prepare_request(id, &verb, &path, body.as_deref(), &[]);
            println!("{}", STANDARD.encode(bytes));
            Ok(())
        }
        FrameSubcommand::Decode { frame } => {
            let message = frames::decode(&STANDARD.decode(frame.trim())?)?;
            print_json(&serde_json::to_value(&message)?)
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
