//! `ProjChat` -- headless line-mode chat client.
//!
//! Opens one project channel, prints the history and live events, and sends
//! every line typed on stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/projchat/config.toml`).
//!
//! ```bash
//! cargo run --bin projchat -- \
//!     --server-url ws://127.0.0.1:9000/ws --api-url http://127.0.0.1:9000/api \
//!     --channel proj-1 --user-id u-alice --token alice-token
//! ```
//!
//! Commands: `/delete <message id>`, `/typing on|off`, `/who`, `/quit`.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use projchat::api::{ApiError, HttpChatApi};
use projchat::chat::{ChatError, ChatSession, SessionEvent};
use projchat::config::{CliArgs, ClientConfig};
use projchat::transport::ws::WsConnector;
use projchat_proto::message::{Message, MessageId};

/// Failures that end the client.
#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("projchat starting");

    let result = run(config).await;
    tracing::info!("projchat exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("projchat: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they do not interleave with the chat on stdout.
/// Returns a [`WorkerGuard`] that must be held until shutdown to flush
/// buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("projchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: ClientConfig) -> Result<(), RunError> {
    let session_config = config
        .to_session_config()
        .ok_or(RunError::MissingSetting("--channel, --user-id and --token"))?;
    let server_url = config
        .server_url
        .as_deref()
        .ok_or(RunError::MissingSetting("--server-url"))?;
    let api_url = config
        .api_base_url
        .as_deref()
        .ok_or(RunError::MissingSetting("--api-url"))?;

    let connector = WsConnector::new(server_url, config.connect_timeout);
    let api = HttpChatApi::new(api_url, session_config.auth_token.clone(), config.api_timeout)?;
    let (session, mut events) =
        ChatSession::open(session_config, config.connection.clone(), connector, api).await?;

    for (label, messages) in session.grouped_by_day(&chrono::Local::now()) {
        println!("── {label} ──");
        for message in &messages {
            println!("{}", render_message(message));
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, line.trim_end()).await {
                    break;
                }
            }
        }
    }

    session.dispose().await;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line<C, A>(session: &ChatSession<C, A>, line: &str) -> bool
where
    C: projchat::transport::Connector,
    A: projchat::api::ChatApi,
{
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return false,
        ("/delete", id) if !id.trim().is_empty() => {
            if let Err(e) = session.delete_message(&MessageId::new(id.trim())).await {
                println!("! delete failed: {e}");
            }
        }
        ("/typing", arg) => session.set_typing(arg.trim() != "off"),
        ("/who", _) => {
            for member in session.roster().iter() {
                println!("  {} <{}> ({})", member.name, member.email, member.role);
            }
        }
        _ if line.trim().is_empty() => {}
        _ => {
            if let Err(e) = session.send(line).await {
                println!("! not sent: {e}");
            }
        }
    }
    true
}

fn render_message(message: &Message) -> String {
    let time = message
        .created_at
        .with_timezone(&chrono::Local)
        .format("%H:%M");
    let edited = if message.is_edited { " (edited)" } else { "" };
    let pending = if message.id.is_local() { " …" } else { "" };
    format!(
        "[{time}] {}: {}{edited}{pending}  #{}",
        message.sender_name, message.content, message.id
    )
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::MessageUpserted(message) => println!("{}", render_message(message)),
        SessionEvent::MessageRemoved(id) => println!("- #{id} removed"),
        SessionEvent::TypingChanged(typers) if typers.is_empty() => {}
        SessionEvent::TypingChanged(typers) => {
            let names: Vec<&str> = typers.iter().map(|t| t.user_name.as_str()).collect();
            println!("… {} typing", names.join(", "));
        }
        SessionEvent::ConnectionStateChanged(state) => println!("* {state}"),
        SessionEvent::Error(e) => println!("! {e}"),
    }
}
