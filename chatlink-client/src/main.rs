use std::{
    convert::Infallible,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chatlink_client::{
    ConfigError, Credentials, HttpRestClient, Session, SessionConfig, WsConnector,
    load_config_from_path, save_config_to_path,
};
use chatlink_core::{ChatId, Id, LocalId, TimelineDiff, UserId};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

/// Digits become numeric ids, matching the server's JSON numbers.
fn parse_id(value: &str) -> Result<Id, Infallible> {
    value.parse()
}

#[derive(Parser, Debug)]
#[command(name = "chatlink", about = "Realtime chat session client")]
struct Args {
    /// JSON session config; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long, value_parser = parse_id)]
    user_id: UserId,
    /// Chat to open on startup; console input is sent here.
    #[arg(long, value_parser = parse_id)]
    chat: Option<ChatId>,
    #[arg(long)]
    queue_limit: Option<usize>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Write the resolved config to this path and exit.
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Say(String),
    Older,
    Typing,
    Retry(LocalId),
    Read,
    Quit,
    Nothing,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(head, rest)| (head, rest.trim())) {
            ("", _) => ConsoleCommand::Nothing,
            ("/older", _) => ConsoleCommand::Older,
            ("/typing", _) => ConsoleCommand::Typing,
            ("/read", _) => ConsoleCommand::Read,
            ("/quit", _) => ConsoleCommand::Quit,
            ("/retry", local_id) if !local_id.is_empty() => ConsoleCommand::Retry(LocalId::from(local_id)),
            _ => ConsoleCommand::Say(line.to_owned()),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_file.as_deref());

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("config resolution failed: {err}");
            std::process::exit(2);
        }
    };

    if let Some(path) = &args.write_config {
        match save_config_to_path(path, &config) {
            Ok(()) => info!(path = %path.display(), "config written"),
            Err(err) => {
                error!("{err}");
                std::process::exit(1);
            }
        }
        return;
    }

    let rest = match HttpRestClient::new(&config.api_base_url, args.token.clone(), config.rest_timeout()) {
        Ok(rest) => rest,
        Err(err) => {
            error!(api_url = %config.api_base_url, "{err}");
            std::process::exit(2);
        }
    };

    info!(
        server_url = %config.server_url,
        api_url = %config.api_base_url,
        user_id = %args.user_id,
        "session starting"
    );

    let credentials = Credentials {
        token: args.token.clone(),
        user_id: args.user_id.clone(),
    };
    let session = Session::start(
        &config,
        credentials,
        WsConnector::new(config.keepalive_interval()),
        rest,
    );

    let mut reporters = vec![spawn_state_reporter(&session), spawn_presence_reporter(&session)];
    session.connect();

    if let Some(chat_id) = &args.chat {
        reporters.push(spawn_timeline_reporter(&session, chat_id));
        match session.refresh_chats().await {
            Ok(chats) => info!(count = chats.len(), "chat list refreshed"),
            Err(err) => warn!("chat list refresh failed: {err}"),
        }
        match session.open_chat(chat_id).await {
            Ok(page) => info!(chat_id = %chat_id, loaded = page.len(), "chat opened"),
            Err(err) => warn!(chat_id = %chat_id, "initial page load failed: {err}"),
        }
    }

    run_console(&session, args.chat.as_ref()).await;

    for reporter in &reporters {
        reporter.abort();
    }
    session.shutdown().await;
    info!("session closed");
}

fn resolve_config(args: &Args) -> Result<SessionConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => SessionConfig::default(),
    };
    if let Some(server_url) = &args.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(api_url) = &args.api_url {
        config.api_base_url = api_url.clone();
    }
    if args.queue_limit.is_some() {
        config.outbound_queue_limit = args.queue_limit;
    }
    config.validate()?;
    Ok(config)
}

async fn run_console(session: &Session, chat: Option<&ChatId>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                warn!("stdin read failed: {err}");
                return;
            }
        };

        let command = ConsoleCommand::parse(&line);
        if command == ConsoleCommand::Quit {
            return;
        }
        let Some(chat_id) = chat else {
            if command != ConsoleCommand::Nothing {
                warn!("no chat selected; start with --chat to send");
            }
            continue;
        };

        let outcome = match command {
            ConsoleCommand::Say(text) => session.submit_message(chat_id.clone(), text).await.map(|_| ()),
            ConsoleCommand::Older => session.load_older(chat_id).await.map(|page| {
                info!(chat_id = %chat_id, loaded = page.len(), "older history loaded");
            }),
            ConsoleCommand::Typing => {
                session.notify_typing(chat_id, true);
                Ok(())
            }
            ConsoleCommand::Retry(local_id) => session.retry_message(chat_id, &local_id).await.map(|_| ()),
            ConsoleCommand::Read => {
                session.mark_read(chat_id);
                Ok(())
            }
            ConsoleCommand::Quit | ConsoleCommand::Nothing => Ok(()),
        };
        if let Err(err) = outcome {
            warn!(chat_id = %chat_id, "{err}");
        }
    }
}

fn spawn_state_reporter(session: &Session) -> JoinHandle<()> {
    let mut states = session.subscribe_connection_state();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            info!(%state, "connection");
        }
    })
}

fn spawn_presence_reporter(session: &Session) -> JoinHandle<()> {
    let mut diffs = session.subscribe_presence();
    tokio::spawn(async move {
        while let Some(diff) = diffs.recv().await {
            info!(?diff, "presence");
        }
    })
}

fn spawn_timeline_reporter(session: &Session, chat_id: &ChatId) -> JoinHandle<()> {
    let mut diffs = session.subscribe_timeline(chat_id);
    tokio::spawn(async move {
        while let Some(diff) = diffs.recv().await {
            match diff {
                TimelineDiff::Inserted(message) | TimelineDiff::Updated(message) => info!(
                    local_id = %message.local_id,
                    sender = %message.sender_id,
                    state = ?message.state,
                    "{}",
                    message.content
                ),
                TimelineDiff::Removed { local_id, .. } => info!(%local_id, "merged duplicate"),
            }
        }
    })
}

fn init_logging(log_path: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_path) = log_path else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
