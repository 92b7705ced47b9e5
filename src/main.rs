#![deny(dead_code)]
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::{wrappers::WatchStream, StreamExt};

use teamsync::credentials::{self, StoredSession};
use teamsync::sync::last_seen_label;
use teamsync::utils;
use teamsync::{
    Command, DeliveryState, HttpApi, Notice, Peer, SessionView, SocketIoConnector, SyncConfig, SyncError,
    SyncSession,
};

/// Command line arguments for TeamSync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "TeamSync: a command-line client for team chat and presence.",
    long_about = "TeamSync keeps a live view of your team's conversations and presence.\n\n\
    The API endpoint defaults to TEAMSYNC_API_URL; the channel endpoint to TEAMSYNC_SOCKET_URL.\n\
    Type /help once connected to see the available commands."
)]
struct Args {
    /// Base URL of the REST API
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Base URL of the realtime channel (defaults to the API URL)
    #[arg(long, value_name = "URL")]
    socket_url: Option<String>,

    /// Bearer token; skips the stored session and the login prompt
    #[arg(long, env = "TEAMSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Email to log in with when no token is available
    #[arg(long, env = "TEAMSYNC_EMAIL")]
    email: Option<String>,

    /// Where the session token is stored
    #[arg(long, value_name = "PATH")]
    session_file: Option<PathBuf>,

    #[arg(long, value_name = "PATH", default_value = "teamsync.log")]
    log_file: PathBuf,

    /// Seconds before a REST call is abandoned
    #[arg(long, value_name = "SECS")]
    request_timeout: Option<u64>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    if let Some(url) = &args.api_url {
        let socket_url = config.socket_url.take();
        config = SyncConfig::new(url.as_str());
        config.socket_url = socket_url;
    }
    if let Some(url) = &args.socket_url {
        config = config.with_socket_url(url.trim_end_matches('/'));
    }
    if let Some(secs) = args.request_timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    config
}

/// Read one line from stdin without blocking a runtime worker
async fn prompt(label: String) -> Result<String> {
    eprintln!("{}", label);
    tokio::task::spawn_blocking(utils::read_line).await?
}

/// Prompt for email and password and exchange them for a token
async fn login(config: &SyncConfig, email: Option<&str>) -> Result<String> {
    let email = match email {
        Some(email) => email.to_string(),
        None => prompt("Enter email:".to_string()).await?,
    };
    // The terminal echoes what is typed here
    let password = prompt(format!("Enter password for {} (input is visible):", email)).await?;

    let token = HttpApi::login(config, &email, &password)
        .await
        .map_err(|e| SyncError::network("login", e))?;
    info!("Logged in as {}", email);

    if let Err(e) = credentials::save_session(&StoredSession::new(&config.api_url, &email, &token)) {
        warn!("Could not store session: {}", e);
    }
    Ok(token)
}

/// Token from the command line, then the stored session
fn stored_token(args: &Args, config: &SyncConfig) -> Result<Option<String>> {
    if let Some(token) = &args.token {
        return Ok(Some(token.clone()));
    }
    match credentials::load_session()? {
        Some(session) if session.api_url == config.api_url => Ok(session.token()),
        Some(session) => {
            debug!("Stored session is for {}, ignoring", session.api_url);
            Ok(None)
        }
        None => Ok(None),
    }
}

async fn start_session(
    args: &Args,
    config: &SyncConfig,
) -> Result<(SyncSession, mpsc::UnboundedReceiver<Notice>)> {
    let mut token = stored_token(args, config)?;
    // A stored token may have expired; allow one fresh login
    for attempt in 0..2 {
        let current = match token.take() {
            Some(token) => token,
            None => login(config, args.email.as_deref()).await?,
        };
        let api = Arc::new(HttpApi::new(config, current.clone())?);
        let connector = Arc::new(SocketIoConnector::new(config.clone()));
        match SyncSession::start(config.clone(), api, connector, Some(current)).await {
            Ok(started) => return Ok(started),
            Err(SyncError::AuthExpired(reason)) if attempt == 0 && args.token.is_none() => {
                warn!("Stored session rejected: {}", reason);
                println!("Your session expired, please log in again.");
                credentials::clear_session()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow!("Could not sign in"))
}

/// Report why the session ended; a rejected credential is not worth keeping
fn session_ended(e: SyncError) -> anyhow::Error {
    error!("Session ended: {}", e);
    if e.is_fatal() {
        println!("Your session expired, please log in again.");
        if let Err(e) = credentials::clear_session() {
            warn!("Could not clear stored session: {}", e);
        }
    }
    e.into()
}

fn find_peer<'a>(view: &'a SessionView, query: &str) -> Option<&'a Peer> {
    view.users
        .iter()
        .chain(view.conversations.iter())
        .find(|peer| peer.id == query || peer.name.eq_ignore_ascii_case(query))
}

fn print_peers(title: &str, peers: &[Peer], view: &SessionView) {
    println!("{}:", title);
    if peers.is_empty() {
        println!("  (none)");
    }
    let now = Utc::now();
    for peer in peers {
        let unread = view.unread_for(&peer.id);
        let badge = if unread > 0 { format!(" [{} unread]", unread) } else { String::new() };
        let seen = last_seen_label(peer.status_updated_at, now);
        let seen = if seen.is_empty() { seen } else { format!(" ({})", seen) };
        println!("  {} - {}{}{}", peer.name, peer.status, seen, badge);
    }
}

fn print_history(view: &SessionView) {
    let peer = match &view.active_peer {
        Some(peer) => peer,
        None => {
            println!("No conversation open. Use /open <name>.");
            return;
        }
    };
    let me = view.identity.as_ref().map(|me| me.id.as_str()).unwrap_or_default();
    println!("== {} ({}) ==", peer.name, peer.status);
    if view.loading_history {
        println!("Loading messages...");
    }
    for group in view.days() {
        println!("--- {} ---", group.label);
        for entry in group.entries {
            let who = if entry.message.is_from(me) { "You" } else { peer.name.as_str() };
            let state = match entry.message.delivery {
                DeliveryState::Pending => " (sending)",
                DeliveryState::Error => " (failed, /retry to resend)",
                DeliveryState::Sent => "",
            };
            println!("{}: {}{}", who, entry.message.content, state);
            if let Some(time) = entry.time_label {
                println!("    {}", time);
            }
        }
    }
    if view.peer_typing {
        println!("{} is typing...", peer.name);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /users            list all users");
    println!("  /chats            list conversations");
    println!("  /open <name|id>   open a conversation");
    println!("  /show             show the open conversation");
    println!("  /status           punch in or out");
    println!("  /unread           refresh unread counts");
    println!("  /refresh          reload users and conversations");
    println!("  /retry            resend the last failed message");
    println!("  /logout           log out and forget the stored session");
    println!("  /quit             exit");
    println!("Anything else is sent to the open conversation.");
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::NetworkFailure(message) | Notice::SendFailure(message) | Notice::ChannelError(message) => {
            println!("! {}", message)
        }
        Notice::AuthExpired(reason) => println!("! Session expired ({}). Please log in again.", reason),
    }
}

/// Print incoming messages and typing changes as views are published
async fn follow_views(views: watch::Receiver<SessionView>) {
    let mut stream = WatchStream::new(views);
    let mut active: Option<String> = None;
    let mut seen = 0usize;
    let mut typing = false;
    while let Some(view) = stream.next().await {
        if view.ended {
            break;
        }
        let peer = match &view.active_peer {
            Some(peer) => peer,
            None => continue,
        };
        if active.as_deref() != Some(peer.id.as_str()) || view.loading_history {
            active = Some(peer.id.clone());
            seen = view.history.len();
            typing = false;
            continue;
        }
        for message in view.history.iter().skip(seen).filter(|m| m.is_from(&peer.id)) {
            println!("{}: {}", peer.name, message.content);
        }
        seen = view.history.len();
        if view.peer_typing && !typing {
            println!("{} is typing...", peer.name);
        }
        typing = view.peer_typing;
    }
}

/// Turn one input line into session commands. Returns false to quit.
fn handle_line(line: &str, view: &SessionView, commands: &mpsc::UnboundedSender<Command>) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    let send = |command: Command| commands.send(command).map_err(|_| anyhow!("Session has ended"));

    match command {
        "/help" => print_help(),
        "/users" => print_peers("Users", &view.users, view),
        "/chats" => print_peers("Conversations", &view.conversations, view),
        "/show" => print_history(view),
        "/open" => match find_peer(view, rest) {
            Some(peer) => send(Command::OpenConversation(peer.id.clone()))?,
            None => println!("No user named '{}'", rest),
        },
        "/status" => {
            if view.updating_status {
                println!("Status update already in progress");
            } else {
                send(Command::ToggleStatus)?;
            }
        }
        "/unread" => {
            println!("Unread messages: {}", view.total_unread);
            send(Command::RefreshUnread)?;
        }
        "/refresh" => send(Command::RefreshCatalog)?,
        "/retry" => {
            let failed = view
                .history
                .iter()
                .rev()
                .find(|m| m.delivery == DeliveryState::Error)
                .and_then(|m| m.client_id.clone());
            match failed {
                Some(client_id) => send(Command::Retry(client_id))?,
                None => println!("Nothing to retry"),
            }
        }
        "/logout" => {
            credentials::clear_session()?;
            send(Command::Logout)?;
            return Ok(false);
        }
        "/quit" => {
            send(Command::Logout)?;
            return Ok(false);
        }
        _ if command.starts_with('/') => println!("Unknown command {}. Type /help.", command),
        _ => {
            if view.active_peer.is_none() {
                println!("No conversation open. Use /open <name>.");
            } else if view.sending {
                println!("Still sending the previous message");
            } else {
                send(Command::Compose(line.to_string()))?;
                send(Command::Submit)?;
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.to_str(), level)?;
    info!("TeamSync client starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(path) = &args.session_file {
        credentials::set_config_path_override(path.clone())?;
        info!("Session file overridden to: {}", path.display());
    }

    let config = build_config(&args);
    println!("Connecting to {}... please wait...", config.api_url);

    let (session, mut notices) = match start_session(&args, &config).await {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start session: {}", e);
            eprintln!("Error: {}", e);
            return Err(e);
        }
    };

    let views = session.subscribe();
    if let Some(me) = &views.borrow().identity {
        println!("Signed in as {} ({})", me.name, me.status);
    }
    print_help();

    let (commands, command_rx) = mpsc::unbounded_channel();
    let mut runner = tokio::spawn(session.run(command_rx));
    tokio::spawn(follow_views(views.clone()));
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            print_notice(&notice);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => {
                        let _ = commands.send(Command::Logout);
                        break;
                    }
                };
                let view = views.borrow().clone();
                if !handle_line(&line, &view, &commands)? {
                    break;
                }
            }
            result = &mut runner => {
                return match result? {
                    Ok(()) => Ok(()),
                    Err(e) => Err(session_ended(e)),
                };
            }
        }
    }

    match runner.await? {
        Ok(()) => {
            info!("Session closed");
            println!("Goodbye!");
            Ok(())
        }
        Err(e) => Err(session_ended(e)),
    }
}
