use clap::{Parser, Subcommand};
use parley::chat::{Chat, ChatSnapshot};
use parley::message::{Role, Status};
use parley::mode::Mode;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config.json and the data directory.
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat interactively. Replies stream as they arrive; type /help for commands.
    Chat {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Skip the session probe and simulate replies locally.
        #[arg(long)]
        guest: bool,

        /// Existing thread id to continue.
        #[arg(long, value_name = "ID")]
        thread: Option<String>,

        /// Probe backend reachability every N seconds and follow it online/offline.
        #[arg(long, value_name = "SECS")]
        probe_interval: Option<u64>,
    },

    /// List messages waiting in the offline outbox (one JSON object per line).
    Outbox {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            guest,
            thread,
            probe_interval,
        }) => {
            if let Err(e) = run_chat(config, guest, thread, probe_interval).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Outbox { config }) => {
            if let Err(e) = run_outbox(config).await {
                log::error!("outbox failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(parley::config::default_config_path);
    let dir = parley::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_outbox(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = parley::config::load_config(config_path)?;
    parley::init::require_initialized(&path, &config)?;
    let store = parley::store::Store::open(parley::config::resolve_data_dir(&config, &path)).await?;
    let outbox = parley::outbox::Outbox::new(store.outbox.clone());
    let entries = outbox.list_all().await?;
    for e in &entries {
        println!("{}", serde_json::to_string(e)?);
    }
    eprintln!("{} queued", entries.len());
    Ok(())
}

const HELP: &str = "\
commands:
  /new              start a new thread
  /threads          list threads
  /switch <n|id>    switch thread (index from /threads, or id)
  /rename <title>   rename the active thread
  /clear            delete the active thread's messages
  /retry            resend the last failed message
  /stop             stop streaming replies
  /online /offline  force the connectivity signal
  /outbox           show queued messages
  /sync             replay the outbox now
  /exit             quit";

async fn run_chat(
    config_path: Option<PathBuf>,
    guest: bool,
    thread: Option<String>,
    probe_interval: Option<u64>,
) -> anyhow::Result<()> {
    let (config, path) = parley::config::load_config(config_path)?;
    parley::init::require_initialized(&path, &config)?;
    let (chat, api) = Chat::connect(&config, &path, guest).await?;

    match chat.mode() {
        Mode::Guest => println!("guest mode: replies are simulated locally"),
        Mode::User(user) => println!("signed in as {}", user.email),
    }
    let _sync = chat.start_background_sync();
    let probe_cancel = CancellationToken::new();
    if let Some(secs) = probe_interval.filter(|s| *s > 0) {
        if !chat.mode().is_guest() {
            chat.connectivity()
                .spawn_probe(api, Duration::from_secs(secs), probe_cancel.clone());
        }
    }
    if !chat.mode().is_guest() && chat.connectivity().is_online() {
        let report = chat.sync_offline_queue().await;
        if !report.sent.is_empty() {
            println!("replayed {} queued message(s)", report.sent.len());
        }
    }
    if let Some(t) = thread {
        chat.set_thread(&t).await?;
        print_history(&chat.snapshot());
    }

    let printer = tokio::spawn(print_replies(chat.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type /help for commands");

    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                if chat.snapshot().streaming {
                    chat.stop();
                    continue;
                }
                None
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.starts_with('/') {
            if let Err(e) = run_command(&chat, input).await {
                eprintln!("error: {}", e);
            }
            continue;
        }
        // The reply prints from the snapshot stream; the task handle is not needed.
        let _ = chat.send_message(None, input, Vec::new()).await;
    }

    probe_cancel.cancel();
    chat.stop();
    printer.abort();
    Ok(())
}

async fn run_command(chat: &Arc<Chat>, input: &str) -> anyhow::Result<()> {
    let (cmd, arg) = match input.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (input, ""),
    };
    match cmd {
        "/help" => println!("{}", HELP),
        "/new" => {
            let id = chat.new_thread().await?;
            println!("new thread {}", id);
        }
        "/threads" => {
            let active = chat.active_thread();
            for (i, t) in chat.threads().iter().enumerate() {
                let mark = if active.as_deref() == Some(t.thread_id.as_str()) { '*' } else { ' ' };
                let note = if t.provisional { " (not yet on server)" } else { "" };
                println!("{} {:>2}. {}  [{}]{}", mark, i + 1, t.title, t.thread_id, note);
            }
        }
        "/switch" => {
            let threads = chat.threads();
            let target = match arg.parse::<usize>() {
                Ok(n) if n >= 1 && n <= threads.len() => threads[n - 1].thread_id.clone(),
                _ if !arg.is_empty() => arg.to_string(),
                _ => anyhow::bail!("usage: /switch <n|id>"),
            };
            chat.set_thread(&target).await?;
            print_history(&chat.snapshot());
        }
        "/rename" => {
            let Some(active) = chat.active_thread() else {
                anyhow::bail!("no active thread");
            };
            if arg.is_empty() {
                anyhow::bail!("usage: /rename <title>");
            }
            chat.rename_thread(&active, arg);
        }
        "/clear" => {
            chat.clear().await?;
            println!("cleared");
        }
        "/retry" => {
            let snap = chat.snapshot();
            let failed = snap
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User && m.status == Status::Error);
            match failed {
                Some(m) => {
                    let _ = chat.retry_message(&m.id).await;
                }
                None => println!("nothing to retry"),
            }
        }
        "/stop" => chat.stop(),
        "/online" => chat.connectivity().set_online(true),
        "/offline" => chat.connectivity().set_online(false),
        "/outbox" => {
            let entries = chat.outbox().list_all().await?;
            for e in &entries {
                println!("- [{}] {}", e.thread_id, e.content);
            }
            println!("{} queued", entries.len());
        }
        "/sync" => {
            let report = chat.sync_offline_queue().await;
            if report.skipped {
                println!("a sync is already running");
            } else {
                println!("sent {}, remaining {}", report.sent.len(), report.remaining);
                if let Some(reason) = report.halted {
                    println!("stopped: {}", reason);
                }
            }
        }
        other => println!("unknown command {} (try /help)", other),
    }
    Ok(())
}

fn prompt() {
    let mut out = std::io::stdout();
    let _ = write!(out, "> ");
    let _ = out.flush();
}

fn print_history(snap: &ChatSnapshot) {
    for m in &snap.messages {
        let who = match m.role {
            Role::User => ">",
            Role::Assistant => "<",
            Role::System => "#",
        };
        println!("{} {}", who, m.content.trim());
    }
}

/// Print assistant replies incrementally as tokens arrive. Only replies first seen while
/// pending are followed, so hydrated history is not echoed twice.
async fn print_replies(mut rx: watch::Receiver<ChatSnapshot>) {
    let mut printed: HashMap<String, String> = HashMap::new();
    let mut finished: HashSet<String> = HashSet::new();
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        let mut out = std::io::stdout();
        for m in snap.messages.iter().filter(|m| m.role == Role::Assistant) {
            if finished.contains(&m.id) {
                continue;
            }
            if !printed.contains_key(&m.id) {
                if m.status != Status::Pending {
                    finished.insert(m.id.clone());
                    continue;
                }
                printed.insert(m.id.clone(), String::new());
                let _ = write!(out, "\n< ");
            }
            let Some(shown) = printed.get_mut(&m.id) else {
                continue;
            };
            if !m.content.starts_with(shown.as_str()) {
                // Content was replaced, e.g. by the fallback transport.
                let _ = write!(out, "\n< ");
                shown.clear();
            }
            let _ = write!(out, "{}", &m.content[shown.len()..]);
            shown.clone_from(&m.content);
            if m.status != Status::Pending {
                let _ = writeln!(out);
                finished.insert(m.id.clone());
                printed.remove(&m.id);
            }
        }
        let _ = out.flush();
    }
}
