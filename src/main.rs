//! Sessionwire CLI - attach to container terminals and headless agent
//! conversations from the command line.
//!
//! See the `sessionwire` library for the protocol layer itself.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use mimalloc::MiMalloc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use sessionwire::headless::ConversationBindings;
use sessionwire::history::HistoryProgress;
use sessionwire::terminal::TerminalSink;
use sessionwire::{
    spawn_channel, ApiClient, ApiProbe, AttachMode, ChannelEvent, ChannelEventKind, ChannelFactory,
    ChannelLink, Config, ConnectionState, FileStorage, HeadlessSession, HeadlessUpdate,
    Multiplexer, Removal, SessionRegistry, Target, TargetProbe, TerminalEvent,
};

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long to let channel tasks flush their close frames on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// How often the attach loop checks the terminal size and pending refits.
const LAYOUT_TICK: Duration = Duration::from_millis(50);

const CTRL_N: u8 = 0x0e;
const CTRL_Q: u8 = 0x11;
const CTRL_T: u8 = 0x14;
const CTRL_W: u8 = 0x17;

#[derive(Parser)]
#[command(name = "sessionwire")]
#[command(about = "Realtime terminal and agent sessions for remote containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Server URL (overrides config and SESSIONWIRE_SERVER_URL).
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Bearer token (overrides config and SESSIONWIRE_TOKEN).
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a container's terminal tabs.
    ///
    /// Ctrl-T opens a tab, Ctrl-N switches to the next one, Ctrl-W closes
    /// the active tab and its shell, Ctrl-Q detaches and leaves every shell
    /// running.
    Attach {
        /// Container id.
        container_id: String,
    },
    /// Send one prompt to an agent and stream the turn.
    Prompt {
        /// Prompt text.
        prompt: String,
        /// Container to create or attach a headless session in.
        #[arg(long, conflicts_with = "conversation", required_unless_present = "conversation")]
        container: Option<String>,
        /// Existing conversation to attach to.
        #[arg(long)]
        conversation: Option<String>,
        /// Start a fresh session instead of resuming.
        #[arg(long)]
        fresh: bool,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Working directory inside the container.
        #[arg(long)]
        work_dir: Option<String>,
        /// Print raw events and the final turn as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Show or clear the saved tabs for a container.
    Tabs {
        /// Container id.
        container_id: String,
        /// Forget the saved tabs.
        #[arg(long)]
        clear: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }

    match cli.command {
        Commands::Tabs {
            container_id,
            clear,
        } => run_tabs(&config, &container_id, clear),
        Commands::Attach { container_id } => runtime()?.block_on(run_attach(config, container_id)),
        Commands::Prompt {
            prompt,
            container,
            conversation,
            fresh,
            model,
            work_dir,
            json,
        } => {
            let target = match (container, conversation) {
                (_, Some(conversation)) => Target::conversation(conversation),
                (Some(container), None) => Target::headless(container),
                (None, None) => anyhow::bail!("--container or --conversation is required"),
            };
            let attach = if fresh {
                AttachMode::StartFresh
            } else {
                AttachMode::Resume
            };
            let model = model.or_else(|| config.model.clone());
            let work_dir = work_dir.or_else(|| config.work_dir.clone());
            let request = PromptRequest {
                target,
                attach,
                prompt,
                model,
                work_dir,
                json,
            };
            runtime()?.block_on(run_prompt(config, request))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

fn registry(config: &Config) -> Result<SessionRegistry<FileStorage>> {
    let dir = Config::registry_dir(&Config::config_dir()?);
    Ok(SessionRegistry::new(FileStorage::new(dir)).with_window(config.window.clone()))
}

fn probe(config: &Config) -> Result<Arc<dyn TargetProbe>> {
    let api = Arc::new(ApiClient::new(
        config.server_url.clone(),
        config.bearer_token(),
    )?);
    Ok(Arc::new(ApiProbe::new(api)))
}

fn run_tabs(config: &Config, container_id: &str, clear: bool) -> Result<()> {
    let registry = registry(config)?;
    if clear {
        registry.clear(container_id)?;
        println!("Cleared saved tabs for {container_id}");
        return Ok(());
    }

    let records = registry.load(container_id);
    if records.is_empty() {
        println!("No saved tabs for {container_id}");
    }
    for record in records {
        println!("{}\t{}", record.tab_key, record.session_id);
    }
    Ok(())
}

/// Writes the active tab's output to stdout.
struct StdoutSink {
    visible: bool,
}

impl TerminalSink for StdoutSink {
    fn write(&mut self, data: &str) {
        if self.visible {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(data.as_bytes());
            let _ = stdout.flush();
        }
    }

    fn clear(&mut self) {
        if self.visible {
            let _ = crossterm::execute!(
                std::io::stdout(),
                crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
                crossterm::cursor::MoveTo(0, 0)
            );
        }
    }

    fn history_progress(&mut self, progress: &HistoryProgress) {
        if self.visible {
            let title = if progress.loading {
                format!("sessionwire - replaying {}%", progress.percent)
            } else {
                "sessionwire".to_string()
            };
            let _ = crossterm::execute!(std::io::stdout(), crossterm::terminal::SetTitle(title));
        }
    }
}

/// Print a status line without disturbing raw mode.
fn notice(message: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "\r\n[sessionwire] {message}\r\n");
    let _ = stdout.flush();
}

async fn run_attach(config: Config, container_id: String) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEvent>();
    let factory = ChannelFactory::new(config.channel_settings(), probe(&config)?, events_tx);
    let mut mux = Multiplexer::new(container_id.clone(), factory, registry(&config)?);

    let (mut cols, mut rows) = crossterm::terminal::size().context("Failed to read terminal size")?;
    mux.set_viewport(cols, rows, Instant::now());
    let keys = mux.init();
    log::info!("Attached to {} with tabs {:?}", container_id, keys);

    enable_raw_mode().context("Failed to enable raw mode")?;
    let _raw_mode = scopeguard::guard((), |()| {
        let _ = disable_raw_mode();
    });

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    let mut layout_tick = tokio::time::interval(LAYOUT_TICK);
    layout_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'attach: loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let active = mux.active_key() == Some(event.channel_id.as_str());
                match event.kind {
                    ChannelEventKind::State(state) => {
                        mux.on_channel_state(&event.channel_id, state);
                        if active && state == ConnectionState::Reconnecting {
                            notice("connection lost, reconnecting...");
                        }
                    }
                    ChannelEventKind::Frame(frame) => {
                        let mut sink = StdoutSink { visible: active };
                        handle_terminal_event(
                            &event.channel_id,
                            mux.route_frame(&event.channel_id, &frame, &mut sink),
                        );
                    }
                    ChannelEventKind::Failed(error) => {
                        if active || error.is_fatal() {
                            notice(&format!("{}: {error}", event.channel_id));
                        }
                    }
                }
            }

            read = stdin.read(&mut buf) => {
                let n = read.context("Failed to read stdin")?;
                if n == 0 {
                    break 'attach;
                }
                for action in split_keys(&buf[..n]) {
                    match action {
                        KeyAction::Text(text) => {
                            mux.insert_text(&text);
                        }
                        KeyAction::NewTab => {
                            let key = mux.create_tab();
                            notice(&format!("opened {key}"));
                        }
                        KeyAction::NextTab => {
                            if let Some(key) = next_tab(&mux) {
                                mux.activate(&key);
                                notice(&format!("switched to {key}"));
                            }
                        }
                        KeyAction::CloseTab => {
                            if let Some(key) = mux.active_key().map(str::to_string) {
                                mux.remove(&key, Removal::Explicit);
                                notice(&format!("closed {key}"));
                            }
                            if mux.tabs().is_empty() {
                                break 'attach;
                            }
                        }
                        KeyAction::Detach => {
                            mux.detach_all();
                            break 'attach;
                        }
                    }
                }
            }

            _ = layout_tick.tick() => {
                if let Ok(size) = crossterm::terminal::size() {
                    if size != (cols, rows) {
                        (cols, rows) = size;
                        mux.set_viewport(cols, rows, Instant::now());
                    }
                }
                mux.poll(Instant::now());
            }
        }
    }

    // Dropping the tabs drops the last event senders once every task exits;
    // until then give the tasks a chance to flush close frames.
    drop(mux);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(event) = events.recv().await {
            log::trace!("Draining {:?}", event.kind);
        }
    })
    .await;
    Ok(())
}

fn handle_terminal_event(tab_key: &str, event: Option<TerminalEvent>) {
    match event {
        Some(TerminalEvent::SessionAssigned(session_id)) => {
            log::info!("{} attached to session {}", tab_key, session_id);
        }
        Some(TerminalEvent::SessionClosed(_)) => notice(&format!("{tab_key}: session ended")),
        Some(TerminalEvent::Error(error)) => notice(&format!("{tab_key}: {error}")),
        Some(
            TerminalEvent::Monitoring(value)
            | TerminalEvent::TaskUpdate(value)
            | TerminalEvent::StrategyTriggered(value),
        ) => log::debug!("{} status: {}", tab_key, value),
        None => {}
    }
}

fn next_tab<F, S>(mux: &Multiplexer<F, S>) -> Option<String>
where
    F: sessionwire::multiplexer::LinkFactory,
    S: sessionwire::registry::Storage,
{
    let tabs = mux.tabs();
    let current = tabs.iter().position(|t| Some(t.key()) == mux.active_key())?;
    tabs.get((current + 1) % tabs.len()).map(|t| t.key().to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Text(String),
    NewTab,
    NextTab,
    CloseTab,
    Detach,
}

/// Split raw stdin bytes into text runs and control-key actions.
fn split_keys(bytes: &[u8]) -> Vec<KeyAction> {
    let mut actions = Vec::new();
    let mut start = 0;
    for (i, byte) in bytes.iter().enumerate() {
        let action = match *byte {
            CTRL_T => KeyAction::NewTab,
            CTRL_N => KeyAction::NextTab,
            CTRL_W => KeyAction::CloseTab,
            CTRL_Q => KeyAction::Detach,
            _ => continue,
        };
        if start < i {
            actions.push(KeyAction::Text(
                String::from_utf8_lossy(&bytes[start..i]).into_owned(),
            ));
        }
        actions.push(action);
        start = i + 1;
    }
    if start < bytes.len() {
        actions.push(KeyAction::Text(
            String::from_utf8_lossy(&bytes[start..]).into_owned(),
        ));
    }
    actions
}

struct PromptRequest {
    target: Target,
    attach: AttachMode,
    prompt: String,
    model: Option<String>,
    work_dir: Option<String>,
    json: bool,
}

async fn run_prompt(config: Config, request: PromptRequest) -> Result<()> {
    const CHANNEL_ID: &str = "headless";

    let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEvent>();
    let handle = spawn_channel(
        CHANNEL_ID,
        request.target,
        config.channel_settings(),
        probe(&config)?,
        events_tx,
    );
    let mut session = HeadlessSession::new(handle.clone(), request.attach)
        .with_work_dir(request.work_dir);
    let mut bindings = ConversationBindings::new();

    let mut updates = session
        .send_prompt(request.prompt, "user", request.model)
        .map_err(|e| anyhow::anyhow!(e))?;

    let outcome = 'prompt: loop {
        for update in updates.drain(..) {
            match update {
                HeadlessUpdate::Session {
                    conversation_id: Some(conversation_id),
                    ..
                } => {
                    bindings.bind(&conversation_id, CHANNEL_ID);
                }
                HeadlessUpdate::TurnEvent { event, .. } => print_event(&event, request.json),
                HeadlessUpdate::TurnFinished { turn_id, .. } => {
                    let ours = !session.has_pending_prompt()
                        && session.turns().last().is_some_and(|t| t.id == turn_id);
                    if ours {
                        break 'prompt Ok(());
                    }
                }
                HeadlessUpdate::Error { message, .. } => {
                    break 'prompt Err(anyhow::anyhow!("server error: {message}"));
                }
                HeadlessUpdate::RawOutput(text) => println!("{text}"),
                HeadlessUpdate::State(_)
                | HeadlessUpdate::Session { .. }
                | HeadlessUpdate::TurnsChanged
                | HeadlessUpdate::HistoryPrepended { .. }
                | HeadlessUpdate::ModeSwitched { .. }
                | HeadlessUpdate::ShowTerminal => {}
            }
        }

        let Some(event) = events.recv().await else {
            break 'prompt Err(anyhow::anyhow!("channel closed"));
        };
        updates = match event.kind {
            ChannelEventKind::State(state) => session.on_connection(state),
            ChannelEventKind::Frame(frame) => session.handle_frame(&frame),
            ChannelEventKind::Failed(error) if error.is_fatal() => {
                break 'prompt Err(anyhow::anyhow!(error));
            }
            ChannelEventKind::Failed(error) => {
                log::warn!("{}", error);
                Vec::new()
            }
        };
    };

    handle.disconnect();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(event) = events.recv().await {
            if event.kind == ChannelEventKind::State(ConnectionState::Disconnected) {
                break;
            }
        }
    })
    .await;

    outcome?;
    if let Some(conversation_id) = session.conversation_id() {
        log::info!(
            "Conversation {} served by {:?}",
            conversation_id,
            bindings.channel_for(conversation_id)
        );
    }
    let Some(turn) = session.turns().last() else {
        return Ok(());
    };
    if request.json {
        println!("{}", serde_json::to_string(turn)?);
    } else {
        println!(
            "\n[{} in / {} out tokens, ${:.4}, {}ms]",
            turn.metrics.input_tokens,
            turn.metrics.output_tokens,
            turn.metrics.cost_usd,
            turn.metrics.duration_ms
        );
    }
    match &turn.error {
        Some(error) => anyhow::bail!("turn failed: {error}"),
        None => Ok(()),
    }
}

fn print_event(event: &serde_json::Value, json: bool) {
    if json {
        println!("{event}");
        return;
    }
    let text = ["text", "delta", "content"]
        .iter()
        .find_map(|field| event.get(*field).and_then(serde_json::Value::as_str));
    match text {
        Some(text) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        None => log::debug!("event: {}", event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keys_separates_controls() {
        assert_eq!(
            split_keys(b"ls\r\x14pwd\x11"),
            vec![
                KeyAction::Text("ls\r".to_string()),
                KeyAction::NewTab,
                KeyAction::Text("pwd".to_string()),
                KeyAction::Detach,
            ]
        );
    }

    #[test]
    fn test_split_keys_plain_text() {
        assert_eq!(
            split_keys(b"echo hi"),
            vec![KeyAction::Text("echo hi".to_string())]
        );
        assert!(split_keys(b"").is_empty());
    }

    #[test]
    fn test_cli_requires_a_target() {
        assert!(Cli::try_parse_from(["sessionwire", "prompt", "hi"]).is_err());
        assert!(Cli::try_parse_from(["sessionwire", "prompt", "hi", "--container", "c1"]).is_ok());
        assert!(Cli::try_parse_from([
            "sessionwire",
            "prompt",
            "hi",
            "--container",
            "c1",
            "--conversation",
            "x"
        ])
        .is_err());
    }
}
