//! LLM-UI - console front-end
//!
//! Loads one session per configured character, starts a run for the chosen
//! character and forwards stdin lines to it as user turns.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llm_ui::inference::controller::SHUTDOWN_TIMEOUT;
use llm_ui::inference::{ChannelSink, LlamaCppLoader, SessionEvent, SessionRegistry, StatusEvent};
use llm_ui::storage::config::{load_config, AppConfig};
use llm_ui::storage::init_storage;
use llm_ui::storage::models::scan_models_directory;

#[derive(Debug, Parser)]
#[command(name = "llm-ui", version, about = "Chat with local language models")]
struct Args {
    /// Configuration file (defaults to the platform data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model file, overriding the configured one
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Prompt, overriding the character's configured prompt
    #[arg(short, long)]
    prompt: Option<String>,

    /// Character slot to talk to
    #[arg(long, default_value_t = 0)]
    character: usize,
}

enum Command {
    Pause,
    Resume,
    Stop,
    Regenerate,
    Start,
    Quit,
    Turn(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        match line.trim() {
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/stop" => Command::Stop,
            "/regen" => Command::Regenerate,
            "/start" => Command::Start,
            "/quit" => Command::Quit,
            _ => Command::Turn(line.to_string()),
        }
    }
}

/// Falls back to the first discovered model when the configured one is missing
fn pick_model(config: &mut AppConfig) {
    if config.model_path().is_file() {
        return;
    }
    match scan_models_directory(&config.model_dir) {
        Ok(models) => {
            if let Some(first) = models.first() {
                warn!(
                    "Model {} not found, using {}",
                    config.model_path().display(),
                    first.filename
                );
                config.model_file = first.filename.clone();
            }
        }
        Err(e) => warn!("Model discovery failed: {}", e),
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Token { text, .. } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::Status {
            status: StatusEvent::Regenerating,
            ..
        } => println!("\n[regenerating]"),
        SessionEvent::Status {
            status: StatusEvent::Paused,
            ..
        } => println!("\n[paused]"),
        SessionEvent::Status { slot, status } => {
            tracing::debug!(slot, ?status, "Status");
            if *status == StatusEvent::Stopped {
                println!("\n[stopped]");
            }
        }
        SessionEvent::Error { slot, message } => eprintln!("\n[slot {}] error: {}", slot, message),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber for logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llm_ui=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting LLM-UI v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    if args.config.is_none() {
        if let Err(e) = init_storage() {
            warn!("Failed to initialize storage: {}", e);
        }
    }

    let mut config = load_config(args.config.as_deref());
    if let Some(model) = &args.model {
        config.set_model_path(model);
    }
    pick_model(&mut config);

    let slot = args.character;
    let prompt = match (&args.prompt, config.characters.get(slot)) {
        (_, None) => {
            return Err(format!(
                "character {} not configured ({} available)",
                slot,
                config.characters.len()
            )
            .into())
        }
        (Some(prompt), Some(_)) => prompt.clone(),
        (None, Some(character)) => character.prompt.clone(),
    };
    if let Some(persona) = config.persona(slot) {
        info!(user = %persona.user_name, character = %persona.character_name, "Talking to slot {}", slot);
    }

    let (sink, mut events) = ChannelSink::new();
    let mut registry = SessionRegistry::new(Arc::new(sink));

    // Loading blocks until every worker has its model
    let loader = Arc::new(LlamaCppLoader::new(config.gpu_layers));
    let setups = config.session_setups();
    let mut registry = tokio::task::spawn_blocking(move || {
        registry.reload(loader, setups).map(|_| registry)
    })
    .await??;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    registry.start(slot, &prompt)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match Command::parse(&line) {
            Command::Pause => registry.pause(slot),
            Command::Resume => registry.resume(slot),
            Command::Stop => registry.stop(slot),
            Command::Regenerate => registry.regenerate(slot),
            Command::Start => registry.start(slot, &prompt),
            Command::Quit => break,
            Command::Turn(text) => match registry.get(slot) {
                Ok(session) if !session.is_busy() => {
                    println!("[idle] type /start to run the prompt again");
                    Ok(())
                }
                _ => registry.submit_input(slot, &text),
            },
        };
        match result {
            Err(e) if e.is_recoverable() => warn!(slot, "Command rejected: {}", e),
            Err(e) => error!(slot, "Command failed: {}", e),
            Ok(()) => {}
        }
    }

    info!("Shutting down");
    registry.stop_all();
    tokio::task::spawn_blocking(move || {
        if !registry.wait_all_idle(SHUTDOWN_TIMEOUT) {
            warn!("Sessions did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
        registry.shutdown();
    })
    .await?;

    printer.await?;
    Ok(())
}
