use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod engine;
mod handler;
mod ollama;
mod session;
mod state;
mod tui;
mod ui;

use app::App;
use config::{Config, Overrides, Settings};
use ollama::OllamaClient;
use session::Session;

#[derive(Parser)]
#[command(name = "local-chat", version)]
#[command(about = "Chat with a locally running language model")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Model to load (overrides LOCAL_CHAT_MODEL and the config file)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Ollama base URL (overrides OLLAMA_HOST and the config file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// System prompt that seeds the conversation
    #[arg(long, global = true)]
    system_prompt: Option<String>,

    /// Give up loading the model after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    init_timeout: Option<u64>,

    /// Remember --model as the default for future runs
    #[arg(long, requires = "model")]
    save: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the chat interface (default)
    Chat,
    /// List models installed in Ollama
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging()?;

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring unreadable config file");
        Config::new()
    });

    if cli.save {
        if let Some(model) = &cli.model {
            Config::save_default_model(model)?;
        }
    }

    let settings = Settings::resolve(
        Overrides {
            model: cli.model,
            ollama_url: cli.host,
            system_prompt: cli.system_prompt,
            init_timeout_secs: cli.init_timeout,
        },
        &config,
        |key| std::env::var(key).ok(),
    );

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(settings).await,
        Commands::Models => list_models(&settings).await,
    }
}

/// Log to a file: the terminal belongs to the TUI
fn init_logging() -> Result<WorkerGuard> {
    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "local-chat.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("local_chat=info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(guard)
}

fn log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("local-chat")
}

async fn run_chat(settings: Settings) -> Result<()> {
    info!(model = %settings.model, url = %settings.ollama_url, "starting chat");

    let ollama = OllamaClient::new(&settings.ollama_url);
    let (session, session_events) = Session::new(settings.session_config(), Arc::new(ollama));

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = tui::EventHandler::new(session_events);
    let mut app = App::new(session);

    app.session.initialize();

    let result = async {
        while !app.should_quit {
            terminal.draw(|frame| ui::render(&mut app, frame))?;

            match events.next().await {
                Some(event) => handler::handle_event(&mut app, event),
                None => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    let restored = tui::restore();
    shutdown(&mut app.session, restored).await?;
    result
}

/// Release the engine even when the terminal could not be restored
async fn shutdown(session: &mut Session, restored: Result<()>) -> Result<()> {
    if let Err(e) = &restored {
        error!(error = %e, "failed to restore terminal");
    }
    session.dispose().await;
    info!("chat closed");
    restored
}

async fn list_models(settings: &Settings) -> Result<()> {
    let ollama = OllamaClient::new(&settings.ollama_url);

    let models = ollama.list_models().await.with_context(|| {
        format!(
            "Could not reach Ollama at {}. Make sure Ollama is running with: ollama serve",
            settings.ollama_url
        )
    })?;

    if models.is_empty() {
        println!("No models found. Pull one with: ollama pull {}", settings.model);
    } else {
        for model in models {
            let marker = if model == settings.model { "*" } else { " " };
            println!("{} {}", marker, model);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ready_session;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_save_requires_model() {
        assert!(Cli::try_parse_from(["local-chat", "--save"]).is_err());

        let cli = Cli::try_parse_from(["local-chat", "--save", "--model", "qwen2.5:0.5b"]).unwrap();
        assert!(cli.save);
        assert_eq!(cli.model.as_deref(), Some("qwen2.5:0.5b"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["local-chat", "models", "--host", "http://gpu:11434", "--init-timeout", "30"])
            .unwrap();
        assert!(matches!(cli.command, Some(Commands::Models)));
        assert_eq!(cli.host.as_deref(), Some("http://gpu:11434"));
        assert_eq!(cli.init_timeout, Some(30));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_engine_when_restore_fails() {
        let (mut session, _rx, engine) = ready_session(vec![]).await;

        let result = shutdown(&mut session, Err(anyhow::anyhow!("terminal gone"))).await;
        assert!(result.is_err());
        assert!(engine.disposed.load(Ordering::SeqCst));
    }
}
