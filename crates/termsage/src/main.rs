//! Chat with TermSage from the terminal.
//!
//! Without a prompt, reads lines from stdin until `/exit` or end of input.
//! Ctrl-C cancels the turn in flight and keeps the conversation as it was.
//!
//! # Examples
//!
//! ```sh
//! # One-shot question on the medium tier defaults
//! termsage "what does this nmap output mean: 22/tcp open ssh"
//!
//! # Interactive, with a config file and a pinned model
//! termsage --config termsage.toml --model ollama:llama3.2:3b
//!
//! # Explain a failed command
//! termsage --explain "nmap -sS 10.10.10.5" --exit-code 1 --stderr "requires root privileges"
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use termsage::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// CTF-aware terminal assistant.
#[derive(Parser)]
#[command(name = "termsage", version)]
struct Cli {
    /// Prompt to send (one-shot mode). Without this, starts a line loop.
    prompt: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Performance tier preset used when no config file is given.
    #[arg(long, default_value = "medium")]
    tier: String,

    /// Model spec: `provider:model` or `model`.
    #[arg(long)]
    model: Option<String>,

    /// Wait for the whole reply instead of streaming it.
    #[arg(long)]
    no_stream: bool,

    /// Explain why this command failed, then exit.
    #[arg(long)]
    explain: Option<String>,

    /// Exit code of the failed command (with --explain).
    #[arg(long, default_value_t = 1)]
    exit_code: i32,

    /// Captured stderr of the failed command (with --explain).
    #[arg(long, default_value = "")]
    stderr: String,
}

fn load_config(cli: &Cli) -> Result<TermSageConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            TermSageConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => cli.tier.parse::<PerformanceTier>()?.config(),
    };
    if let Some(model) = &cli.model {
        config = config.with_model(model.clone());
    }
    if cli.no_stream {
        config = config.with_stream(false);
    }
    Ok(config)
}

/// Prints deltas as they arrive and notes fallbacks.
fn terminal_handler() -> impl EventHandler {
    FnEventHandler::new(|event| {
        match event {
            TurnEvent::TextDelta(text) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            TurnEvent::ProviderFailed {
                provider, error, ..
            } => {
                eprintln!("\n[{provider} failed: {error}; trying the next provider]");
            }
            TurnEvent::Overflow(overflow) => eprintln!("\n[{overflow}]"),
            _ => {}
        }
        None
    })
}

/// One turn, cancellable with Ctrl-C.
async fn run_turn(orchestrator: &mut ProviderOrchestrator, prompt: &str) -> Result<()> {
    let stream = orchestrator.config().stream;
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(terminal_handler());

    tokio::select! {
        result = orchestrator.submit(prompt, stream, &handler) => match result {
            Ok(outcome) => {
                if !stream {
                    print!("{}", outcome.text);
                }
                println!();
                for finding in &outcome.new_findings {
                    eprintln!("[new {}: {}]", finding.kind, finding.value);
                }
            }
            Err(Error::AllProvidersExhausted { failures }) => {
                eprintln!("\nNo provider could answer:");
                for failure in failures {
                    eprintln!("  - {failure}");
                }
            }
            Err(e) => return Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[cancelled]");
        }
    }
    Ok(())
}

async fn print_models(orchestrator: &mut ProviderOrchestrator) {
    let models = orchestrator.list_available_models().await;
    if models.is_empty() {
        println!("No models available");
        return;
    }
    let active = orchestrator.active_model().map(ToString::to_string);
    for (provider, list) in models {
        println!("{provider}:");
        for model in list {
            let spec = format!("{provider}:{model}");
            let marker = if active.as_deref() == Some(spec.as_str()) { "*" } else { " " };
            println!("  {marker} {model}");
        }
    }
}

fn print_findings(orchestrator: &ProviderOrchestrator) {
    let findings = orchestrator.export_findings();
    if findings.is_empty() {
        println!("No findings yet");
    }
    for (kind, list) in findings {
        println!("{kind}:");
        for f in list {
            println!("  {} (confidence {:.2}, from {})", f.value, f.confidence, f.source_message_id);
        }
    }
}

/// Handle a slash command. Returns `false` to leave the loop.
async fn handle_command(orchestrator: &mut ProviderOrchestrator, line: &str) -> Result<bool> {
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    match cmd {
        "/exit" | "/quit" => return Ok(false),
        "/models" => print_models(orchestrator).await,
        "/model" if arg.is_empty() => match orchestrator.active_model() {
            Some(spec) => println!("Current model: {spec}"),
            None => println!("Using each provider's default model"),
        },
        "/model" => {
            if orchestrator.is_model_available(arg).await {
                orchestrator.set_model(arg)?;
                orchestrator.clear_context();
                println!("Switched to {arg}; context cleared");
            } else {
                println!("Model not available: {arg} (see /models)");
            }
        }
        "/providers" => {
            for (name, ok) in orchestrator.check_availability().await {
                println!("  {} {name}", if ok { "+" } else { "-" });
            }
        }
        "/findings" => print_findings(orchestrator),
        "/stats" => println!("{}", orchestrator.context_stats().to_log_string()),
        "/usage" => println!("{}", orchestrator.usage_totals().summary()),
        "/clear" => {
            orchestrator.clear_context();
            println!("Context cleared");
        }
        "/explain" if !arg.is_empty() => match orchestrator.explain_command(arg).await {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{e}"),
        },
        _ => println!(
            "Commands: /models, /model [spec], /providers, /findings, /stats, /usage, \
             /clear, /explain <command>, /exit"
        ),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;
    let mut orchestrator = ProviderOrchestrator::from_config(config)?;

    if let Some(command) = &cli.explain {
        let text = orchestrator
            .explain_failure(command, cli.exit_code, &cli.stderr)
            .await?;
        println!("{text}");
        return Ok(());
    }

    if let Some(prompt) = &cli.prompt {
        run_turn(&mut orchestrator, prompt).await?;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("termsage> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !handle_command(&mut orchestrator, line).await? {
                break;
            }
            continue;
        }
        run_turn(&mut orchestrator, line).await?;
    }

    eprintln!("{}", orchestrator.usage_totals().summary());
    Ok(())
}
