//! Lumi: a Discord companion bot backed by an OpenAI-compatible chat endpoint.

mod commands;
mod config;
mod dispatch;
mod gateway;
mod init;
mod server;
mod store;
#[cfg(test)]
mod testing;
mod window;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "lumi", version, about = "Lumi Discord chat bot")]
struct Cli {
    /// Config file (defaults to ~/.lumi/config.toml when present).
    #[arg(long, global = true, env = "LUMI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to Discord and start chatting (default).
    Serve,
    /// Validate config, credentials, and the store.
    Doctor,
    /// Initialize ~/.lumi with a config template (idempotent).
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("lumi: ignoring unreadable .env file: {e}");
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!("lumi init: already initialized at {}", report.root.display());
            } else {
                println!("lumi init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
            }
            println!("next: set GROQ_API_KEY and DISCORD_BOT_TOKEN, then run `lumi serve`");
            Ok(())
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("info,lumi=debug,lumi_app=debug,lumi_channels=debug,lumi_llm=debug"),
    };
    let log_format = std::env::var("LUMI_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported LUMI_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
