//! Process wiring: config, completion client, store, Discord adapter, gateway.

use crate::commands::AdminCommands;
use crate::config::LumiConfig;
use crate::dispatch::Dispatcher;
use crate::gateway::Gateway;
use crate::store::Store;
use crate::window::WindowManager;
use anyhow::Result;
use lumi_channels::{ChannelAdapter, DiscordAdapter};
use lumi_llm::LlmClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

fn config_source(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<defaults>".to_string())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = LumiConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.completion.model,
        endpoint = %cfg.completion.endpoint,
        max_history = cfg.general.max_history,
        store_path = %cfg.store.path,
        config_path = %config_source(path.as_ref()),
        "config ok"
    );

    let mut problems = Vec::new();
    if let Err(e) = LlmClient::new(cfg.completion.api_key().unwrap_or(""), cfg.completion.settings()) {
        problems.push(format!("completion client: {e}"));
    }
    if cfg.discord.bot_token.trim().is_empty() {
        problems.push("discord bot token is missing (set DISCORD_BOT_TOKEN)".to_string());
    }
    match Store::open(&cfg.store.path).await {
        Ok(_) => tracing::info!(store_path = %cfg.store.path, "store ok"),
        Err(e) => problems.push(format!("store: {e}")),
    }

    if problems.is_empty() {
        tracing::info!("doctor ok");
        return Ok(());
    }
    for problem in &problems {
        tracing::error!(%problem, "doctor check failed");
    }
    Err(anyhow::anyhow!(
        "doctor found {} problem(s): {}",
        problems.len(),
        problems.join("; ")
    ))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = LumiConfig::load(config_path).await?;
    tracing::info!(
        bot_name = %cfg.general.bot_name,
        model = %cfg.completion.model,
        endpoint = %cfg.completion.endpoint,
        max_history = cfg.general.max_history,
        command_prefix = %cfg.discord.command_prefix,
        store_path = %cfg.store.path,
        config_path = %config_source(cfg_path.as_ref()),
        "lumi starting"
    );

    let llm = LlmClient::new(cfg.completion.api_key().unwrap_or(""), cfg.completion.settings())?;
    if cfg.discord.bot_token.trim().is_empty() {
        return Err(anyhow::anyhow!(
            "discord bot token is required (set DISCORD_BOT_TOKEN or discord.bot_token)"
        ));
    }
    let store = Store::open(&cfg.store.path).await?;

    let windows = Arc::new(WindowManager::new(cfg.general.max_history));
    let channel: Arc<dyn ChannelAdapter> = Arc::new(DiscordAdapter::new(&cfg.discord.bot_token)?);
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.general.system_prompt.clone(),
        cfg.general.fallback_reply.clone(),
        windows.clone(),
        store.clone(),
        Arc::new(llm),
        channel.clone(),
    ));
    let commands = Arc::new(AdminCommands::new(
        cfg.general.bot_name.clone(),
        store,
        windows,
        channel.clone(),
    ));
    let gateway = Arc::new(Gateway::new(
        cfg.discord.command_prefix.clone(),
        dispatcher,
        commands,
        channel.clone(),
    ));

    let shutdown = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let gateway_handle = tokio::spawn(gateway.run(inbound_rx, shutdown.clone()));

    channel.start(inbound_tx).await?;
    tracing::info!(platform = channel.platform(), "channel adapter started");

    shutdown_signal(shutdown.clone()).await;

    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
