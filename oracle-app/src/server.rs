use crate::config::OracleConfig;
use crate::context::{ContextComposer, ContextLimits};
use crate::oracle::OracleLoop;
use crate::sanitize::ReplySanitizer;
use anyhow::{Context, Result};
use oracle_llm::{CompletionClient, HeuristicCounter};
use oracle_log::{LoggedOp, MemoryReplica, QueueLog};
use oracle_queue::{ChatEvent, LogOp, UserId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Runs a single-node replica fed from stdin with the oracle loop attached.
///
/// Input lines are `<user>: <text>`; `/nick <user> <nickname>` sets a
/// nickname. Oracle replies are printed to stdout as they are posted.
pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OracleConfig::load(config_path).await?;
    let replica = Arc::new(MemoryReplica::new(cfg.queue_config()));
    let client = Arc::new(
        CompletionClient::new(cfg.completion_config()).context("build completion client")?,
    );
    let oracle = OracleLoop::from_config(&cfg, replica.clone(), client.clone())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    let printer = tokio::spawn(print_replies(replica.subscribe(), shutdown.clone()));
    let oracle_task = tokio::spawn(oracle.run(shutdown.clone()));

    tracing::info!(
        admin = %cfg.general.admin,
        model = %client.model(),
        endpoint = %client.endpoint(),
        trigger = %cfg.general.trigger,
        "chat-oracle serving stdin"
    );

    let poll_interval = Duration::from_millis(cfg.oracle.poll_interval_ms);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&replica, &line).await,
                Ok(None) => {
                    tracing::info!("stdin closed; waiting for queued prompts");
                    drain(&*replica, &shutdown, poll_interval).await;
                    shutdown.cancel();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    if let Err(e) = oracle_task.await {
        tracing::error!(error = %e, "oracle loop task failed");
    }
    if let Err(e) = printer.await {
        tracing::error!(error = %e, "reply printer task failed");
    }
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OracleConfig::load(config_path).await?;
    let client = CompletionClient::new(cfg.completion_config()).context("build completion client")?;
    let limits = ContextLimits::from(&cfg.context);
    tracing::info!(
        admin = %cfg.general.admin,
        model = %client.model(),
        endpoint = %client.endpoint(),
        auth = cfg.completion_config().auth.is_some(),
        token_budget = limits.token_budget(),
        max_request_bytes = limits.max_request_bytes,
        max_message_bytes = cfg.transport.max_message_bytes,
        "config ok"
    );
    Ok(())
}

/// One-off completion with persona and prompt only; nothing is queued.
pub async fn ask(config_path: Option<PathBuf>, prompt: &str) -> Result<()> {
    let cfg = OracleConfig::load(config_path).await?;
    let client = CompletionClient::new(cfg.completion_config()).context("build completion client")?;
    let composer = ContextComposer::new(
        cfg.general.persona.clone(),
        ContextLimits::from(&cfg.context),
        Arc::new(HeuristicCounter),
    );
    let context = composer.minimal(prompt);
    tracing::debug!(
        tokens = context.tokens,
        request_bytes = client.request_bytes(&context.messages)?,
        "sending one-off prompt"
    );

    let completion = client.chat(&context.messages).await?;
    let sanitizer = ReplySanitizer::new(
        &cfg.general.trigger,
        &cfg.general.placeholder,
        cfg.queue_config().mention_marker,
        cfg.transport.max_message_bytes,
    )?;
    println!("{}", sanitizer.sanitize(&completion.content, "you").text);
    Ok(())
}

async fn handle_line(replica: &MemoryReplica, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    if let Some(rest) = line.strip_prefix("/nick ") {
        match rest.trim().split_once(char::is_whitespace) {
            Some((user, nick)) => {
                replica.set_nickname(&UserId::new(user), nick.trim()).await;
            }
            None => tracing::warn!(line, "expected `/nick <user> <nickname>`"),
        }
        return;
    }

    let Some((user, text)) = line.split_once(':') else {
        tracing::warn!(line, "expected `<user>: <text>`");
        return;
    };
    let user = user.trim();
    if user.is_empty() {
        tracing::warn!(line, "missing user before `:`");
        return;
    }

    // The host clock stands in for the substrate's time oracle.
    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    replica.set_trusted_time(now).await;
    let outcome = replica
        .submit(LogOp::Chat(ChatEvent::new(user, text.trim())))
        .await;
    tracing::debug!(user, ?outcome, "chat line applied");
}

async fn print_replies(mut events: broadcast::Receiver<LoggedOp>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(entry) => {
                    if let LogOp::Chat(chat) = entry.op {
                        if chat.is_oracle_reply() {
                            println!("{}: {}", chat.from, chat.text);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "reply printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn drain(log: &impl QueueLog, shutdown: &CancellationToken, poll_interval: Duration) {
    loop {
        match log.counters().await {
            Ok(counters) if counters.next_unprocessed().is_none() => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read counters while draining");
                return;
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
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
                tracing::warn!("received ctrl-c; shutting down");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; shutting down");
            }
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to await ctrl-c signal");
                } else {
                    tracing::warn!("received ctrl-c; shutting down");
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}
