use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudsync_core::RemoteClient;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::sync::engine::{RunSummary, SyncEngine};
use crate::sync::journal::Journal;
use crate::sync::local_watcher::{LocalEvent, start_notify_watcher};
use crate::sync::observer::LoggingObserver;
use crate::sync::remote::HttpRemote;

/// Runs per trigger while the previous run reports follow-up work.
const MAX_FOLLOWUP_RUNS: usize = 3;

pub struct DaemonRuntime {
    config: SyncConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: SyncConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.local_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.local_root))?;
        let journal = Journal::open(&config.journal_path)
            .await
            .with_context(|| format!("failed to open journal at {:?}", config.journal_path))?;
        let client = RemoteClient::with_base_url(&config.remote_url, config.token.clone())
            .context("invalid remote url")?;
        let remote = Arc::new(HttpRemote::new(client, config.remote_root.clone()));
        let engine = SyncEngine::new(
            remote,
            Arc::new(journal),
            config.local_root.clone(),
            config.engine.clone(),
        )
        .with_observer(Arc::new(LoggingObserver));

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    /// One sync (plus follow-ups); Ctrl-C stops it at the next job boundary.
    pub async fn run_once(&self) -> anyhow::Result<RunSummary> {
        let cancel = CancellationToken::new();
        let signal = spawn_shutdown_listener(cancel.clone());
        let result = self
            .engine
            .run_until_settled(&cancel, MAX_FOLLOWUP_RUNS)
            .await;
        signal.abort();
        Ok(result?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            local_root = %self.config.local_root.display(),
            remote_root = %self.config.remote_root,
            local_watcher = self.config.enable_local_watcher,
            "daemon started"
        );
        let cancel = CancellationToken::new();
        let signal = spawn_shutdown_listener(cancel.clone());

        let (_watcher, mut events) = if self.config.enable_local_watcher {
            let exclusions = self.engine.exclusions().await?;
            match start_notify_watcher(&self.config.local_root, exclusions) {
                Ok((watcher, events)) => (Some(watcher), Some(events)),
                Err(err) => {
                    tracing::warn!(error = %err, "local watcher unavailable, polling only");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        loop {
            if let Err(err) = self
                .engine
                .run_until_settled(&cancel, MAX_FOLLOWUP_RUNS)
                .await
            {
                tracing::error!(error = %err, "sync run failed");
            }
            if cancel.is_cancelled() {
                break;
            }
            let echoed = drain_pending(&mut events);
            if echoed > 0 {
                tracing::debug!(echoed, "dropped local events raised during the run");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                Some(event) = next_event(&mut events) => {
                    tracing::debug!(?event, "local change");
                    wait_for_quiet(&mut events, self.config.watch_debounce).await;
                }
            }
        }

        signal.abort();
        tracing::info!("daemon stopped");
        Ok(())
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
    })
}

async fn next_event(events: &mut Option<UnboundedReceiver<LocalEvent>>) -> Option<LocalEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Discards events already queued, mostly echoes of the run's own writes.
/// Changes they hid are picked up by the next poll.
fn drain_pending(events: &mut Option<UnboundedReceiver<LocalEvent>>) -> usize {
    let Some(rx) = events else {
        return 0;
    };
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}

/// Drains a burst of local events until none arrive for `quiet`.
async fn wait_for_quiet(events: &mut Option<UnboundedReceiver<LocalEvent>>, quiet: Duration) -> usize {
    let Some(rx) = events else {
        return 0;
    };
    let mut drained = 0;
    while let Ok(Some(_)) = tokio::time::timeout(quiet, rx.recv()).await {
        drained += 1;
    }
    drained
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
