//! Background sync worker
//!
//! Funnels every trigger through the orchestrator's guarded pass: once at
//! startup when the remote answers, on each offline to online transition,
//! on a fixed interval while online, and on demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{SyncOrchestrator, SyncResult, SyncTrigger};
use crate::cache::LocalCache;
use crate::error::{Result, SyncError};
use crate::network::Connectivity;

/// Commands for the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a pass, optionally reporting its result
    Sync(SyncTrigger, Option<oneshot::Sender<SyncResult>>),
    /// Stop the worker
    Stop,
}

/// Background sync worker
pub struct SyncWorker {
    sender: mpsc::Sender<SyncCommand>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker task
    pub fn start(
        orchestrator: Arc<SyncOrchestrator>,
        cache: Arc<LocalCache>,
        connectivity: Connectivity,
        every: Duration,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(32);

        let handle = tokio::spawn(async move {
            let mut online_rx = connectivity.subscribe();
            let mut was_online = *online_rx.borrow_and_update();
            let mut started = false;

            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            if was_online {
                started = Self::try_startup(&orchestrator, &cache).await;
            }

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SyncCommand::Sync(trigger, reply)) => {
                                let result = Self::do_sync(&orchestrator, &cache, trigger).await;
                                if result.success {
                                    started = true;
                                }
                                if let Some(reply) = reply {
                                    let _ = reply.send(result);
                                }
                            }
                            Some(SyncCommand::Stop) | None => break,
                        }
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        if online && !was_online {
                            if started {
                                Self::do_sync(&orchestrator, &cache, SyncTrigger::Reconnect).await;
                            } else {
                                started = Self::try_startup(&orchestrator, &cache).await;
                            }
                        }
                        was_online = online;
                    }
                    _ = ticker.tick() => {
                        if !connectivity.is_online() {
                            continue;
                        }
                        if started {
                            Self::do_sync(&orchestrator, &cache, SyncTrigger::Interval).await;
                        } else {
                            started = Self::try_startup(&orchestrator, &cache).await;
                        }
                    }
                }
            }

            tracing::info!("Sync worker stopped");
        });

        Self { sender, handle }
    }

    /// Startup pass, only once the remote is reachable
    async fn try_startup(orchestrator: &SyncOrchestrator, cache: &LocalCache) -> bool {
        if !orchestrator.probe_remote().await {
            tracing::debug!("Remote not reachable yet, deferring startup sync");
            return false;
        }
        Self::do_sync(orchestrator, cache, SyncTrigger::Startup)
            .await
            .reconciled()
    }

    async fn do_sync(
        orchestrator: &SyncOrchestrator,
        cache: &LocalCache,
        trigger: SyncTrigger,
    ) -> SyncResult {
        tracing::debug!("Sync triggered ({:?})", trigger);
        let snapshot = cache.begin_sync();
        let result = orchestrator.run_sync(&snapshot).await;

        if let Err(e) = cache.apply_sync_result(&result) {
            tracing::error!("Failed to apply sync result: {}", e);
        }
        if let Some(ref error) = result.error {
            tracing::warn!("Sync ({:?}) finished with error: {}", trigger, error);
        }
        result
    }

    /// Run a pass now and wait for its result
    pub async fn sync_now(&self) -> Result<SyncResult> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SyncCommand::Sync(SyncTrigger::Manual, Some(tx)))
            .await
            .map_err(|_| SyncError::Internal("Worker channel closed".to_string()))?;
        rx.await
            .map_err(|_| SyncError::Internal("Worker dropped the sync request".to_string()))
    }

    /// Queue a pass without waiting for it
    pub async fn trigger(&self) -> Result<()> {
        self.sender
            .send(SyncCommand::Sync(SyncTrigger::Manual, None))
            .await
            .map_err(|_| SyncError::Internal("Worker channel closed".to_string()))
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(self) -> Result<()> {
        // The task may already be gone
        let _ = self.sender.send(SyncCommand::Stop).await;
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("Sync worker panicked: {}", e)))
    }
}
