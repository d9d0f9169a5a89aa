//! Drains the mirror task store in batches through the external mirror tool.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tagsync_core::image::{ImageMirrorer, MirrorOptions, MirrorPair};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::MirrorStore;
use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;

/// Periodically copies pending tasks to their destinations.
#[derive(Clone)]
pub struct MirrorConsumer {
    store: MirrorStore,
    mirrorer: Arc<dyn ImageMirrorer>,
    config: MirrorConfig,
    registry_config: Option<PathBuf>,
    dry_run: bool,
    metrics: SyncMetrics,
}

impl MirrorConsumer {
    /// Creates a consumer.
    #[must_use]
    pub fn new(store: MirrorStore, mirrorer: Arc<dyn ImageMirrorer>, config: MirrorConfig) -> Self {
        Self {
            store,
            mirrorer,
            config,
            registry_config: None,
            dry_run: false,
            metrics: SyncMetrics::new(),
        }
    }

    /// Passes a registry credential file to the mirror tool.
    #[must_use]
    pub fn with_registry_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_config = Some(path.into());
        self
    }

    /// Asks the mirror tool not to copy anything.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn options(&self) -> MirrorOptions {
        MirrorOptions {
            registry_config: self.registry_config.clone(),
            continue_on_error: true,
            max_per_registry: self.config.max_per_registry,
            dry_run: self.dry_run,
        }
    }

    /// Mirrors one batch. Returns the number of distinct pairs copied.
    ///
    /// Tasks of a failed batch are put back so the next batch retries them,
    /// unless their destination was queued again while the copy ran.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mirror`] if the store or the mirror tool fails.
    pub async fn run_once(&self) -> Result<usize> {
        let tasks = self
            .store
            .take(self.config.batch_size)
            .map_err(|e| Error::mirror("take mirror tasks", e))?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let pairs: Vec<MirrorPair> = tasks
            .iter()
            .map(super::MirrorTask::pair)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        tracing::info!(tasks = tasks.len(), pairs = pairs.len(), "mirroring batch");

        let start = Instant::now();
        let result = self.mirrorer.mirror(&pairs, &self.options()).await;
        self.metrics.observe_mirror(result.is_ok(), start.elapsed());

        match result {
            Ok(()) => Ok(pairs.len()),
            Err(e) => {
                tracing::error!(error = %e, pairs = pairs.len(), "mirror batch failed");
                self.store
                    .requeue(tasks)
                    .map_err(|e| Error::mirror("requeue mirror tasks", e))?;
                Err(Error::mirror(format!("mirror {} pairs", pairs.len()), e))
            }
        }
    }

    /// Runs batches every `interval` until `shutdown` turns true or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "mirror consumer pass failed");
                    }
                }
            }
        }
        tracing::info!("mirror consumer stopped");
    }
}

impl fmt::Debug for MirrorConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorConsumer")
            .field("config", &self.config)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}
