//! Sync reconciler: converges every cluster's copy of one tag.
//!
//! Each pass reads the tag from every registered cluster, elects the newest
//! copy as the source, and then does exactly one of:
//!
//! - cascade a stream deletion observed on any cluster;
//! - delete the tag everywhere when a soft-delete deadline has passed;
//! - bring every follower up to the source's image.
//!
//! No state is kept between passes. Every write is an idempotent upsert or
//! delete, so passes for the same tag may interleave and re-run freely.

pub mod cascade;
mod follower;
pub mod soft_delete;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tagsync_core::cluster::{ClusterClient, ClusterSet};
use tagsync_core::error::ResultExt;
use tagsync_core::id::{TagIdentity, TagRequest};
use tagsync_core::image::RegistryDomains;
use tagsync_core::observability::reconcile_span;
use tracing::Instrument;

use crate::config::{ControllerConfig, ImportMode, PollConfig};
use crate::elector::{Snapshots, elect};
use crate::error::{ClusterContext, Error, Result};
use crate::metrics::SyncMetrics;
use crate::mirror::drift::DriftDetector;

pub use follower::FollowerOutcome;

/// Name used for metrics labels, logs, and namespace attribution.
pub const CONTROLLER_NAME: &str = "registry_syncer";

/// Supplies the docker-config content written to follower pull secrets.
pub type PullSecretSource = Arc<dyn Fn() -> Bytes + Send + Sync>;

/// Behavioural switches of the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerOptions {
    /// Wait-for-cache settings for freshly written streams.
    pub cache_poll: PollConfig,
    /// How followers receive the source's image.
    pub import_mode: ImportMode,
    /// Log and count imports without writing them.
    pub dry_run: bool,
}

impl From<&ControllerConfig> for ReconcilerOptions {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            cache_poll: config.cache_poll,
            import_mode: config.import_mode,
            dry_run: config.dry_run,
        }
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No cluster holds a bound copy of the tag.
    Absent,
    /// A stream deletion was propagated; no sync happened.
    CascadeDeleted,
    /// The tag was deleted everywhere because its deadline passed.
    SoftDeleted {
        /// Cluster whose copy carried the due annotation.
        cluster: String,
    },
    /// Followers were brought up to the source.
    Synced {
        /// Elected source cluster.
        source: String,
        /// Per-follower result for every follower that succeeded.
        followers: BTreeMap<String, FollowerOutcome>,
    },
}

/// Reconciles tag requests across a fixed set of clusters.
pub struct SyncReconciler {
    clusters: ClusterSet,
    domains: RegistryDomains,
    pull_secret: PullSecretSource,
    options: ReconcilerOptions,
    metrics: SyncMetrics,
    drift: Option<DriftDetector>,
}

impl SyncReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        clusters: ClusterSet,
        domains: RegistryDomains,
        pull_secret: PullSecretSource,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            clusters,
            domains,
            pull_secret,
            options,
            metrics: SyncMetrics::new(),
            drift: None,
        }
    }

    /// Also checks each synced source against an external registry.
    #[must_use]
    pub fn with_drift_detector(mut self, drift: DriftDetector) -> Self {
        self.drift = Some(drift);
        self
    }

    /// The clusters this reconciler writes to.
    #[must_use]
    pub fn clusters(&self) -> &ClusterSet {
        &self.clusters
    }

    /// Runs one pass for `request`.
    ///
    /// Write races (conflict, already-exists) and objects deleted mid-pass
    /// are returned but not logged as errors; the next event for the tag
    /// resolves them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminal`] for a malformed request key, and cluster
    /// errors (aggregated across clusters where several failed) otherwise.
    pub async fn reconcile(&self, request: &TagRequest) -> Result<Outcome> {
        let start = Instant::now();
        let result = self
            .reconcile_at(request, Utc::now())
            .instrument(reconcile_span(CONTROLLER_NAME, request))
            .await;
        self.metrics
            .observe_reconcile(CONTROLLER_NAME, result.is_ok(), start.elapsed());

        match &result {
            Err(e) if !e.is_conflict_or_exists() && !e.is_not_found() => {
                tracing::error!(request = %request, error = %e, "Reconciliation failed");
            }
            Err(e) => tracing::debug!(request = %request, error = %e, "Reconciliation raced a concurrent write or delete"),
            Ok(outcome) => tracing::debug!(request = %request, ?outcome, "Reconciliation finished"),
        }
        result
    }

    /// Runs one pass, evaluating soft-delete deadlines at `now`.
    ///
    /// # Errors
    ///
    /// See [`SyncReconciler::reconcile`].
    pub async fn reconcile_at(&self, request: &TagRequest, now: DateTime<Utc>) -> Result<Outcome> {
        let id = TagIdentity::try_from(request)
            .map_err(|e| Error::terminal(format!("invalid request {request}: {e}")))?;

        let snapshots = self.fetch_snapshots(&id).await?;
        let Some(source) = elect(&snapshots) else {
            tracing::debug!(tag = %id, "no cluster holds the tag");
            return Ok(Outcome::Absent);
        };
        let source_tag = snapshots
            .get(source)
            .ok_or_else(|| Error::terminal(format!("elected cluster {source} has no copy")))?;
        tracing::debug!(tag = %id, source, "elected source cluster");

        let stream_id = id.stream_identity();
        let source_stream = match self
            .client(source)?
            .get_stream(&stream_id)
            .await
            .on_cluster(source, || format!("get source imagestream {stream_id}"))
        {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => {
                tracing::debug!(tag = %id, source, "source imagestream deleted since the tag was read");
                return Ok(Outcome::Absent);
            }
            Err(e) => return Err(e),
        };
        let source_stream = cascade::ensure_finalizer(&self.clusters, source, source_stream).await?;

        if cascade::finalize_if_needed(&self.clusters, &stream_id).await? {
            return Ok(Outcome::CascadeDeleted);
        }

        if let Some(cluster) = soft_delete::due_cluster(&snapshots, now)? {
            tracing::info!(tag = %id, cluster, "soft-delete deadline passed, deleting tag everywhere");
            self.delete_everywhere(&id, &snapshots).await?;
            return Ok(Outcome::SoftDeleted {
                cluster: cluster.to_string(),
            });
        }

        let source_ctx = follower::SourceContext::new(source, &source_stream, source_tag)?;
        let mut followers = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, client) in self.clusters.iter() {
            if name == source {
                continue;
            }
            match self
                .sync_follower(name, client.as_ref(), &source_ctx, snapshots.get(name))
                .await
            {
                Ok(outcome) => {
                    followers.insert(name.to_string(), outcome);
                }
                Err(e) => errors.push(e),
            }
        }

        if let Some(drift) = &self.drift {
            let result = match self
                .domains
                .public_reference(source, &source_ctx.image.docker_image_reference)
            {
                Ok(reference) => drift.check(&id, &reference, &source_ctx.image.name).await.map(|_| ()),
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }

        Error::aggregate(errors)?;
        Ok(Outcome::Synced {
            source: source.to_string(),
            followers,
        })
    }

    async fn fetch_snapshots(&self, id: &TagIdentity) -> Result<Snapshots> {
        let mut snapshots = Snapshots::new();
        let mut errors = Vec::new();
        for (name, client) in self.clusters.iter() {
            match client
                .get_tag(id)
                .await
                .optional()
                .on_cluster(name, || format!("get imagestreamtag {id}"))
            {
                Ok(Some(tag)) => {
                    snapshots.insert(name.to_string(), tag);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        Error::aggregate(errors)?;
        Ok(snapshots)
    }

    async fn delete_everywhere(&self, id: &TagIdentity, snapshots: &Snapshots) -> Result<()> {
        let mut errors = Vec::new();
        for cluster in snapshots.keys() {
            let result = match self.client(cluster) {
                Ok(client) => client
                    .delete_tag(id)
                    .await
                    .ignore_not_found()
                    .on_cluster(cluster, || format!("delete imagestreamtag {id}")),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => tracing::debug!(cluster = %cluster, tag = %id, "deleted tag"),
                Err(e) => errors.push(e),
            }
        }
        Error::aggregate(errors)
    }

    fn client(&self, cluster: &str) -> Result<&Arc<dyn ClusterClient>> {
        self.clusters
            .get(cluster)
            .ok_or_else(|| Error::terminal(format!("cluster {cluster} is not registered")))
    }
}

impl fmt::Debug for SyncReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncReconciler")
            .field("clusters", &self.clusters)
            .field("options", &self.options)
            .field("drift", &self.drift.is_some())
            .finish_non_exhaustive()
    }
}
