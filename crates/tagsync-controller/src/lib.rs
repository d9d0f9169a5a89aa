//! # tagsync-controller
//!
//! Keeps image stream tags identical across a set of clusters.
//!
//! Stream notifications from every cluster are diffed into per-tag requests
//! ([`mapper`]), filtered ([`filter`]), deduplicated on a work queue
//! ([`queue`]), and reconciled by a worker pool ([`runtime`]). Each
//! reconcile ([`reconciler`]) elects the cluster holding the newest copy
//! ([`elector`]) and converges the others toward it, cascading stream
//! deletions and honouring soft-delete deadlines along the way.
//!
//! A sibling pipeline ([`mirror`]) detects when an external registry copy
//! lags its source and batches the copies through an external tool.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use tagsync_controller::prelude::*;
//! use tagsync_core::ClusterSet;
//!
//! # async fn run(clusters: ClusterSet) -> tagsync_controller::Result<()> {
//! let config = ControllerConfig::from_env()?;
//! let pull_secret: PullSecretSource = Arc::new(|| Bytes::from_static(b"{}"));
//! let controller = Controller::from_config(&config, clusters, pull_secret);
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! controller.run(shutdown).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod elector;
pub mod error;
pub mod filter;
pub mod mapper;
pub mod metrics;
pub mod mirror;
pub mod poll;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ControllerConfig, FilterConfig, ImportMode, MirrorConfig, PollConfig};
    pub use crate::elector::{Snapshots, elect};
    pub use crate::error::{Error, Result};
    pub use crate::filter::RequestFilter;
    pub use crate::mapper::TagEventMapper;
    pub use crate::metrics::{SyncMetrics, init_metrics};
    pub use crate::mirror::{DriftDetector, MirrorConsumer, MirrorStore, MirrorTask};
    pub use crate::queue::WorkQueue;
    pub use crate::reconciler::{
        CONTROLLER_NAME, FollowerOutcome, Outcome, PullSecretSource, ReconcilerOptions,
        SyncReconciler,
    };
    pub use crate::runtime::{Controller, EventPump};
}

pub use error::{Error, Result};
