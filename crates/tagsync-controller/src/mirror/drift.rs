//! Detects when an external registry copy lags the source image.

use std::fmt;
use std::sync::Arc;

use tagsync_core::id::TagIdentity;
use tagsync_core::image::{ImageInspector, InspectOptions};

use super::{MirrorStore, MirrorTask};
use crate::error::{Error, Result};

/// Default external repository.
pub const DEFAULT_REPOSITORY: &str = "quay.io/openshift/ci";

/// Owner recorded on tasks created by the detector.
pub const DRIFT_OWNER: &str = "drift_detector";

/// Destination of `tag` in `repository`: `repository:namespace_stream_tag`.
#[must_use]
pub fn destination(repository: &str, tag: &TagIdentity) -> String {
    format!("{repository}:{}_{}_{}", tag.namespace, tag.stream, tag.tag)
}

/// Compares external copies with their sources and queues copies.
#[derive(Clone)]
pub struct DriftDetector {
    inspector: Arc<dyn ImageInspector>,
    store: MirrorStore,
    repository: String,
    options: InspectOptions,
}

impl DriftDetector {
    /// Creates a detector writing to [`DEFAULT_REPOSITORY`].
    #[must_use]
    pub fn new(inspector: Arc<dyn ImageInspector>, store: MirrorStore) -> Self {
        Self {
            inspector,
            store,
            repository: DEFAULT_REPOSITORY.to_string(),
            options: InspectOptions::default(),
        }
    }

    /// Uses another external repository.
    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    /// Uses explicit inspection options.
    #[must_use]
    pub fn with_inspect_options(mut self, options: InspectOptions) -> Self {
        self.options = options;
        self
    }

    /// Checks the external copy of `tag` against the source `image`
    /// identity. Returns true if a mirror task was queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mirror`] if the inspection or the store fails.
    pub async fn check(&self, tag: &TagIdentity, source: &str, image: &str) -> Result<bool> {
        let destination = destination(&self.repository, tag);
        let info = self
            .inspector
            .inspect(&destination, &self.options)
            .await
            .map_err(|e| Error::mirror(format!("inspect {destination}"), e))?;
        if info.digest == image {
            return Ok(false);
        }

        let mut task = MirrorTask::new(tag.clone(), source, destination.as_str(), DRIFT_OWNER);
        task.stale = !info.is_missing();
        task.last_digest = info.digest;
        tracing::info!(
            tag = %tag,
            destination = %destination,
            stale = task.stale,
            "external copy is out of date, queueing mirror"
        );
        self.store
            .put([task])
            .map_err(|e| Error::mirror(format!("queue mirror of {tag}"), e))?;
        Ok(true)
    }
}

impl fmt::Debug for DriftDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriftDetector")
            .field("repository", &self.repository)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
