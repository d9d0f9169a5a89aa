//! Mirroring to a third-party registry.
//!
//! Detecting that an external copy is out of date and performing the copy
//! are decoupled through the [`MirrorStore`]: the [`DriftDetector`] puts
//! tasks, the [`MirrorConsumer`] drains them in batches.

pub mod consumer;
pub mod drift;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tagsync_core::id::TagIdentity;
use tagsync_core::image::MirrorPair;

pub use consumer::MirrorConsumer;
pub use drift::DriftDetector;
pub use memory::MirrorStore;

/// A pending copy of one image to an external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorTask {
    /// Unique task id (ULID), assigned when first stored.
    #[serde(default)]
    pub id: String,
    /// Tag the image belongs to.
    pub source_tag: TagIdentity,
    /// Reference to copy from.
    pub source: String,
    /// Reference to copy to. Tasks are keyed by this value.
    pub destination: String,
    /// Destination digest when drift was detected; empty if it was missing.
    #[serde(default)]
    pub last_digest: String,
    /// True if the destination existed with a different image.
    #[serde(default)]
    pub stale: bool,
    /// Component that requested the copy.
    pub owner: String,
    /// When the task was first stored.
    pub created_at: DateTime<Utc>,
}

impl MirrorTask {
    /// Creates a task; `id` and `created_at` are assigned by the store.
    #[must_use]
    pub fn new(
        source_tag: TagIdentity,
        source: impl Into<String>,
        destination: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            source_tag,
            source: source.into(),
            destination: destination.into(),
            last_digest: String::new(),
            stale: false,
            owner: owner.into(),
            created_at: Utc::now(),
        }
    }

    /// The copy this task asks for.
    #[must_use]
    pub fn pair(&self) -> MirrorPair {
        MirrorPair {
            source: self.source.clone(),
            destination: self.destination.clone(),
        }
    }
}
