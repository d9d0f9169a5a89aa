//! Per-cluster registry client contract and the ordered cluster registry.
//!
//! Every registered cluster is represented by one [`ClusterClient`]. The
//! controller never looks clients up through globals: a [`ClusterSet`] is
//! built once at startup and handed to everything that needs it.
//!
//! Reads are expected to go through the cluster's cached read path and may
//! lag writes; callers that depend on a fresh write being visible must poll.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{StreamIdentity, TagIdentity};
use crate::model::{ImageImport, ImageStream, ImportStatus, Namespace, PullSecret, TagSnapshot};

/// Capability set for one cluster's registry API.
///
/// Every operation reports a missing object as [`Error::NotFound`], an
/// optimistic-concurrency failure as [`Error::Conflict`], and a duplicate
/// create as [`Error::AlreadyExists`].
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Stable cluster name, e.g. `app.ci`.
    fn name(&self) -> &str;

    /// Reads a namespace.
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;

    /// Creates a namespace.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    /// Replaces a namespace, checking `resource_version`.
    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    /// Reads a stream.
    async fn get_stream(&self, id: &StreamIdentity) -> Result<ImageStream>;

    /// Creates a stream.
    async fn create_stream(&self, stream: &ImageStream) -> Result<ImageStream>;

    /// Replaces a stream's metadata and spec, checking `resource_version`.
    ///
    /// Clearing the last finalizer of a stream that is being deleted removes
    /// it.
    async fn update_stream(&self, stream: &ImageStream) -> Result<ImageStream>;

    /// Requests deletion of a stream.
    ///
    /// A stream that still carries finalizers is only marked with a deletion
    /// timestamp.
    async fn delete_stream(&self, id: &StreamIdentity) -> Result<()>;

    /// Reads one tag as a snapshot of its owning stream.
    async fn get_tag(&self, id: &TagIdentity) -> Result<TagSnapshot>;

    /// Creates a tag from the snapshot's annotations and `from` reference.
    async fn create_tag(&self, tag: &TagSnapshot) -> Result<TagSnapshot>;

    /// Replaces a tag's annotations and `from` reference.
    async fn update_tag(&self, tag: &TagSnapshot) -> Result<TagSnapshot>;

    /// Deletes a tag.
    async fn delete_tag(&self, id: &TagIdentity) -> Result<()>;

    /// Reads a pull secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<PullSecret>;

    /// Creates a pull secret.
    async fn create_secret(&self, secret: &PullSecret) -> Result<PullSecret>;

    /// Replaces a pull secret, checking `resource_version`.
    async fn update_secret(&self, secret: &PullSecret) -> Result<PullSecret>;

    /// Runs a synchronous server-side import and returns its status.
    async fn import_image(&self, import: &ImageImport) -> Result<ImportStatus>;
}

/// A stream-level change notification from one cluster's watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The stream was created.
    Created(ImageStream),
    /// The stream changed.
    Updated {
        /// State before the change.
        old: ImageStream,
        /// State after the change.
        new: ImageStream,
    },
    /// The stream was removed.
    Deleted(ImageStream),
    /// Resync or otherwise untyped notification.
    Generic(ImageStream),
}

impl StreamEvent {
    /// The stream state the event refers to (the new state for updates).
    #[must_use]
    pub const fn stream(&self) -> &ImageStream {
        match self {
            Self::Created(s) | Self::Deleted(s) | Self::Generic(s) => s,
            Self::Updated { new, .. } => new,
        }
    }
}

/// The registered clusters, ordered by name.
///
/// Iteration order is stable and lexicographic, which makes source election
/// deterministic on exact-timestamp ties.
#[derive(Clone, Default)]
pub struct ClusterSet {
    clients: BTreeMap<String, Arc<dyn ClusterClient>>,
}

impl ClusterSet {
    /// Builds a set from clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if two clients share a name.
    pub fn new(clients: impl IntoIterator<Item = Arc<dyn ClusterClient>>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for client in clients {
            let name = client.name().to_string();
            if map.insert(name.clone(), client).is_some() {
                return Err(Error::invalid_request(format!(
                    "cluster {name} registered more than once"
                )));
            }
        }
        Ok(Self { clients: map })
    }

    /// Returns the client for a cluster.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ClusterClient>> {
        self.clients.get(name)
    }

    /// Iterates `(name, client)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ClusterClient>)> {
        self.clients.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Cluster names in iteration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Number of registered clusters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no cluster is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClusterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.clients.keys()).finish()
    }
}
