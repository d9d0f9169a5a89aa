//! Resource model shared by cluster clients and the controller.
//!
//! These types are a projection of the registry API: only the fields the
//! synchronisation engine reads or writes are modelled.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{StreamIdentity, TagIdentity};

/// Metadata common to namespaced objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Namespace of the object.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers blocking removal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set once deletion was requested while finalizers were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Optimistic concurrency token assigned by the server.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    /// Creates metadata for a namespaced object.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns true if the finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// A cluster namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    /// Namespace name.
    pub name: String,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Optimistic concurrency token assigned by the server.
    #[serde(default)]
    pub resource_version: u64,
}

/// Where a tag's image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// A pull spec on an external registry.
    DockerImage,
    /// Another tag in a stream.
    ImageStreamTag,
    /// A specific image in a stream.
    ImageStreamImage,
}

/// Reference to the origin of a tag's image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSource {
    /// Kind of reference.
    pub kind: SourceKind,
    /// Pull spec or tag name, depending on `kind`.
    pub name: String,
}

impl ImageSource {
    /// Creates a `DockerImage` reference.
    #[must_use]
    pub fn docker_image(name: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::DockerImage,
            name: name.into(),
        }
    }
}

/// A tag entry in a stream's spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagReference {
    /// Tag name.
    pub name: String,
    /// Tag annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Origin of the image, if the tag tracks one.
    #[serde(default)]
    pub from: Option<ImageSource>,
}

/// One binding of a tag to an image, as recorded in a stream's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    /// When the binding was recorded.
    pub created: DateTime<Utc>,
    /// Pull spec of the image.
    pub docker_image_reference: String,
    /// Image identity (content digest).
    pub image: String,
}

/// The recorded history of one tag, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedTagHistory {
    /// Tag name.
    pub tag: String,
    /// Bindings, newest first.
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

/// Desired state of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    /// Whether pods in the namespace may resolve tags of this stream locally.
    #[serde(default)]
    pub lookup_local: bool,
    /// Declared tags.
    #[serde(default)]
    pub tags: Vec<TagReference>,
}

/// Observed state of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Per-tag image history.
    #[serde(default)]
    pub tags: Vec<NamedTagHistory>,
}

/// An image stream as stored on one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStream {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: StreamSpec,
    /// Observed state.
    #[serde(default)]
    pub status: StreamStatus,
}

impl ImageStream {
    /// Creates an empty stream.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            ..Self::default()
        }
    }

    /// Returns the stream identity.
    #[must_use]
    pub fn identity(&self) -> StreamIdentity {
        StreamIdentity::new(&self.meta.namespace, &self.meta.name)
    }

    /// Returns true once deletion has been requested.
    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    /// Returns the spec entry for a tag.
    #[must_use]
    pub fn spec_tag(&self, tag: &str) -> Option<&TagReference> {
        self.spec.tags.iter().find(|t| t.name == tag)
    }

    /// Returns the status history for a tag.
    #[must_use]
    pub fn status_tag(&self, tag: &str) -> Option<&NamedTagHistory> {
        self.status.tags.iter().find(|t| t.tag == tag)
    }
}

/// The image a tag currently resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBinding {
    /// Image identity (content digest).
    pub name: String,
    /// Pull spec of the image on the cluster that holds it.
    pub docker_image_reference: String,
    /// Creation time of the binding.
    pub created: DateTime<Utc>,
}

impl From<&TagEvent> for ImageBinding {
    fn from(event: &TagEvent) -> Self {
        Self {
            name: event.image.clone(),
            docker_image_reference: event.docker_image_reference.clone(),
            created: event.created,
        }
    }
}

/// One cluster's view of a tag, assembled from the owning stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSnapshot {
    /// Tag identity.
    pub id: TagIdentity,
    /// Tag annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Declared origin of the image.
    #[serde(default)]
    pub from: Option<ImageSource>,
    /// Current image, if the tag resolved to one.
    #[serde(default)]
    pub image: Option<ImageBinding>,
    /// Deletion timestamp of the owning stream.
    #[serde(default)]
    pub stream_deletion_timestamp: Option<DateTime<Utc>>,
    /// Finalizers of the owning stream.
    #[serde(default)]
    pub stream_finalizers: Vec<String>,
}

impl TagSnapshot {
    /// Creates a snapshot with no image.
    #[must_use]
    pub fn new(id: TagIdentity) -> Self {
        Self {
            id,
            annotations: BTreeMap::new(),
            from: None,
            image: None,
            stream_deletion_timestamp: None,
            stream_finalizers: Vec::new(),
        }
    }

    /// Assembles a snapshot of `tag` from its stream.
    ///
    /// Returns `None` when the tag is neither declared in the spec nor
    /// recorded in the status.
    #[must_use]
    pub fn from_stream(stream: &ImageStream, tag: &str) -> Option<Self> {
        let spec = stream.spec_tag(tag);
        let history = stream.status_tag(tag);
        if spec.is_none() && history.is_none() {
            return None;
        }

        Some(Self {
            id: stream.identity().tag(tag),
            annotations: spec.map(|s| s.annotations.clone()).unwrap_or_default(),
            from: spec.and_then(|s| s.from.clone()),
            image: history
                .and_then(|h| h.items.first())
                .map(ImageBinding::from),
            stream_deletion_timestamp: stream.meta.deletion_timestamp,
            stream_finalizers: stream.meta.finalizers.clone(),
        })
    }

    /// Returns the image identity, if any.
    #[must_use]
    pub fn image_name(&self) -> Option<&str> {
        self.image.as_ref().map(|i| i.name.as_str())
    }

    /// Returns the creation time of the current binding, if any.
    #[must_use]
    pub fn image_created(&self) -> Option<DateTime<Utc>> {
        self.image.as_ref().map(|i| i.created)
    }
}

/// A docker-config pull credential stored in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSecret {
    /// Namespace holding the secret.
    pub namespace: String,
    /// Secret name.
    pub name: String,
    /// Raw `.dockerconfigjson` content.
    pub docker_config: Bytes,
    /// Optimistic concurrency token assigned by the server.
    #[serde(default)]
    pub resource_version: u64,
}

/// A synchronous server-side import of one image into a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageImport {
    /// Tag that receives the image.
    pub target: TagIdentity,
    /// Where to import from.
    pub from: ImageSource,
}

/// Result of an [`ImageImport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStatus {
    /// The imported image; `None` if the import did not succeed.
    pub image: Option<ImageBinding>,
    /// Machine-readable failure reason.
    #[serde(default)]
    pub reason: String,
    /// Human-readable failure message.
    #[serde(default)]
    pub message: String,
}
