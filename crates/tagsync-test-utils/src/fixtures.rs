//! Builders for streams and tags with sensible defaults.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tagsync_core::model::{
    ImageSource, ImageStream, NamedTagHistory, TagEvent, TagReference,
};

/// Fixed reference instant used by fixtures (`T`).
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .expect("valid fixed time")
}

/// `T` shifted by `minutes`.
pub fn at_minutes(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

/// Internal pull spec for an image on the operator-managed registry.
pub fn internal_reference(namespace: &str, stream: &str, digest: &str) -> String {
    format!("image-registry.openshift-image-registry.svc:5000/{namespace}/{stream}@{digest}")
}

/// A tag history entry pointing at `digest` on the internal registry.
pub fn tag_event(namespace: &str, stream: &str, digest: &str, created: DateTime<Utc>) -> TagEvent {
    TagEvent {
        created,
        docker_image_reference: internal_reference(namespace, stream, digest),
        image: digest.to_string(),
    }
}

/// Fluent builder for [`ImageStream`].
#[derive(Debug, Clone)]
pub struct StreamBuilder {
    stream: ImageStream,
}

impl StreamBuilder {
    /// Starts an empty stream.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            stream: ImageStream::new(namespace, name),
        }
    }

    /// Adds a stream annotation.
    #[must_use]
    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.stream
            .meta
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Sets the local lookup policy.
    #[must_use]
    pub fn lookup_local(mut self, local: bool) -> Self {
        self.stream.spec.lookup_local = local;
        self
    }

    /// Adds a finalizer.
    #[must_use]
    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.stream.meta.finalizers.push(finalizer.to_string());
        self
    }

    /// Marks the stream as being deleted.
    #[must_use]
    pub fn deleting(mut self, at: DateTime<Utc>) -> Self {
        self.stream.meta.deletion_timestamp = Some(at);
        self
    }

    /// Adds a tag bound to `digest` created at `created`.
    #[must_use]
    pub fn tag(self, tag: &str, digest: &str, created: DateTime<Utc>) -> Self {
        self.tag_with(tag, digest, created, BTreeMap::new(), None)
    }

    /// Adds a tag carrying annotations and an optional `from` reference.
    #[must_use]
    pub fn tag_with(
        mut self,
        tag: &str,
        digest: &str,
        created: DateTime<Utc>,
        annotations: BTreeMap<String, String>,
        from: Option<ImageSource>,
    ) -> Self {
        let namespace = self.stream.meta.namespace.clone();
        let name = self.stream.meta.name.clone();
        self.stream.spec.tags.push(TagReference {
            name: tag.to_string(),
            annotations,
            from,
        });
        self.stream.status.tags.push(NamedTagHistory {
            tag: tag.to_string(),
            items: vec![tag_event(&namespace, &name, digest, created)],
        });
        self
    }

    /// Adds a status-only history entry list for a tag.
    #[must_use]
    pub fn history(mut self, tag: &str, items: Vec<TagEvent>) -> Self {
        self.stream.status.tags.push(NamedTagHistory {
            tag: tag.to_string(),
            items,
        });
        self
    }

    /// Finishes the stream.
    pub fn build(self) -> ImageStream {
        self.stream
    }
}

/// Builds an annotation map from pairs.
pub fn annotations<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
