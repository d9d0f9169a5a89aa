//! In-memory cluster with operation tracing.
//!
//! Behaves like a registry API server closely enough for reconciler tests:
//! optimistic concurrency on updates, finalizer-gated stream deletion, tag
//! writes that resolve to an image binding, and a read path that can lag
//! behind freshly created streams.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tagsync_core::cluster::{ClusterClient, StreamEvent};
use tagsync_core::error::{Error, Result};
use tagsync_core::id::{StreamIdentity, TagIdentity};
use tagsync_core::model::{
    ImageImport, ImageSource, ImageStream, ImportStatus, NamedTagHistory, Namespace, PullSecret,
    TagEvent, TagReference, TagSnapshot,
};
use tokio::sync::mpsc;

/// Record of a write made through the [`ClusterClient`] API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    /// Namespace created.
    CreateNamespace {
        /// Namespace name.
        name: String,
    },
    /// Namespace replaced.
    UpdateNamespace {
        /// Namespace name.
        name: String,
    },
    /// Stream created.
    CreateStream {
        /// Stream identity.
        stream: StreamIdentity,
    },
    /// Stream replaced.
    UpdateStream {
        /// Stream identity.
        stream: StreamIdentity,
    },
    /// Stream deletion requested.
    DeleteStream {
        /// Stream identity.
        stream: StreamIdentity,
    },
    /// Tag created.
    CreateTag {
        /// Tag identity.
        tag: TagIdentity,
        /// Declared source reference.
        from: Option<String>,
    },
    /// Tag replaced.
    UpdateTag {
        /// Tag identity.
        tag: TagIdentity,
        /// Declared source reference.
        from: Option<String>,
    },
    /// Tag deleted.
    DeleteTag {
        /// Tag identity.
        tag: TagIdentity,
    },
    /// Pull secret created.
    CreateSecret {
        /// Namespace holding the secret.
        namespace: String,
        /// Secret name.
        name: String,
    },
    /// Pull secret replaced.
    UpdateSecret {
        /// Namespace holding the secret.
        namespace: String,
        /// Secret name.
        name: String,
    },
    /// Server-side import issued.
    Import {
        /// Target tag.
        tag: TagIdentity,
        /// Source reference.
        from: String,
    },
}

impl ClusterOp {
    /// Returns true for operations that changed a tag.
    #[must_use]
    pub fn is_tag_write(&self) -> bool {
        matches!(
            self,
            Self::CreateTag { .. } | Self::UpdateTag { .. } | Self::DeleteTag { .. } | Self::Import { .. }
        )
    }
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    streams: BTreeMap<StreamIdentity, ImageStream>,
    secrets: BTreeMap<(String, String), PullSecret>,
    /// Tags served without an owning stream, as a stale read cache would.
    orphan_tags: BTreeMap<TagIdentity, TagSnapshot>,
    next_version: u64,
    /// Remaining reads for which a freshly created stream stays invisible.
    hidden: HashMap<StreamIdentity, u32>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Outcome of server-side imports.
#[derive(Debug, Clone, Default)]
enum ImportBehavior {
    #[default]
    Succeed,
    Fail {
        reason: String,
        message: String,
    },
}

/// In-memory [`ClusterClient`] that records every write.
#[derive(Debug, Clone)]
pub struct TracingCluster {
    name: String,
    state: Arc<Mutex<State>>,
    operations: Arc<Mutex<Vec<ClusterOp>>>,
    fail_ops: Arc<Mutex<Vec<String>>>,
    cache_lag: Arc<Mutex<u32>>,
    import_behavior: Arc<Mutex<ImportBehavior>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>>,
}

impl TracingCluster {
    /// Creates an empty cluster.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
            operations: Arc::default(),
            fail_ops: Arc::default(),
            cache_lag: Arc::default(),
            import_behavior: Arc::default(),
            events: Arc::default(),
        }
    }

    /// Returns the cluster as a shared trait object.
    pub fn shared(&self) -> Arc<dyn ClusterClient> {
        Arc::new(self.clone())
    }

    /// Hides every stream created through the API from the next `reads`
    /// `get_stream` calls.
    pub fn set_cache_lag(&self, reads: u32) {
        *self.cache_lag.lock().expect("lock") = reads;
    }

    /// Makes server-side imports report no image.
    pub fn fail_imports(&self, reason: impl Into<String>, message: impl Into<String>) {
        *self.import_behavior.lock().expect("lock") = ImportBehavior::Fail {
            reason: reason.into(),
            message: message.into(),
        };
    }

    /// Injects a retriable failure for operations whose key starts with
    /// `prefix`. Keys look like `create_tag:ci/app:latest`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_ops.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_ops.lock().expect("lock").clear();
    }

    /// Returns all recorded writes.
    pub fn operations(&self) -> Vec<ClusterOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded writes.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Subscribes to stream change events. Replaces any earlier subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().expect("lock") = Some(tx);
        rx
    }

    /// Stores a namespace without recording an operation.
    pub fn seed_namespace(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.state.lock().expect("lock");
        let version = state.bump();
        state.namespaces.insert(
            name.clone(),
            Namespace {
                name,
                resource_version: version,
                ..Namespace::default()
            },
        );
    }

    /// Stores a stream (and its namespace) without recording an operation.
    pub fn seed_stream(&self, mut stream: ImageStream) {
        let mut state = self.state.lock().expect("lock");
        let namespace = stream.meta.namespace.clone();
        if !state.namespaces.contains_key(&namespace) {
            let version = state.bump();
            state.namespaces.insert(
                namespace.clone(),
                Namespace {
                    name: namespace,
                    resource_version: version,
                    ..Namespace::default()
                },
            );
        }
        stream.meta.resource_version = state.bump();
        state.streams.insert(stream.identity(), stream);
    }

    /// Serves `tag` from `get_tag` even though its stream does not exist.
    pub fn seed_orphan_tag(&self, tag: TagSnapshot) {
        self.state
            .lock()
            .expect("lock")
            .orphan_tags
            .insert(tag.id.clone(), tag);
    }

    /// Returns the stored stream, bypassing cache lag.
    pub fn stream(&self, id: &StreamIdentity) -> Option<ImageStream> {
        self.state.lock().expect("lock").streams.get(id).cloned()
    }

    /// Returns the stored tag, bypassing cache lag.
    pub fn tag(&self, id: &TagIdentity) -> Option<TagSnapshot> {
        let state = self.state.lock().expect("lock");
        match state.streams.get(&id.stream_identity()) {
            Some(stream) => TagSnapshot::from_stream(stream, &id.tag),
            None => state.orphan_tags.get(id).cloned(),
        }
    }

    /// Returns the stored namespace.
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state.lock().expect("lock").namespaces.get(name).cloned()
    }

    /// Returns the stored pull secret.
    pub fn secret(&self, namespace: &str, name: &str) -> Option<PullSecret> {
        self.state
            .lock()
            .expect("lock")
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn record(&self, op: ClusterOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let fail_ops = self.fail_ops.lock().expect("lock");
        if fail_ops.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(Error::unavailable(format!(
                "injected failure on cluster {}: {key}",
                self.name
            )));
        }
        Ok(())
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(tx) = self.events.lock().expect("lock").as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Applies a tag write to `stream` and returns the resulting snapshot.
    fn write_tag(stream: &mut ImageStream, tag: &TagSnapshot) -> TagSnapshot {
        let reference = TagReference {
            name: tag.id.tag.clone(),
            annotations: tag.annotations.clone(),
            from: tag.from.clone(),
        };
        match stream.spec.tags.iter_mut().find(|t| t.name == tag.id.tag) {
            Some(existing) => *existing = reference,
            None => stream.spec.tags.push(reference),
        }
        if let Some(from) = &tag.from {
            Self::record_binding(stream, &tag.id.tag, from);
        }
        TagSnapshot::from_stream(stream, &tag.id.tag).unwrap_or_else(|| tag.clone())
    }

    fn record_binding(stream: &mut ImageStream, tag: &str, from: &ImageSource) {
        let image = from
            .name
            .rsplit_once('@')
            .map_or_else(|| from.name.clone(), |(_, digest)| digest.to_string());
        let event = TagEvent {
            created: Utc::now(),
            docker_image_reference: from.name.clone(),
            image,
        };
        match stream.status.tags.iter_mut().find(|h| h.tag == tag) {
            Some(history) => {
                if history.items.first().map(|e| &e.image) != Some(&event.image) {
                    history.items.insert(0, event);
                }
            }
            None => stream.status.tags.push(NamedTagHistory {
                tag: tag.to_string(),
                items: vec![event],
            }),
        }
    }

    fn mutate_stream<F>(&self, id: &StreamIdentity, mutate: F) -> Result<(ImageStream, ImageStream)>
    where
        F: FnOnce(&mut ImageStream) -> Result<()>,
    {
        let mut state = self.state.lock().expect("lock");
        let version = state.bump();
        let stream = state
            .streams
            .get_mut(id)
            .ok_or_else(|| Error::not_found("imagestream", id))?;
        let old = stream.clone();
        mutate(stream)?;
        stream.meta.resource_version = version;
        Ok((old, stream.clone()))
    }
}

#[async_trait]
impl ClusterClient for TracingCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.check_failure(&format!("get_namespace:{name}"))?;
        self.namespace(name)
            .ok_or_else(|| Error::not_found("namespace", name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.check_failure(&format!("create_namespace:{}", namespace.name))?;
        let mut state = self.state.lock().expect("lock");
        if state.namespaces.contains_key(&namespace.name) {
            return Err(Error::already_exists("namespace", &namespace.name));
        }
        let mut stored = namespace.clone();
        stored.resource_version = state.bump();
        state.namespaces.insert(stored.name.clone(), stored.clone());
        drop(state);
        self.record(ClusterOp::CreateNamespace {
            name: namespace.name.clone(),
        });
        Ok(stored)
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.check_failure(&format!("update_namespace:{}", namespace.name))?;
        let mut state = self.state.lock().expect("lock");
        let version = state.bump();
        let stored = state
            .namespaces
            .get_mut(&namespace.name)
            .ok_or_else(|| Error::not_found("namespace", &namespace.name))?;
        if stored.resource_version != namespace.resource_version {
            return Err(Error::conflict(
                "namespace",
                &namespace.name,
                "resource version mismatch",
            ));
        }
        *stored = namespace.clone();
        stored.resource_version = version;
        let stored = stored.clone();
        drop(state);
        self.record(ClusterOp::UpdateNamespace {
            name: namespace.name.clone(),
        });
        Ok(stored)
    }

    async fn get_stream(&self, id: &StreamIdentity) -> Result<ImageStream> {
        self.check_failure(&format!("get_stream:{id}"))?;
        let mut state = self.state.lock().expect("lock");
        if let Some(remaining) = state.hidden.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::not_found("imagestream", id));
            }
            state.hidden.remove(id);
        }
        state
            .streams
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("imagestream", id))
    }

    async fn create_stream(&self, stream: &ImageStream) -> Result<ImageStream> {
        let id = stream.identity();
        self.check_failure(&format!("create_stream:{id}"))?;
        let lag = *self.cache_lag.lock().expect("lock");
        let mut state = self.state.lock().expect("lock");
        if !state.namespaces.contains_key(&id.namespace) {
            return Err(Error::not_found("namespace", &id.namespace));
        }
        if state.streams.contains_key(&id) {
            return Err(Error::already_exists("imagestream", &id));
        }
        let mut stored = stream.clone();
        stored.meta.resource_version = state.bump();
        stored.meta.deletion_timestamp = None;
        stored.status = tagsync_core::model::StreamStatus::default();
        state.streams.insert(id.clone(), stored.clone());
        if lag > 0 {
            state.hidden.insert(id.clone(), lag);
        }
        drop(state);
        self.record(ClusterOp::CreateStream { stream: id });
        self.emit(StreamEvent::Created(stored.clone()));
        Ok(stored)
    }

    async fn update_stream(&self, stream: &ImageStream) -> Result<ImageStream> {
        let id = stream.identity();
        self.check_failure(&format!("update_stream:{id}"))?;
        let (old, new) = self.mutate_stream(&id, |stored| {
            if stored.meta.resource_version != stream.meta.resource_version {
                return Err(Error::conflict(
                    "imagestream",
                    &id,
                    "resource version mismatch",
                ));
            }
            let deletion_timestamp = stored.meta.deletion_timestamp;
            stored.meta = stream.meta.clone();
            stored.meta.deletion_timestamp = deletion_timestamp;
            stored.spec = stream.spec.clone();
            Ok(())
        })?;
        self.record(ClusterOp::UpdateStream { stream: id.clone() });

        if new.is_deleting() && new.meta.finalizers.is_empty() {
            self.state.lock().expect("lock").streams.remove(&id);
            self.emit(StreamEvent::Deleted(new.clone()));
        } else {
            self.emit(StreamEvent::Updated {
                old,
                new: new.clone(),
            });
        }
        Ok(new)
    }

    async fn delete_stream(&self, id: &StreamIdentity) -> Result<()> {
        self.check_failure(&format!("delete_stream:{id}"))?;
        let (old, new) = self.mutate_stream(id, |stored| {
            if stored.meta.deletion_timestamp.is_none() {
                stored.meta.deletion_timestamp = Some(Utc::now());
            }
            Ok(())
        })?;
        self.record(ClusterOp::DeleteStream { stream: id.clone() });

        if new.meta.finalizers.is_empty() {
            self.state.lock().expect("lock").streams.remove(id);
            self.emit(StreamEvent::Deleted(new));
        } else {
            self.emit(StreamEvent::Updated { old, new });
        }
        Ok(())
    }

    async fn get_tag(&self, id: &TagIdentity) -> Result<TagSnapshot> {
        self.check_failure(&format!("get_tag:{id}"))?;
        self.tag(id)
            .ok_or_else(|| Error::not_found("imagestreamtag", id))
    }

    async fn create_tag(&self, tag: &TagSnapshot) -> Result<TagSnapshot> {
        let id = tag.id.clone();
        self.check_failure(&format!("create_tag:{id}"))?;
        let mut snapshot = None;
        let (old, new) = self.mutate_stream(&id.stream_identity(), |stream| {
            if TagSnapshot::from_stream(stream, &id.tag).is_some() {
                return Err(Error::already_exists("imagestreamtag", &id));
            }
            snapshot = Some(Self::write_tag(stream, tag));
            Ok(())
        })?;
        self.record(ClusterOp::CreateTag {
            tag: id,
            from: tag.from.as_ref().map(|f| f.name.clone()),
        });
        self.emit(StreamEvent::Updated { old, new });
        Ok(snapshot.unwrap_or_else(|| tag.clone()))
    }

    async fn update_tag(&self, tag: &TagSnapshot) -> Result<TagSnapshot> {
        let id = tag.id.clone();
        self.check_failure(&format!("update_tag:{id}"))?;
        let mut snapshot = None;
        let (old, new) = self.mutate_stream(&id.stream_identity(), |stream| {
            if TagSnapshot::from_stream(stream, &id.tag).is_none() {
                return Err(Error::not_found("imagestreamtag", &id));
            }
            snapshot = Some(Self::write_tag(stream, tag));
            Ok(())
        })?;
        self.record(ClusterOp::UpdateTag {
            tag: id,
            from: tag.from.as_ref().map(|f| f.name.clone()),
        });
        self.emit(StreamEvent::Updated { old, new });
        Ok(snapshot.unwrap_or_else(|| tag.clone()))
    }

    async fn delete_tag(&self, id: &TagIdentity) -> Result<()> {
        self.check_failure(&format!("delete_tag:{id}"))?;
        let (old, new) = self.mutate_stream(&id.stream_identity(), |stream| {
            if TagSnapshot::from_stream(stream, &id.tag).is_none() {
                return Err(Error::not_found("imagestreamtag", id));
            }
            stream.spec.tags.retain(|t| t.name != id.tag);
            stream.status.tags.retain(|h| h.tag != id.tag);
            Ok(())
        })?;
        self.record(ClusterOp::DeleteTag { tag: id.clone() });
        self.emit(StreamEvent::Updated { old, new });
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<PullSecret> {
        self.check_failure(&format!("get_secret:{namespace}/{name}"))?;
        self.secret(namespace, name)
            .ok_or_else(|| Error::not_found("secret", format!("{namespace}/{name}")))
    }

    async fn create_secret(&self, secret: &PullSecret) -> Result<PullSecret> {
        let key = (secret.namespace.clone(), secret.name.clone());
        self.check_failure(&format!("create_secret:{}/{}", key.0, key.1))?;
        let mut state = self.state.lock().expect("lock");
        if !state.namespaces.contains_key(&key.0) {
            return Err(Error::not_found("namespace", &key.0));
        }
        if state.secrets.contains_key(&key) {
            return Err(Error::already_exists("secret", format!("{}/{}", key.0, key.1)));
        }
        let mut stored = secret.clone();
        stored.resource_version = state.bump();
        state.secrets.insert(key.clone(), stored.clone());
        drop(state);
        self.record(ClusterOp::CreateSecret {
            namespace: key.0,
            name: key.1,
        });
        Ok(stored)
    }

    async fn update_secret(&self, secret: &PullSecret) -> Result<PullSecret> {
        let key = (secret.namespace.clone(), secret.name.clone());
        self.check_failure(&format!("update_secret:{}/{}", key.0, key.1))?;
        let mut state = self.state.lock().expect("lock");
        let version = state.bump();
        let stored = state
            .secrets
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("secret", format!("{}/{}", key.0, key.1)))?;
        if stored.resource_version != secret.resource_version {
            return Err(Error::conflict(
                "secret",
                format!("{}/{}", key.0, key.1),
                "resource version mismatch",
            ));
        }
        *stored = secret.clone();
        stored.resource_version = version;
        let stored = stored.clone();
        drop(state);
        self.record(ClusterOp::UpdateSecret {
            namespace: key.0,
            name: key.1,
        });
        Ok(stored)
    }

    async fn import_image(&self, import: &ImageImport) -> Result<ImportStatus> {
        let id = import.target.clone();
        self.check_failure(&format!("import:{id}"))?;
        self.record(ClusterOp::Import {
            tag: id.clone(),
            from: import.from.name.clone(),
        });

        let behavior = self.import_behavior.lock().expect("lock").clone();
        if let ImportBehavior::Fail { reason, message } = behavior {
            return Ok(ImportStatus {
                image: None,
                reason,
                message,
            });
        }

        let (old, new) = self.mutate_stream(&id.stream_identity(), |stream| {
            let mut tag = TagSnapshot::from_stream(stream, &id.tag)
                .unwrap_or_else(|| TagSnapshot::new(id.clone()));
            tag.from = Some(import.from.clone());
            Self::write_tag(stream, &tag);
            Ok(())
        })?;
        let image = TagSnapshot::from_stream(&new, &id.tag).and_then(|t| t.image);
        self.emit(StreamEvent::Updated { old, new });
        Ok(ImportStatus {
            image,
            ..ImportStatus::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::StreamBuilder;

    #[tokio::test]
    async fn deleting_stream_with_finalizer_only_marks_it() {
        let cluster = TracingCluster::new("app.ci");
        cluster.seed_stream(StreamBuilder::new("ci", "app").finalizer("f").build());
        let id = StreamIdentity::new("ci", "app");

        cluster.delete_stream(&id).await.expect("delete");
        let stream = cluster.stream(&id).expect("still stored");
        assert!(stream.is_deleting());

        let mut cleared = stream.clone();
        cleared.meta.finalizers.clear();
        cluster.update_stream(&cleared).await.expect("update");
        assert!(cluster.stream(&id).is_none());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let cluster = TracingCluster::new("app.ci");
        cluster.seed_stream(StreamBuilder::new("ci", "app").build());
        let id = StreamIdentity::new("ci", "app");
        let stale = cluster.stream(&id).expect("stored");

        cluster.update_stream(&stale).await.expect("first update");
        let err = cluster.update_stream(&stale).await.expect_err("stale");
        assert!(err.is_conflict_or_exists());
    }

    #[tokio::test]
    async fn tag_write_resolves_digest() {
        let cluster = TracingCluster::new("api.ci");
        cluster.seed_stream(StreamBuilder::new("ci", "app").build());
        let id = TagIdentity::new("ci", "app", "latest");
        let mut tag = TagSnapshot::new(id.clone());
        tag.from = Some(ImageSource::docker_image("registry.example/ci/app@sha256:abc"));

        let stored = cluster.create_tag(&tag).await.expect("create");
        assert_eq!(stored.image_name(), Some("sha256:abc"));
        assert_eq!(
            cluster.operations(),
            vec![ClusterOp::CreateTag {
                tag: id,
                from: Some("registry.example/ci/app@sha256:abc".into()),
            }]
        );
    }

    #[tokio::test]
    async fn cache_lag_hides_new_streams() {
        let cluster = TracingCluster::new("api.ci");
        cluster.seed_namespace("ci");
        cluster.set_cache_lag(2);
        let stream = ImageStream::new("ci", "app");
        cluster.create_stream(&stream).await.expect("create");

        let id = stream.identity();
        assert!(cluster.get_stream(&id).await.is_err());
        assert!(cluster.get_stream(&id).await.is_err());
        assert!(cluster.get_stream(&id).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_match_by_prefix() {
        let cluster = TracingCluster::new("api.ci");
        cluster.inject_failure("get_namespace:");
        let err = cluster.get_namespace("ci").await.expect_err("injected");
        assert!(err.is_retriable());
        cluster.clear_failures();
        assert!(cluster.get_namespace("ci").await.expect_err("absent").is_not_found());
    }

    #[tokio::test]
    async fn writes_emit_events() {
        let cluster = TracingCluster::new("api.ci");
        let mut events = cluster.subscribe();
        cluster.seed_namespace("ci");
        cluster
            .create_stream(&ImageStream::new("ci", "app"))
            .await
            .expect("create");
        assert!(matches!(events.recv().await, Some(StreamEvent::Created(_))));
    }
}
