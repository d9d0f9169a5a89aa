//! Per-follower sync: namespace, stream shell, pull secret, and import.

use std::collections::BTreeMap;
use std::fmt;

use tagsync_core::cluster::ClusterClient;
use tagsync_core::error::ResultExt;
use tagsync_core::id::{StreamIdentity, TagIdentity};
use tagsync_core::model::{
    ImageBinding, ImageImport, ImageSource, ImageStream, Namespace, PullSecret, SourceKind,
    TagSnapshot,
};
use tagsync_core::well_known::{PULL_SECRET_NAME, RELEASE_ANNOTATION_PREFIX, REQUESTER_LABEL};

use super::{CONTROLLER_NAME, SyncReconciler};
use crate::config::ImportMode;
use crate::error::{ClusterContext, Error, Result};
use crate::poll::poll_until;

/// What happened on one follower during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerOutcome {
    /// The source's image was imported from this follower; nothing to do.
    ImportedFromTarget,
    /// The follower already holds the source's image.
    UpToDate,
    /// The follower was pointed at the source's image.
    Imported,
    /// The import was logged and counted but not written.
    DryRun,
}

/// Result of an upsert, mirroring create-or-update semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOp {
    Unchanged,
    Created,
    Updated,
}

impl fmt::Display for UpsertOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
        })
    }
}

/// The elected source as seen by every follower of the pass.
pub(super) struct SourceContext<'a> {
    pub(super) cluster: &'a str,
    pub(super) stream: &'a ImageStream,
    pub(super) tag: &'a TagSnapshot,
    pub(super) image: &'a ImageBinding,
}

impl<'a> SourceContext<'a> {
    pub(super) fn new(
        cluster: &'a str,
        stream: &'a ImageStream,
        tag: &'a TagSnapshot,
    ) -> Result<Self> {
        let image = tag.image.as_ref().ok_or_else(|| {
            Error::terminal(format!("source copy of {} on {cluster} has no image", tag.id))
        })?;
        Ok(Self {
            cluster,
            stream,
            tag,
            image,
        })
    }
}

/// Logs the outcome of an upsert the way every write in this module is
/// reported. Write races stay quiet.
fn log_upsert(result: &Result<UpsertOp>, cluster: &str, kind: &str, namespace: &str, name: &str) {
    match result {
        Ok(UpsertOp::Unchanged) => {}
        Ok(op) => tracing::info!(cluster, kind, namespace, name, operation = %op, "Upsert succeeded"),
        Err(e) if e.is_conflict_or_exists() => {}
        Err(e) => tracing::error!(cluster, kind, namespace, name, error = %e, "Upsert failed"),
    }
}

impl SyncReconciler {
    pub(super) async fn sync_follower(
        &self,
        cluster: &str,
        client: &dyn ClusterClient,
        source: &SourceContext<'_>,
        existing: Option<&TagSnapshot>,
    ) -> Result<FollowerOutcome> {
        let id = &source.tag.id;
        if self.imported_from(cluster, source.tag) {
            tracing::debug!(cluster, tag = %id, "source image was imported from this cluster, skipping");
            return Ok(FollowerOutcome::ImportedFromTarget);
        }

        let result = ensure_namespace(client, cluster, &id.namespace).await;
        log_upsert(&result, cluster, "Namespace", "", &id.namespace);
        result?;

        let stream_id = id.stream_identity();
        let result = upsert_stream_shell(client, cluster, &stream_id, source.stream).await;
        log_upsert(&result, cluster, "ImageStream", &stream_id.namespace, &stream_id.name);
        result?;

        let visible = &stream_id;
        poll_until(
            self.options.cache_poll,
            &format!("imagestream {stream_id} on {cluster}"),
            move || async move { client.get_stream(visible).await.optional().map(|s| s.is_some()) },
        )
        .await
        .on_cluster(cluster, || format!("wait for imagestream {stream_id}"))?;

        if existing.and_then(TagSnapshot::image_name) == Some(source.image.name.as_str()) {
            tracing::debug!(cluster, tag = %id, image = %source.image.name, "follower already up to date");
            return Ok(FollowerOutcome::UpToDate);
        }

        let result = self.upsert_pull_secret(client, cluster, &id.namespace).await;
        log_upsert(&result, cluster, "Secret", &id.namespace, PULL_SECRET_NAME);
        result?;

        let public = self
            .domains
            .public_reference(source.cluster, &source.image.docker_image_reference)?;

        let result = self.import(client, cluster, source, &public).await;
        self.metrics.count_import_result(
            CONTROLLER_NAME,
            cluster,
            &stream_id.namespace,
            &stream_id.name,
            result.is_ok(),
        );
        result
    }

    fn imported_from(&self, cluster: &str, tag: &TagSnapshot) -> bool {
        tag.from.as_ref().is_some_and(|from| {
            from.kind == SourceKind::DockerImage && self.domains.is_hosted_on(cluster, &from.name)
        })
    }

    async fn upsert_pull_secret(
        &self,
        client: &dyn ClusterClient,
        cluster: &str,
        namespace: &str,
    ) -> Result<UpsertOp> {
        let docker_config = (self.pull_secret)();
        let existing = client
            .get_secret(namespace, PULL_SECRET_NAME)
            .await
            .optional()
            .on_cluster(cluster, || format!("get secret {namespace}/{PULL_SECRET_NAME}"))?;
        match existing {
            None => {
                let secret = PullSecret {
                    namespace: namespace.to_string(),
                    name: PULL_SECRET_NAME.to_string(),
                    docker_config,
                    resource_version: 0,
                };
                client
                    .create_secret(&secret)
                    .await
                    .on_cluster(cluster, || format!("create secret {namespace}/{PULL_SECRET_NAME}"))?;
                Ok(UpsertOp::Created)
            }
            Some(secret) if secret.docker_config == docker_config => Ok(UpsertOp::Unchanged),
            Some(mut secret) => {
                secret.docker_config = docker_config;
                client
                    .update_secret(&secret)
                    .await
                    .on_cluster(cluster, || format!("update secret {namespace}/{PULL_SECRET_NAME}"))?;
                Ok(UpsertOp::Updated)
            }
        }
    }

    async fn import(
        &self,
        client: &dyn ClusterClient,
        cluster: &str,
        source: &SourceContext<'_>,
        public: &str,
    ) -> Result<FollowerOutcome> {
        let id = &source.tag.id;
        if self.options.dry_run {
            tracing::info!(cluster, tag = %id, from = public, mode = ?self.options.import_mode, "dry run: would import");
            return Ok(FollowerOutcome::DryRun);
        }

        match self.options.import_mode {
            ImportMode::ServerSideImport => {
                let import = ImageImport {
                    target: id.clone(),
                    from: ImageSource::docker_image(public),
                };
                let status = client
                    .import_image(&import)
                    .await
                    .on_cluster(cluster, || format!("import {public} into {id}"))?;
                if status.image.is_none() {
                    return Err(Error::cluster(
                        cluster,
                        format!("import {public} into {id}"),
                        tagsync_core::Error::Internal {
                            message: format!(
                                "import produced no image: {}: {}",
                                status.reason, status.message
                            ),
                        },
                    ));
                }
                tracing::info!(cluster, tag = %id, from = public, "imported image");
            }
            ImportMode::TagReference => {
                let result = upsert_tag(client, cluster, id, &source.tag.annotations, public).await;
                log_upsert(&result, cluster, "ImageStreamTag", &id.namespace, &id.composite_name());
                result?;
            }
        }
        Ok(FollowerOutcome::Imported)
    }
}

async fn ensure_namespace(client: &dyn ClusterClient, cluster: &str, name: &str) -> Result<UpsertOp> {
    let existing = client
        .get_namespace(name)
        .await
        .optional()
        .on_cluster(cluster, || format!("get namespace {name}"))?;
    if existing.is_some() {
        return Ok(UpsertOp::Unchanged);
    }

    let namespace = Namespace {
        name: name.to_string(),
        labels: BTreeMap::from([(REQUESTER_LABEL.to_string(), CONTROLLER_NAME.to_string())]),
        resource_version: 0,
    };
    match client.create_namespace(&namespace).await {
        Ok(_) => Ok(UpsertOp::Created),
        // Someone else created it between the read and the write.
        Err(e) if e.is_conflict_or_exists() => Ok(UpsertOp::Unchanged),
        Err(e) => Err(Error::cluster(cluster, format!("create namespace {name}"), e)),
    }
}

/// Copies the allow-listed annotations and the lookup policy onto `stream`.
/// Returns true if anything changed.
fn apply_shell(stream: &mut ImageStream, source: &ImageStream) -> bool {
    let mut changed = false;
    for (key, value) in &source.meta.annotations {
        if key.starts_with(RELEASE_ANNOTATION_PREFIX)
            && stream.meta.annotations.get(key) != Some(value)
        {
            stream.meta.annotations.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    if stream.spec.lookup_local != source.spec.lookup_local {
        stream.spec.lookup_local = source.spec.lookup_local;
        changed = true;
    }
    changed
}

async fn upsert_stream_shell(
    client: &dyn ClusterClient,
    cluster: &str,
    id: &StreamIdentity,
    source: &ImageStream,
) -> Result<UpsertOp> {
    let existing = client
        .get_stream(id)
        .await
        .optional()
        .on_cluster(cluster, || format!("get imagestream {id}"))?;
    match existing {
        None => {
            let mut stream = ImageStream::new(&id.namespace, &id.name);
            apply_shell(&mut stream, source);
            client
                .create_stream(&stream)
                .await
                .on_cluster(cluster, || format!("create imagestream {id}"))?;
            Ok(UpsertOp::Created)
        }
        Some(mut stream) => {
            if !apply_shell(&mut stream, source) {
                return Ok(UpsertOp::Unchanged);
            }
            client
                .update_stream(&stream)
                .await
                .on_cluster(cluster, || format!("update imagestream {id}"))?;
            Ok(UpsertOp::Updated)
        }
    }
}

async fn upsert_tag(
    client: &dyn ClusterClient,
    cluster: &str,
    id: &TagIdentity,
    annotations: &BTreeMap<String, String>,
    public: &str,
) -> Result<UpsertOp> {
    let from = ImageSource::docker_image(public);
    let existing = client
        .get_tag(id)
        .await
        .optional()
        .on_cluster(cluster, || format!("get imagestreamtag {id}"))?;
    match existing {
        None => {
            let mut tag = TagSnapshot::new(id.clone());
            tag.annotations = annotations.clone();
            tag.from = Some(from);
            client
                .create_tag(&tag)
                .await
                .on_cluster(cluster, || format!("create imagestreamtag {id}"))?;
            Ok(UpsertOp::Created)
        }
        Some(tag) if tag.annotations == *annotations && tag.from.as_ref() == Some(&from) => {
            Ok(UpsertOp::Unchanged)
        }
        Some(mut tag) => {
            tag.annotations = annotations.clone();
            tag.from = Some(from);
            client
                .update_tag(&tag)
                .await
                .on_cluster(cluster, || format!("update imagestreamtag {id}"))?;
            Ok(UpsertOp::Updated)
        }
    }
}
