//! Finalizer management and cross-cluster deletion cascade.
//!
//! No cluster can atomically delete a stream everywhere. Instead the source
//! stream carries [`CASCADE_FINALIZER`]; once any cluster's copy shows a
//! deletion timestamp, every other copy is deleted and the finalizer is
//! released so garbage collection can finish. Each step is idempotent, so a
//! pass that fails halfway is completed by the next one.

use tagsync_core::cluster::ClusterSet;
use tagsync_core::error::ResultExt;
use tagsync_core::id::StreamIdentity;
use tagsync_core::model::ImageStream;
use tagsync_core::well_known::CASCADE_FINALIZER;

use crate::error::{ClusterContext, Error, Result};

/// Adds the cascade finalizer to the source stream if it is missing.
///
/// Streams already being deleted are left alone. Returns the stream as
/// stored after the call.
///
/// # Errors
///
/// Returns [`Error::Cluster`] if the update fails.
pub async fn ensure_finalizer(
    clusters: &ClusterSet,
    cluster: &str,
    stream: ImageStream,
) -> Result<ImageStream> {
    if stream.is_deleting() || stream.meta.has_finalizer(CASCADE_FINALIZER) {
        return Ok(stream);
    }
    let client = clusters
        .get(cluster)
        .ok_or_else(|| Error::terminal(format!("cluster {cluster} is not registered")))?;

    let mut updated = stream;
    updated.meta.finalizers.push(CASCADE_FINALIZER.to_string());
    let id = updated.identity();
    let stored = client
        .update_stream(&updated)
        .await
        .on_cluster(cluster, || format!("add finalizer to imagestream {id}"))?;
    tracing::debug!(cluster, stream = %id, "added cascade finalizer");
    Ok(stored)
}

/// Propagates a deletion if any cluster's copy of the stream is deleting.
///
/// Returns `true` if a cascade is in progress, in which case normal sync
/// must be skipped for this pass.
///
/// # Errors
///
/// Returns the failures of all clusters, aggregated, if any read or write
/// failed.
pub async fn finalize_if_needed(clusters: &ClusterSet, id: &StreamIdentity) -> Result<bool> {
    let mut copies = Vec::with_capacity(clusters.len());
    let mut errors = Vec::new();
    for (name, client) in clusters.iter() {
        match client
            .get_stream(id)
            .await
            .optional()
            .on_cluster(name, || format!("get imagestream {id}"))
        {
            Ok(Some(stream)) => copies.push((name, client, stream)),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }
    Error::aggregate(errors)?;

    if !copies.iter().any(|(_, _, stream)| stream.is_deleting()) {
        return Ok(false);
    }
    tracing::info!(stream = %id, "deletion observed on a cluster, cascading");

    let mut errors = Vec::new();
    for (name, client, stream) in copies {
        let deleting = stream.is_deleting();
        if stream.meta.has_finalizer(CASCADE_FINALIZER) {
            let mut released = stream;
            released.meta.finalizers.retain(|f| f != CASCADE_FINALIZER);
            match client
                .update_stream(&released)
                .await
                .ignore_not_found()
                .on_cluster(name, || format!("remove finalizer from imagestream {id}"))
            {
                Ok(()) => tracing::debug!(cluster = name, stream = %id, "removed cascade finalizer"),
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            }
        }
        if !deleting {
            tracing::debug!(cluster = name, stream = %id, "deleting imagestream");
            if let Err(e) = client
                .delete_stream(id)
                .await
                .ignore_not_found()
                .on_cluster(name, || format!("delete imagestream {id}"))
            {
                errors.push(e);
            }
        }
    }
    Error::aggregate(errors)?;
    Ok(true)
}
