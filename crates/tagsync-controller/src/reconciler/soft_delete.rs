//! Deferred deletion of tags marked with a soft-delete deadline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tagsync_core::error::{Error, Result};
use tagsync_core::well_known::SOFT_DELETE_ANNOTATION;

use crate::elector::Snapshots;

/// Parses the soft-delete deadline from tag annotations.
///
/// Returns `None` when the annotation is absent.
#[must_use]
pub fn deadline(annotations: &BTreeMap<String, String>) -> Option<Result<DateTime<Utc>>> {
    annotations.get(SOFT_DELETE_ANNOTATION).map(|raw| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                Error::invalid_request(format!(
                    "annotation {SOFT_DELETE_ANNOTATION}={raw} is not an RFC 3339 timestamp: {e}"
                ))
            })
    })
}

/// Returns true if the annotations carry a deadline that `now` has passed.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the annotation is not RFC 3339.
pub fn is_due(annotations: &BTreeMap<String, String>, now: DateTime<Utc>) -> Result<bool> {
    match deadline(annotations) {
        None => Ok(false),
        Some(parsed) => parsed.map(|t| now > t),
    }
}

/// Finds the first cluster whose copy of the tag is due for deletion.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if any examined annotation is malformed.
pub fn due_cluster<'a>(snapshots: &'a Snapshots, now: DateTime<Utc>) -> Result<Option<&'a str>> {
    for (cluster, tag) in snapshots {
        if is_due(&tag.annotations, now)? {
            return Ok(Some(cluster.as_str()));
        }
    }
    Ok(None)
}
