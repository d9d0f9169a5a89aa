//! Source election: which cluster holds the authoritative copy of a tag.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tagsync_core::model::TagSnapshot;

/// One tag's snapshot per cluster that has a copy, ordered by cluster name.
pub type Snapshots = BTreeMap<String, TagSnapshot>;

/// Returns the cluster whose copy has the newest image binding.
///
/// Ties keep the first cluster in name order. Copies without an image
/// binding never win; `None` means no cluster has a bound copy.
#[must_use]
pub fn elect(snapshots: &Snapshots) -> Option<&str> {
    let mut newest: Option<(&str, DateTime<Utc>)> = None;
    for (cluster, tag) in snapshots {
        let Some(created) = tag.image_created() else {
            continue;
        };
        match newest {
            Some((_, best)) if created <= best => {}
            _ => newest = Some((cluster.as_str(), created)),
        }
    }
    newest.map(|(cluster, _)| cluster)
}
