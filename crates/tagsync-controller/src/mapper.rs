//! Tag event differ: turns stream notifications into per-tag requests.
//!
//! Clusters only notify at stream granularity while reconciliation happens
//! per tag. A stream can carry thousands of tags and most updates touch a
//! single one, so updates are diffed against the previous state and only
//! tags whose recorded history changed are emitted. Two exceptions widen
//! the set:
//!
//! - a stream with a deletion timestamp emits every tag, so the cascade
//!   reaches every cluster;
//! - a tag whose spec carries a due soft-delete annotation is always
//!   emitted.
//!
//! Creates, deletes, and generic notifications emit every tag.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tagsync_core::cluster::StreamEvent;
use tagsync_core::id::{TagIdentity, TagRequest};
use tagsync_core::model::{ImageStream, NamedTagHistory, TagEvent};

use crate::filter::RequestFilter;
use crate::reconciler::soft_delete;

/// Returns the tags of `event` that need reconciling.
///
/// `soft_delete_due` is asked about each tag's spec annotations on update
/// notifications.
pub fn diff<P>(event: &StreamEvent, soft_delete_due: P) -> Vec<TagIdentity>
where
    P: Fn(&BTreeMap<String, String>) -> bool,
{
    match event {
        StreamEvent::Created(stream) | StreamEvent::Deleted(stream) | StreamEvent::Generic(stream) => {
            all_tags(stream)
        }
        StreamEvent::Updated { old, new } => {
            if new.is_deleting() {
                return all_tags(new);
            }
            let identity = new.identity();
            new.status
                .tags
                .iter()
                .filter(|history| {
                    let marked = new
                        .spec_tag(&history.tag)
                        .is_some_and(|spec| soft_delete_due(&spec.annotations));
                    marked || history_changed(old.status_tag(&history.tag), history)
                })
                .map(|history| identity.tag(&history.tag))
                .collect()
        }
    }
}

fn all_tags(stream: &ImageStream) -> Vec<TagIdentity> {
    let identity = stream.identity();
    stream
        .status
        .tags
        .iter()
        .map(|history| identity.tag(&history.tag))
        .collect()
}

/// Compares two histories of the same tag entry by entry.
///
/// A tag missing from the old state always counts as changed.
#[must_use]
pub fn history_changed(old: Option<&NamedTagHistory>, new: &NamedTagHistory) -> bool {
    let Some(old) = old else {
        return true;
    };
    old.items.len() != new.items.len()
        || old
            .items
            .iter()
            .zip(&new.items)
            .any(|(a, b)| !same_event(a, b))
}

fn same_event(a: &TagEvent, b: &TagEvent) -> bool {
    a.image == b.image
        && a.docker_image_reference == b.docker_image_reference
        && a.created == b.created
}

/// Soft-delete predicate evaluated at `now`.
///
/// A malformed deadline counts as due so that the reconciler gets to see
/// the tag and surfaces the parse failure.
pub fn soft_delete_due_at(now: DateTime<Utc>) -> impl Fn(&BTreeMap<String, String>) -> bool {
    move |annotations| match soft_delete::deadline(annotations) {
        None => false,
        Some(Ok(deadline)) => now > deadline,
        Some(Err(_)) => true,
    }
}

type Upstream = Arc<dyn Fn(TagRequest) -> Vec<TagRequest> + Send + Sync>;

/// Differ plus upstream fan-out, producing queue keys.
#[derive(Clone)]
pub struct TagEventMapper {
    upstream: Upstream,
}

impl TagEventMapper {
    /// Creates a mapper that passes each tag request through `upstream`,
    /// which may drop it or fan it out into several requests.
    pub fn new<F>(upstream: F) -> Self
    where
        F: Fn(TagRequest) -> Vec<TagRequest> + Send + Sync + 'static,
    {
        Self {
            upstream: Arc::new(upstream),
        }
    }

    /// Creates a mapper that keeps the requests `filter` admits.
    #[must_use]
    pub fn filtered(filter: RequestFilter) -> Self {
        Self::new(move |request| {
            if filter.admits(&request) {
                vec![request]
            } else {
                Vec::new()
            }
        })
    }

    /// Maps one notification to queue keys, evaluating soft-delete at `now`.
    #[must_use]
    pub fn map_at(&self, event: &StreamEvent, now: DateTime<Utc>) -> Vec<TagRequest> {
        diff(event, soft_delete_due_at(now))
            .into_iter()
            .flat_map(|tag| (self.upstream)(tag.request()))
            .collect()
    }

    /// Maps one notification to queue keys.
    #[must_use]
    pub fn map(&self, event: &StreamEvent) -> Vec<TagRequest> {
        self.map_at(event, Utc::now())
    }
}

impl fmt::Debug for TagEventMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagEventMapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use tagsync_core::model::TagReference;
    use tagsync_core::well_known::SOFT_DELETE_ANNOTATION;

    fn stream_with_tags(tags: &[&str]) -> ImageStream {
        let mut stream = ImageStream::new("namespace", "name");
        stream.status.tags = tags
            .iter()
            .map(|t| NamedTagHistory {
                tag: (*t).to_string(),
                items: Vec::new(),
            })
            .collect();
        stream
    }

    fn fan_out() -> TagEventMapper {
        TagEventMapper::new(|r: TagRequest| {
            vec![
                TagRequest::new(format!("first_{}", r.namespace), r.name.clone()),
                TagRequest::new(format!("second_{}", r.namespace), r.name),
            ]
        })
    }

    fn keys(requests: Vec<TagRequest>) -> BTreeSet<String> {
        requests.into_iter().map(|r| r.to_string()).collect()
    }

    fn expected(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    fn event_at() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn create_returns_all_tags() {
        let event = StreamEvent::Created(stream_with_tags(&["1", "2"]));
        assert_eq!(
            keys(fan_out().map_at(&event, event_at())),
            expected(&[
                "first_namespace/name:1",
                "first_namespace/name:2",
                "second_namespace/name:1",
                "second_namespace/name:2",
            ])
        );
    }

    #[test]
    fn delete_and_generic_return_all_tags() {
        for event in [
            StreamEvent::Deleted(stream_with_tags(&["1", "2"])),
            StreamEvent::Generic(stream_with_tags(&["1", "2"])),
        ] {
            assert_eq!(fan_out().map_at(&event, event_at()).len(), 4);
        }
    }

    #[test]
    fn update_returns_only_changed_tags() {
        let old = stream_with_tags(&["1", "2"]);
        let mut new = old.clone();
        new.status.tags[0].items.push(TagEvent {
            created: Utc::now(),
            docker_image_reference: String::new(),
            image: "some-image".into(),
        });

        let event = StreamEvent::Updated { old, new };
        assert_eq!(
            keys(fan_out().map_at(&event, event_at())),
            expected(&["first_namespace/name:1", "second_namespace/name:1"])
        );
    }

    #[test]
    fn deletion_timestamp_returns_all_tags() {
        let old = stream_with_tags(&["1", "2"]);
        let mut new = old.clone();
        new.meta.deletion_timestamp = Some(Utc::now());

        let event = StreamEvent::Updated { old, new };
        assert_eq!(fan_out().map_at(&event, event_at()).len(), 4);
    }

    #[test]
    fn soft_deleted_tags_are_returned() {
        let old = stream_with_tags(&["1", "2"]);
        let mut new = old.clone();
        new.spec.tags = vec![
            TagReference {
                name: "1".into(),
                annotations: BTreeMap::from([(
                    "release.openshift.io/not-soft-delete".to_string(),
                    "some".to_string(),
                )]),
                from: None,
            },
            TagReference {
                name: "2".into(),
                annotations: BTreeMap::from([(
                    SOFT_DELETE_ANNOTATION.to_string(),
                    "some".to_string(),
                )]),
                from: None,
            },
        ];

        let event = StreamEvent::Updated { old, new };
        assert_eq!(
            keys(fan_out().map_at(&event, event_at())),
            expected(&["first_namespace/name:2", "second_namespace/name:2"])
        );
    }

    #[test]
    fn future_soft_delete_is_not_due() {
        let now = Utc::now();
        let predicate = soft_delete_due_at(now);
        let future = BTreeMap::from([(
            SOFT_DELETE_ANNOTATION.to_string(),
            (now + chrono::Duration::hours(1)).to_rfc3339(),
        )]);
        let past = BTreeMap::from([(
            SOFT_DELETE_ANNOTATION.to_string(),
            (now - chrono::Duration::hours(1)).to_rfc3339(),
        )]);
        assert!(!predicate(&future));
        assert!(predicate(&past));
        assert!(!predicate(&BTreeMap::new()));
    }

    #[test]
    fn new_tag_counts_as_changed() {
        let old = stream_with_tags(&["1"]);
        let new = stream_with_tags(&["1", "2"]);
        let event = StreamEvent::Updated { old, new };
        let tags = diff(&event, |_| false);
        assert_eq!(tags, vec![TagIdentity::new("namespace", "name", "2")]);
    }

    #[test]
    fn filter_drops_requests() {
        let mapper = TagEventMapper::filtered(RequestFilter::allow_all());
        let mut stream = stream_with_tags(&["1"]);
        stream.meta.namespace = "kube-system".into();
        assert!(mapper.map(&StreamEvent::Created(stream)).is_empty());
    }
}
