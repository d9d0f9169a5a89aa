//! Property-based tests for the differ, the elector, and retry backoff.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;

use tagsync_controller::elector::{Snapshots, elect};
use tagsync_controller::mapper::{diff, history_changed};
use tagsync_controller::queue::backoff;
use tagsync_core::cluster::StreamEvent;
use tagsync_core::id::TagIdentity;
use tagsync_core::model::{ImageBinding, ImageStream, NamedTagHistory, TagEvent, TagSnapshot};
use tagsync_test_utils::{at_minutes, tag_event};

/// Generates a tag name.
fn arb_tag() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,8}"
}

/// Generates a short history of image events.
fn arb_history() -> impl Strategy<Value = Vec<TagEvent>> {
    prop::collection::vec((0u8..4, -60i64..60), 0..4).prop_map(|items| {
        items
            .into_iter()
            .map(|(digest, minutes)| {
                tag_event("ci", "app", &format!("sha256:{digest}"), at_minutes(minutes))
            })
            .collect()
    })
}

/// Generates a stream with distinct tags and arbitrary histories.
fn arb_stream() -> impl Strategy<Value = ImageStream> {
    prop::collection::btree_map(arb_tag(), arb_history(), 0..6).prop_map(|tags| {
        let mut stream = ImageStream::new("ci", "app");
        stream.status.tags = tags
            .into_iter()
            .map(|(tag, items)| NamedTagHistory { tag, items })
            .collect();
        stream
    })
}

/// Generates per-cluster snapshots, some without an image binding.
fn arb_snapshots() -> impl Strategy<Value = Snapshots> {
    prop::collection::btree_map(
        "[a-z]{2,6}\\.ci",
        prop::option::of(-30i64..30),
        0..5,
    )
    .prop_map(|clusters| {
        clusters
            .into_iter()
            .map(|(cluster, minutes)| {
                let mut tag = TagSnapshot::new(TagIdentity::new("ci", "app", "latest"));
                tag.image = minutes.map(|m| ImageBinding {
                    name: format!("sha256:{cluster}"),
                    docker_image_reference: format!("{cluster}/ci/app@sha256:x"),
                    created: at_minutes(m),
                });
                (cluster, tag)
            })
            .collect()
    })
}

fn tag_names(stream: &ImageStream) -> BTreeSet<String> {
    stream.status.tags.iter().map(|h| h.tag.clone()).collect()
}

fn emitted(tags: Vec<TagIdentity>) -> BTreeSet<String> {
    tags.into_iter().map(|t| t.tag).collect()
}

proptest! {
    #[test]
    fn unchanged_update_emits_nothing(stream in arb_stream()) {
        let event = StreamEvent::Updated { old: stream.clone(), new: stream };
        prop_assert!(diff(&event, |_| false).is_empty());
    }

    #[test]
    fn create_delete_and_generic_emit_every_tag(stream in arb_stream()) {
        let all = tag_names(&stream);
        for event in [
            StreamEvent::Created(stream.clone()),
            StreamEvent::Deleted(stream.clone()),
            StreamEvent::Generic(stream.clone()),
        ] {
            prop_assert_eq!(emitted(diff(&event, |_| false)), all.clone());
        }
    }

    #[test]
    fn deleting_stream_emits_every_tag(old in arb_stream(), new in arb_stream()) {
        let mut new = new;
        new.meta.deletion_timestamp = Some(Utc::now());
        let all = tag_names(&new);
        let event = StreamEvent::Updated { old, new };
        prop_assert_eq!(emitted(diff(&event, |_| false)), all);
    }

    #[test]
    fn update_emits_exactly_the_changed_tags(old in arb_stream(), new in arb_stream()) {
        let expected: BTreeSet<String> = new
            .status
            .tags
            .iter()
            .filter(|h| history_changed(old.status_tag(&h.tag), h))
            .map(|h| h.tag.clone())
            .collect();
        let event = StreamEvent::Updated { old, new };
        let tags = diff(&event, |_| false);
        prop_assert_eq!(tags.len(), expected.len(), "no duplicates");
        prop_assert_eq!(emitted(tags), expected);
    }

    #[test]
    fn history_comparison_is_reflexive(items in arb_history()) {
        let history = NamedTagHistory { tag: "latest".into(), items };
        prop_assert!(!history_changed(Some(&history), &history));
        prop_assert!(history_changed(None, &history));
    }

    #[test]
    fn elected_source_is_never_older_than_any_copy(snapshots in arb_snapshots()) {
        let newest: Option<DateTime<Utc>> =
            snapshots.values().filter_map(TagSnapshot::image_created).max();
        match elect(&snapshots) {
            None => prop_assert!(newest.is_none()),
            Some(source) => {
                let created = snapshots[source].image_created();
                prop_assert_eq!(created, newest);
                let first_newest = snapshots
                    .iter()
                    .find(|(_, t)| t.image_created() == newest)
                    .map(|(c, _)| c.as_str());
                prop_assert_eq!(Some(source), first_newest, "ties go to the first name");
            }
        }
    }

    #[test]
    fn backoff_is_monotonic_and_bounded(failures in 1u32..64, base_ms in 1u64..1_000) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_secs(300);
        let current = backoff(base, max, failures);
        let next = backoff(base, max, failures + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= max);
        prop_assert!(current >= base.min(max));
    }
}

#[test]
fn newer_history_entry_is_a_change() {
    let old = NamedTagHistory {
        tag: "latest".into(),
        items: vec![tag_event("ci", "app", "sha256:a", at_minutes(0))],
    };
    let mut new = old.clone();
    new.items[0].created = at_minutes(0) + ChronoDuration::seconds(1);
    assert!(history_changed(Some(&old), &new));
}
