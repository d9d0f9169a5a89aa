//! End-to-end reconcile scenarios against traced in-memory clusters.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tagsync_controller::prelude::*;
use tagsync_core::ClusterSet;
use tagsync_core::id::{StreamIdentity, TagIdentity, TagRequest};
use tagsync_core::image::RegistryDomains;
use tagsync_core::model::{ImageBinding, ImageSource, TagEvent, TagSnapshot};
use tagsync_core::well_known::{
    CASCADE_FINALIZER, PULL_SECRET_NAME, REQUESTER_LABEL, SOFT_DELETE_ANNOTATION,
};
use tagsync_test_utils::{
    ClusterOp, StaticInspector, StreamBuilder, TracingCluster, annotations, at_minutes,
    init_test_logging,
};

const API_CI: &str = "api.ci";
const APP_CI: &str = "app.ci";
const BUILD01: &str = "build01.ci";

const PULL_SECRET: &[u8] = br#"{"auths":{"registry.ci.openshift.org":{"auth":"dXNlcjpwYXNz"}}}"#;

fn request() -> TagRequest {
    TagRequest::new("ci", "applyconfig:latest")
}

fn tag_id() -> TagIdentity {
    TagIdentity::new("ci", "applyconfig", "latest")
}

fn stream_id() -> StreamIdentity {
    StreamIdentity::new("ci", "applyconfig")
}

fn fast_options() -> ReconcilerOptions {
    ReconcilerOptions {
        cache_poll: PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        },
        ..ReconcilerOptions::default()
    }
}

fn pull_secret() -> PullSecretSource {
    Arc::new(|| Bytes::from_static(PULL_SECRET))
}

/// The app.ci copy: internal registry reference, copied and non-copied
/// stream annotations, local lookup.
fn app_stream(digest: &str, minutes: i64) -> StreamBuilder {
    StreamBuilder::new("ci", "applyconfig")
        .annotation("release.openshift.io-something", "copied")
        .annotation("something", "not-copied")
        .lookup_local(true)
        .tag("latest", digest, at_minutes(minutes))
}

/// The api.ci copy, pointing at the legacy registry host.
fn api_stream(digest: &str, minutes: i64) -> StreamBuilder {
    StreamBuilder::new("ci", "applyconfig").history(
        "latest",
        vec![TagEvent {
            created: at_minutes(minutes),
            docker_image_reference: format!(
                "docker-registry.default.svc:5000/ci/applyconfig@{digest}"
            ),
            image: digest.to_string(),
        }],
    )
}

struct Harness {
    api: TracingCluster,
    app: TracingCluster,
    build01: Option<TracingCluster>,
    reconciler: SyncReconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(fast_options(), false)
    }

    fn with_options(options: ReconcilerOptions, three_clusters: bool) -> Self {
        init_test_logging();
        let api = TracingCluster::new(API_CI);
        let app = TracingCluster::new(APP_CI);
        let build01 = three_clusters.then(|| TracingCluster::new(BUILD01));

        let mut clients = vec![api.shared(), app.shared()];
        if let Some(b) = &build01 {
            clients.push(b.shared());
        }
        let clusters = ClusterSet::new(clients).expect("distinct clusters");
        let domains = RegistryDomains::ci_defaults(clusters.names());
        let reconciler = SyncReconciler::new(clusters, domains, pull_secret(), options);
        Self {
            api,
            app,
            build01,
            reconciler,
        }
    }

    fn with_drift(self, detector: DriftDetector) -> Self {
        Self {
            reconciler: self.reconciler.with_drift_detector(detector),
            ..self
        }
    }

    async fn reconcile(&self) -> Result<Outcome> {
        self.reconciler.reconcile(&request()).await
    }

    fn clear_operations(&self) {
        self.api.clear_operations();
        self.app.clear_operations();
        if let Some(b) = &self.build01 {
            b.clear_operations();
        }
    }
}

fn tag_writes(cluster: &TracingCluster) -> Vec<ClusterOp> {
    cluster
        .operations()
        .into_iter()
        .filter(ClusterOp::is_tag_write)
        .collect()
}

#[tokio::test]
async fn deleted_source_stream_is_absent() {
    let h = Harness::new();
    let mut orphan = TagSnapshot::new(tag_id());
    orphan.image = Some(ImageBinding {
        name: "sha256:new".into(),
        docker_image_reference: "image-registry.openshift-image-registry.svc:5000/ci/applyconfig@sha256:new".into(),
        created: at_minutes(0),
    });
    h.app.seed_orphan_tag(orphan);

    let outcome = h.reconcile().await.expect("deleted stream is not an error");
    assert_eq!(outcome, Outcome::Absent);
    assert!(h.api.operations().is_empty());
}

#[tokio::test]
async fn new_tag_is_created_on_a_fresh_follower() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(
        outcome,
        Outcome::Synced {
            source: APP_CI.into(),
            followers: BTreeMap::from([(API_CI.to_string(), FollowerOutcome::Imported)]),
        }
    );

    assert_eq!(
        h.api.operations(),
        vec![
            ClusterOp::CreateNamespace { name: "ci".into() },
            ClusterOp::CreateStream { stream: stream_id() },
            ClusterOp::CreateSecret {
                namespace: "ci".into(),
                name: PULL_SECRET_NAME.into(),
            },
            ClusterOp::CreateTag {
                tag: tag_id(),
                from: Some("registry.ci.openshift.org/ci/applyconfig@sha256:new".into()),
            },
        ]
    );

    let namespace = h.api.namespace("ci").expect("namespace created");
    assert_eq!(
        namespace.labels.get(REQUESTER_LABEL).map(String::as_str),
        Some(CONTROLLER_NAME)
    );

    let shell = h.api.stream(&stream_id()).expect("stream created");
    assert_eq!(
        shell.meta.annotations,
        annotations([("release.openshift.io-something", "copied")])
    );
    assert!(shell.spec.lookup_local);

    let secret = h.api.secret("ci", PULL_SECRET_NAME).expect("secret created");
    assert_eq!(secret.docker_config.as_ref(), PULL_SECRET);

    assert_eq!(
        h.api.tag(&tag_id()).and_then(|t| t.image).map(|i| i.name),
        Some("sha256:new".to_string())
    );

    let source = h.app.stream(&stream_id()).expect("source kept");
    assert!(source.meta.has_finalizer(CASCADE_FINALIZER));
}

#[tokio::test]
async fn newer_source_updates_older_follower() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:new", 0).build());
    h.api.seed_stream(api_stream("sha256:old", -10).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert!(matches!(outcome, Outcome::Synced { ref source, .. } if source == APP_CI));

    let ops = h.api.operations();
    assert!(!ops.iter().any(|op| matches!(op, ClusterOp::CreateNamespace { .. })));
    assert!(ops.contains(&ClusterOp::UpdateStream { stream: stream_id() }));
    assert!(ops.contains(&ClusterOp::CreateTag {
        tag: tag_id(),
        from: Some("registry.ci.openshift.org/ci/applyconfig@sha256:new".into()),
    }) || ops.contains(&ClusterOp::UpdateTag {
        tag: tag_id(),
        from: Some("registry.ci.openshift.org/ci/applyconfig@sha256:new".into()),
    }));
    assert!(tag_writes(&h.app).is_empty(), "source is never written");
}

#[tokio::test]
async fn newer_source_with_same_image_writes_no_tag() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:same", 0).build());
    h.api.seed_stream(api_stream("sha256:same", -10).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(
        outcome,
        Outcome::Synced {
            source: APP_CI.into(),
            followers: BTreeMap::from([(API_CI.to_string(), FollowerOutcome::UpToDate)]),
        }
    );
    assert!(tag_writes(&h.api).is_empty());
    assert!(h.api.secret("ci", PULL_SECRET_NAME).is_none());
}

#[tokio::test]
async fn deletion_on_the_newer_cluster_cascades() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:old", -10).build());
    h.api.seed_stream(
        api_stream("sha256:new", 0)
            .finalizer(CASCADE_FINALIZER)
            .deleting(Utc::now())
            .build(),
    );

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(outcome, Outcome::CascadeDeleted);
    assert!(h.api.stream(&stream_id()).is_none(), "finalizer released");
    assert!(h.app.stream(&stream_id()).is_none(), "deletion propagated");
    assert!(h.app.operations().contains(&ClusterOp::DeleteStream { stream: stream_id() }));
    assert!(!h.api.operations().contains(&ClusterOp::DeleteStream { stream: stream_id() }));
}

#[tokio::test]
async fn deletion_on_the_older_cluster_cascades() {
    let h = Harness::new();
    h.app.seed_stream(
        app_stream("sha256:old", -10)
            .finalizer(CASCADE_FINALIZER)
            .deleting(Utc::now())
            .build(),
    );
    h.api.seed_stream(api_stream("sha256:new", 0).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(outcome, Outcome::CascadeDeleted);
    assert!(h.api.stream(&stream_id()).is_none());
    assert!(h.app.stream(&stream_id()).is_none());
    assert!(tag_writes(&h.api).is_empty());
}

#[tokio::test]
async fn deletion_on_both_clusters_only_releases_finalizers() {
    let h = Harness::new();
    h.app.seed_stream(
        app_stream("sha256:new", 0)
            .finalizer(CASCADE_FINALIZER)
            .deleting(Utc::now())
            .build(),
    );
    h.api.seed_stream(
        api_stream("sha256:old", -10)
            .finalizer(CASCADE_FINALIZER)
            .deleting(Utc::now())
            .build(),
    );

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(outcome, Outcome::CascadeDeleted);
    for cluster in [&h.api, &h.app] {
        assert!(cluster.stream(&stream_id()).is_none());
        assert!(
            !cluster
                .operations()
                .iter()
                .any(|op| matches!(op, ClusterOp::DeleteStream { .. })),
            "already deleting streams are not deleted again"
        );
    }
}

#[tokio::test]
async fn due_soft_delete_removes_the_tag_everywhere() {
    let h = Harness::new();
    let due = annotations([(SOFT_DELETE_ANNOTATION, "2024-01-01T11:00:00Z")]);
    h.app.seed_stream(
        StreamBuilder::new("ci", "applyconfig")
            .tag_with("latest", "sha256:old", at_minutes(-10), due, None)
            .tag("other", "sha256:other", at_minutes(-10))
            .build(),
    );
    h.api.seed_stream(api_stream("sha256:new", 0).build());

    let outcome = h
        .reconciler
        .reconcile_at(&request(), at_minutes(0))
        .await
        .expect("reconcile");
    assert_eq!(
        outcome,
        Outcome::SoftDeleted {
            cluster: APP_CI.into()
        }
    );
    assert!(h.api.tag(&tag_id()).is_none());
    assert!(h.app.tag(&tag_id()).is_none());
    assert!(
        h.app.tag(&TagIdentity::new("ci", "applyconfig", "other")).is_some(),
        "other tags survive"
    );
    assert!(h.app.stream(&stream_id()).is_some(), "streams survive");
}

#[tokio::test]
async fn future_soft_delete_does_not_block_sync() {
    let h = Harness::new();
    let later = annotations([(SOFT_DELETE_ANNOTATION, "2024-01-02T00:00:00Z")]);
    h.app.seed_stream(
        StreamBuilder::new("ci", "applyconfig")
            .tag_with("latest", "sha256:new", at_minutes(0), later.clone(), None)
            .build(),
    );

    let outcome = h
        .reconciler
        .reconcile_at(&request(), at_minutes(1))
        .await
        .expect("reconcile");
    assert!(matches!(outcome, Outcome::Synced { .. }));
    assert_eq!(h.api.tag(&tag_id()).map(|t| t.annotations), Some(later));
}

#[tokio::test]
async fn malformed_soft_delete_is_terminal() {
    let h = Harness::new();
    let bad = annotations([(SOFT_DELETE_ANNOTATION, "tomorrow")]);
    h.app.seed_stream(
        StreamBuilder::new("ci", "applyconfig")
            .tag_with("latest", "sha256:new", at_minutes(0), bad, None)
            .build(),
    );

    let err = h.reconcile().await.expect_err("malformed deadline");
    assert!(err.is_terminal());
    assert!(tag_writes(&h.api).is_empty());
}

#[tokio::test]
async fn malformed_request_is_terminal_and_touches_nothing() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    for name in ["applyconfig", "applyconfig:latest:extra"] {
        let err = h
            .reconciler
            .reconcile(&TagRequest::new("ci", name))
            .await
            .expect_err("malformed key");
        assert!(err.is_terminal(), "{name}");
    }
    assert!(h.api.operations().is_empty());
    assert!(h.app.operations().is_empty());
}

#[tokio::test]
async fn absent_tag_is_not_an_error() {
    let h = Harness::new();
    assert_eq!(h.reconcile().await.expect("reconcile"), Outcome::Absent);
    assert!(h.api.operations().is_empty());
}

#[tokio::test]
async fn exact_tie_elects_the_first_cluster_by_name() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:app", 0).build());
    h.api.seed_stream(api_stream("sha256:api", 0).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert!(matches!(outcome, Outcome::Synced { ref source, .. } if source == API_CI));
    assert_eq!(
        h.app.tag(&tag_id()).and_then(|t| t.from).map(|f| f.name),
        Some("registry.svc.ci.openshift.org/ci/applyconfig@sha256:api".to_string())
    );
}

#[tokio::test]
async fn image_imported_from_the_follower_is_not_reflected_back() {
    let h = Harness::new();
    let from = ImageSource::docker_image("registry.svc.ci.openshift.org/ci/applyconfig@sha256:x");
    h.app.seed_stream(
        StreamBuilder::new("ci", "applyconfig")
            .tag_with("latest", "sha256:x", at_minutes(0), BTreeMap::new(), Some(from))
            .build(),
    );

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(
        outcome,
        Outcome::Synced {
            source: APP_CI.into(),
            followers: BTreeMap::from([(
                API_CI.to_string(),
                FollowerOutcome::ImportedFromTarget
            )]),
        }
    );
    assert!(h.api.operations().is_empty());
}

#[tokio::test]
async fn second_pass_writes_no_tags() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:new", 0).build());
    h.api.seed_stream(api_stream("sha256:old", -10).build());

    h.reconcile().await.expect("first pass");
    h.clear_operations();
    h.reconcile().await.expect("second pass");

    assert!(tag_writes(&h.api).is_empty());
    assert!(tag_writes(&h.app).is_empty());
}

#[tokio::test]
async fn second_pass_finds_the_third_cluster_up_to_date() {
    let h = Harness::with_options(fast_options(), true);
    let build01 = h.build01.clone().expect("third cluster");
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    h.reconcile().await.expect("first pass");
    h.clear_operations();
    let outcome = h.reconcile().await.expect("second pass");

    let Outcome::Synced { source, followers } = outcome else {
        panic!("expected a sync, got {outcome:?}");
    };
    assert!(source == API_CI || source == BUILD01, "a fresh copy is newest: {source}");
    let other = if source == API_CI { BUILD01 } else { API_CI };
    assert_eq!(
        followers,
        BTreeMap::from([
            (APP_CI.to_string(), FollowerOutcome::ImportedFromTarget),
            (other.to_string(), FollowerOutcome::UpToDate),
        ])
    );
    assert!(tag_writes(&h.api).is_empty());
    assert!(tag_writes(&h.app).is_empty());
    assert!(tag_writes(&build01).is_empty());
}

#[tokio::test]
async fn follower_waits_for_its_cache() {
    let h = Harness::new();
    h.api.set_cache_lag(3);
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    h.reconcile().await.expect("reconcile after lag");
    assert!(h.api.tag(&tag_id()).is_some());
}

#[tokio::test]
async fn cache_that_never_catches_up_times_out() {
    let options = ReconcilerOptions {
        cache_poll: PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        },
        ..ReconcilerOptions::default()
    };
    let h = Harness::with_options(options, false);
    h.api.set_cache_lag(u32::MAX);
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    let err = h.reconcile().await.expect_err("cache never visible");
    assert!(!err.is_terminal());
    assert!(err.to_string().contains("waiting for imagestream"));
    assert!(tag_writes(&h.api).is_empty());
}

#[tokio::test]
async fn server_side_import_mode() {
    let h = Harness::with_options(
        ReconcilerOptions {
            import_mode: ImportMode::ServerSideImport,
            ..fast_options()
        },
        false,
    );
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    h.reconcile().await.expect("reconcile");
    assert_eq!(
        tag_writes(&h.api),
        vec![ClusterOp::Import {
            tag: tag_id(),
            from: "registry.ci.openshift.org/ci/applyconfig@sha256:new".into(),
        }]
    );
    assert_eq!(
        h.api.tag(&tag_id()).and_then(|t| t.image).map(|i| i.name),
        Some("sha256:new".to_string())
    );
}

#[tokio::test]
async fn failed_server_side_import_reports_the_reason() {
    let h = Harness::with_options(
        ReconcilerOptions {
            import_mode: ImportMode::ServerSideImport,
            ..fast_options()
        },
        false,
    );
    h.api.fail_imports("Unauthorized", "you may not pull");
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    let err = h.reconcile().await.expect_err("import failed");
    let message = err.to_string();
    assert!(message.contains("Unauthorized"), "{message}");
    assert!(message.contains("you may not pull"), "{message}");
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn dry_run_prepares_the_follower_without_importing() {
    let h = Harness::with_options(
        ReconcilerOptions {
            dry_run: true,
            ..fast_options()
        },
        false,
    );
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    let outcome = h.reconcile().await.expect("reconcile");
    assert_eq!(
        outcome,
        Outcome::Synced {
            source: APP_CI.into(),
            followers: BTreeMap::from([(API_CI.to_string(), FollowerOutcome::DryRun)]),
        }
    );
    assert!(tag_writes(&h.api).is_empty());
    assert!(h.api.stream(&stream_id()).is_some());
}

#[tokio::test]
async fn one_failing_follower_does_not_block_the_others() {
    let h = Harness::with_options(fast_options(), true);
    let build01 = h.build01.clone().expect("third cluster");
    h.app.seed_stream(app_stream("sha256:new", 0).build());
    h.api.inject_failure("create_tag:");

    let err = h.reconcile().await.expect_err("api.ci failed");
    assert!(!err.is_terminal());
    assert!(err.to_string().contains(API_CI));
    assert_eq!(
        build01.tag(&tag_id()).and_then(|t| t.image).map(|i| i.name),
        Some("sha256:new".to_string())
    );

    h.api.clear_failures();
    h.reconcile().await.expect("retry converges");
    assert!(h.api.tag(&tag_id()).is_some());
}

#[tokio::test]
async fn failures_on_several_followers_are_aggregated() {
    let h = Harness::with_options(fast_options(), true);
    let build01 = h.build01.clone().expect("third cluster");
    h.app.seed_stream(app_stream("sha256:new", 0).build());
    h.api.inject_failure("get_namespace:");
    build01.inject_failure("get_namespace:");

    let err = h.reconcile().await.expect_err("both followers failed");
    match err {
        Error::Aggregate { errors } => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate, got {other}"),
    }
}

#[tokio::test]
async fn unreachable_cluster_during_fetch_fails_the_pass() {
    let h = Harness::new();
    h.app.seed_stream(app_stream("sha256:new", 0).build());
    h.api.inject_failure("get_tag:");

    let err = h.reconcile().await.expect_err("fetch failed");
    assert!(!err.is_terminal());
    assert!(h.api.operations().is_empty());
    assert!(tag_writes(&h.app).is_empty());
}

#[tokio::test]
async fn drift_against_the_external_registry_queues_a_mirror() {
    let inspector = StaticInspector::new();
    inspector.insert("quay.io/openshift/ci:ci_applyconfig_latest", "sha256:stale");
    let store = MirrorStore::new();
    let detector = DriftDetector::new(Arc::new(inspector.clone()), store.clone());
    let h = Harness::new().with_drift(detector);
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    h.reconcile().await.expect("reconcile");

    let (tasks, total) = store.show(10).expect("show");
    assert_eq!(total, 1);
    let task = &tasks[0];
    assert_eq!(task.source, "registry.ci.openshift.org/ci/applyconfig@sha256:new");
    assert_eq!(task.destination, "quay.io/openshift/ci:ci_applyconfig_latest");
    assert_eq!(task.last_digest, "sha256:stale");
    assert!(task.stale);
    assert_eq!(task.source_tag, tag_id());
    assert_eq!(
        inspector.inspected(),
        vec!["quay.io/openshift/ci:ci_applyconfig_latest".to_string()]
    );
}

#[tokio::test]
async fn external_copy_in_sync_queues_nothing() {
    let inspector = StaticInspector::new();
    inspector.insert("quay.io/openshift/ci:ci_applyconfig_latest", "sha256:new");
    let store = MirrorStore::new();
    let detector = DriftDetector::new(Arc::new(inspector), store.clone());
    let h = Harness::new().with_drift(detector);
    h.app.seed_stream(app_stream("sha256:new", 0).build());

    h.reconcile().await.expect("reconcile");
    assert!(store.is_empty().expect("len"));
}
