//! Well-known names shared with the clusters and other tooling.

/// Finalizer placed on every synchronised stream so deletions cascade.
pub const CASCADE_FINALIZER: &str = "dptp.openshift.io/registry-syncer";

/// Tag annotation holding an RFC 3339 instant after which the tag is removed
/// from every cluster.
pub const SOFT_DELETE_ANNOTATION: &str = "release.openshift.io/soft-delete";

/// Stream annotations with this prefix are copied to followers.
pub const RELEASE_ANNOTATION_PREFIX: &str = "release.openshift.io";

/// Label put on namespaces created by the syncer.
pub const REQUESTER_LABEL: &str = "dptp.openshift.io/requester";

/// Name of the pull credential placed in every follower namespace.
pub const PULL_SECRET_NAME: &str = "registry-cluster-pull-secret";

/// Cluster whose registry uses the legacy internal and public hostnames.
pub const LEGACY_CLUSTER: &str = "api.ci";
