//! Eligibility filter applied to tag requests before they are enqueued.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tagsync_core::id::{StreamIdentity, TagRequest, split_composite_name};

use crate::config::FilterConfig;

/// Namespace prefixes that are only synchronised when explicitly allowed.
pub const DENIED_NAMESPACE_PREFIXES: [&str; 6] =
    ["kube", "openshift", "default", "redhat", "ci-op", "ci-ln"];

/// Namespaces owned by the release controller.
pub const RELEASE_CONTROLLER_NAMESPACES: [&str; 6] = [
    "ocp",
    "ocp-priv",
    "ocp-ppc64le",
    "ocp-ppc64le-priv",
    "ocp-s390x",
    "ocp-s390x-priv",
];

// Release streams (`4.x`, `4.x.y`, `4.x-rc.n`) plus anything not starting with `4`.
#[allow(clippy::expect_used)]
static RELEASE_STREAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: the pattern is a literal covered by the filter tests, so it always compiles.
    Regex::new(r"^(4\.\d+(|\.\d+)(|-(f|r)c\.\d+)|[^4]\S+)$").expect("valid regex")
});

/// Decides which tag requests are worth reconciling.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    denied_streams: BTreeSet<String>,
    allowed_prefixes: Vec<String>,
    ignore_release_controller_streams: bool,
}

impl RequestFilter {
    /// Builds a filter from configuration.
    #[must_use]
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            denied_streams: config.denied_streams.clone(),
            allowed_prefixes: config.allowed_prefixes.clone(),
            ignore_release_controller_streams: config.ignore_release_controller_streams,
        }
    }

    /// A filter that admits every well-formed request.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Returns true if the request should be enqueued.
    #[must_use]
    pub fn admits(&self, request: &TagRequest) -> bool {
        let stream = match split_composite_name(&request.name) {
            Ok((stream, _)) => StreamIdentity::new(&request.namespace, stream),
            Err(e) => {
                tracing::error!(request = %request, error = %e, "failed to derive stream name for tag request");
                return false;
            }
        };
        let key = stream.to_string();

        if self.denied_streams.contains(&key) {
            return false;
        }
        if DENIED_NAMESPACE_PREFIXES
            .iter()
            .any(|prefix| stream.namespace.starts_with(prefix))
        {
            return self.allowed_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        }
        if self.ignore_release_controller_streams && is_ignored_release_stream(&stream) {
            return false;
        }
        true
    }
}

fn is_ignored_release_stream(stream: &StreamIdentity) -> bool {
    RELEASE_CONTROLLER_NAMESPACES.contains(&stream.namespace.as_str())
        && !RELEASE_STREAM_RE.is_match(&stream.name)
}
