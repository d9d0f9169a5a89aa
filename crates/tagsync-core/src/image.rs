//! External image tooling and registry hostnames.
//!
//! Inspecting and copying images is done by an external tool; the engine
//! only depends on the [`ImageInspector`] and [`ImageMirrorer`] contracts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::well_known::LEGACY_CLUSTER;

/// Options for [`ImageInspector::inspect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectOptions {
    /// Path to a registry credential file.
    pub registry_config: Option<PathBuf>,
    /// Restrict manifest lists to one OS/architecture, e.g. `linux/amd64`.
    pub filter_by_os: Option<String>,
}

/// Metadata returned by an inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Content digest; empty when the image does not exist.
    pub digest: String,
    /// Image architecture.
    #[serde(default)]
    pub architecture: String,
    /// Image creation time.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl ImageInfo {
    /// Returns true if the inspected reference did not exist.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.digest.is_empty()
    }
}

/// Reads image metadata from a registry.
#[async_trait]
pub trait ImageInspector: Send + Sync + 'static {
    /// Inspects `reference`.
    ///
    /// A reference that does not exist yields an [`ImageInfo`] with an empty
    /// digest rather than an error.
    async fn inspect(&self, reference: &str, options: &InspectOptions) -> Result<ImageInfo>;
}

/// One copy from a source reference to a destination reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MirrorPair {
    /// Reference to copy from.
    pub source: String,
    /// Reference to copy to.
    pub destination: String,
}

impl fmt::Display for MirrorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.source, self.destination)
    }
}

/// Options for [`ImageMirrorer::mirror`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOptions {
    /// Path to a registry credential file.
    pub registry_config: Option<PathBuf>,
    /// Keep copying remaining pairs when one fails.
    pub continue_on_error: bool,
    /// Maximum concurrent copies per registry.
    pub max_per_registry: u32,
    /// Log what would be copied without copying.
    pub dry_run: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            registry_config: None,
            continue_on_error: true,
            max_per_registry: 4,
            dry_run: false,
        }
    }
}

/// Copies images between registries.
#[async_trait]
pub trait ImageMirrorer: Send + Sync + 'static {
    /// Copies every pair.
    async fn mirror(&self, pairs: &[MirrorPair], options: &MirrorOptions) -> Result<()>;
}

/// Internal and public registry hostnames of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDomain {
    /// Cluster name.
    pub cluster: String,
    /// Cluster-local service hostname of the registry.
    pub internal: String,
    /// Hostname resolvable from outside the cluster.
    pub public: String,
}

/// Registry hostnames for every known cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDomains {
    domains: BTreeMap<String, RegistryDomain>,
}

impl RegistryDomains {
    /// Builds the table from explicit entries; later entries win.
    #[must_use]
    pub fn new(domains: impl IntoIterator<Item = RegistryDomain>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|d| (d.cluster.clone(), d))
                .collect(),
        }
    }

    /// Hostnames of the CI build farm.
    ///
    /// The legacy cluster serves its registry under the old service and
    /// public names; every other cluster uses the operator-managed registry.
    #[must_use]
    pub fn ci_defaults<'a>(clusters: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(clusters.into_iter().map(|cluster| {
            if cluster == LEGACY_CLUSTER {
                RegistryDomain {
                    cluster: cluster.to_string(),
                    internal: "docker-registry.default.svc:5000".to_string(),
                    public: "registry.svc.ci.openshift.org".to_string(),
                }
            } else {
                let public = match cluster.split_once('.') {
                    Some((name, "ci")) if name != "app" => format!("registry.{name}.ci.openshift.org"),
                    _ => "registry.ci.openshift.org".to_string(),
                };
                RegistryDomain {
                    cluster: cluster.to_string(),
                    internal: "image-registry.openshift-image-registry.svc:5000".to_string(),
                    public,
                }
            }
        }))
    }

    /// Returns the entry for a cluster.
    #[must_use]
    pub fn get(&self, cluster: &str) -> Option<&RegistryDomain> {
        self.domains.get(cluster)
    }

    /// Rewrites a reference from `cluster`'s internal registry host to its
    /// public host. References on other hosts are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the cluster is unknown.
    pub fn public_reference(&self, cluster: &str, reference: &str) -> Result<String> {
        let domain = self.get(cluster).ok_or_else(|| {
            Error::invalid_request(format!("no registry domain known for cluster {cluster}"))
        })?;
        Ok(match reference.strip_prefix(domain.internal.as_str()) {
            Some(rest) if rest.starts_with('/') => format!("{}{rest}", domain.public),
            _ => reference.to_string(),
        })
    }

    /// Returns true if `reference` points at `cluster`'s registry under
    /// either of its hostnames.
    #[must_use]
    pub fn is_hosted_on(&self, cluster: &str, reference: &str) -> bool {
        self.get(cluster).is_some_and(|d| {
            [d.public.as_str(), d.internal.as_str()]
                .iter()
                .any(|host| reference.strip_prefix(host).is_some_and(|r| r.starts_with('/')))
        })
    }
}
