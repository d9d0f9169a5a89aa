//! Runtime configuration for the controller.
//!
//! Every setting has a default and can be overridden through a `TAGSYNC_*`
//! environment variable. Invalid values are rejected rather than silently
//! replaced by defaults.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use tagsync_core::cluster::ClusterSet;
use tagsync_core::image::{RegistryDomain, RegistryDomains};
use tagsync_core::observability::LogFormat;

use crate::error::{Error, Result};

const ENV_WORKERS: &str = "TAGSYNC_WORKERS";
const ENV_CACHE_POLL_INTERVAL_MS: &str = "TAGSYNC_CACHE_POLL_INTERVAL_MS";
const ENV_CACHE_POLL_TIMEOUT_MS: &str = "TAGSYNC_CACHE_POLL_TIMEOUT_MS";
const ENV_IMPORT_MODE: &str = "TAGSYNC_IMPORT_MODE";
const ENV_DRY_RUN: &str = "TAGSYNC_DRY_RUN";
const ENV_MIRROR_BATCH_SIZE: &str = "TAGSYNC_MIRROR_BATCH_SIZE";
const ENV_MIRROR_INTERVAL_SECS: &str = "TAGSYNC_MIRROR_INTERVAL_SECS";
const ENV_MIRROR_MAX_PER_REGISTRY: &str = "TAGSYNC_MIRROR_MAX_PER_REGISTRY";
const ENV_REGISTRY_DOMAINS: &str = "TAGSYNC_REGISTRY_DOMAINS";
const ENV_DENIED_STREAMS: &str = "TAGSYNC_DENIED_STREAMS";
const ENV_ALLOWED_STREAM_PREFIXES: &str = "TAGSYNC_ALLOWED_STREAM_PREFIXES";
const ENV_IGNORE_RELEASE_CONTROLLER_STREAMS: &str = "TAGSYNC_IGNORE_RELEASE_CONTROLLER_STREAMS";
const ENV_LOG_FORMAT: &str = "TAGSYNC_LOG_FORMAT";

const DEFAULT_WORKERS: u64 = 1;
const DEFAULT_CACHE_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_CACHE_POLL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MIRROR_BATCH_SIZE: u64 = 100;
const DEFAULT_MIRROR_INTERVAL_SECS: u64 = 60;
const DEFAULT_MIRROR_MAX_PER_REGISTRY: u64 = 4;

/// How a follower receives the source's image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportMode {
    /// Create a server-side import and inspect its status.
    ServerSideImport,
    /// Upsert the follower tag with an explicit image reference.
    #[default]
    TagReference,
}

impl FromStr for ImportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "import" => Ok(Self::ServerSideImport),
            "tag-reference" => Ok(Self::TagReference),
            other => Err(Error::configuration(format!(
                "{ENV_IMPORT_MODE} must be `import` or `tag-reference`, got '{other}'"
            ))),
        }
    }
}

/// Bounded retry used while waiting for a write to reach a read cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between attempts.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_CACHE_POLL_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_CACHE_POLL_TIMEOUT_MS),
        }
    }
}

/// Which tag requests are eligible for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Streams (`namespace/name`) never synchronised.
    pub denied_streams: BTreeSet<String>,
    /// `namespace/name` prefixes allowed even inside denied namespaces.
    pub allowed_prefixes: Vec<String>,
    /// Skip non-release streams in release-controller namespaces.
    pub ignore_release_controller_streams: bool,
}

/// Settings for draining the mirror task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Tasks taken per batch.
    pub batch_size: usize,
    /// Delay between batches.
    pub interval: Duration,
    /// Concurrent copies per registry.
    pub max_per_registry: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_secs(DEFAULT_MIRROR_INTERVAL_SECS),
            max_per_registry: 4,
        }
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,
    /// Wait-for-cache settings.
    pub cache_poll: PollConfig,
    /// How followers receive images.
    pub import_mode: ImportMode,
    /// Log and count imports without writing.
    pub dry_run: bool,
    /// Mirror consumer settings.
    pub mirror: MirrorConfig,
    /// Explicit registry hostnames; `None` uses the CI defaults.
    pub registry_domains: Option<Vec<RegistryDomain>>,
    /// Request filter settings.
    pub filter: FilterConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_poll: PollConfig::default(),
            import_mode: ImportMode::default(),
            dry_run: false,
            mirror: MirrorConfig::default(),
            registry_domains: None,
            filter: FilterConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a value is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a value is malformed.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers = to_usize(
            ENV_WORKERS,
            parse_positive_u64_env(&get_env, ENV_WORKERS, DEFAULT_WORKERS)?,
        )?;
        let cache_poll = PollConfig {
            interval: Duration::from_millis(parse_positive_u64_env(
                &get_env,
                ENV_CACHE_POLL_INTERVAL_MS,
                DEFAULT_CACHE_POLL_INTERVAL_MS,
            )?),
            timeout: Duration::from_millis(parse_positive_u64_env(
                &get_env,
                ENV_CACHE_POLL_TIMEOUT_MS,
                DEFAULT_CACHE_POLL_TIMEOUT_MS,
            )?),
        };
        if cache_poll.interval > cache_poll.timeout {
            return Err(Error::configuration(format!(
                "{ENV_CACHE_POLL_INTERVAL_MS} must not exceed {ENV_CACHE_POLL_TIMEOUT_MS}"
            )));
        }

        let import_mode = get_env(ENV_IMPORT_MODE)
            .map(|raw| raw.parse::<ImportMode>())
            .transpose()?
            .unwrap_or_default();
        let dry_run = parse_bool_env(&get_env, ENV_DRY_RUN)?;

        let max_per_registry = parse_positive_u64_env(
            &get_env,
            ENV_MIRROR_MAX_PER_REGISTRY,
            DEFAULT_MIRROR_MAX_PER_REGISTRY,
        )?;
        let mirror = MirrorConfig {
            batch_size: to_usize(
                ENV_MIRROR_BATCH_SIZE,
                parse_positive_u64_env(&get_env, ENV_MIRROR_BATCH_SIZE, DEFAULT_MIRROR_BATCH_SIZE)?,
            )?,
            interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_MIRROR_INTERVAL_SECS,
                DEFAULT_MIRROR_INTERVAL_SECS,
            )?),
            max_per_registry: u32::try_from(max_per_registry).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_MIRROR_MAX_PER_REGISTRY} value {max_per_registry} exceeds supported range"
                ))
            })?,
        };

        let registry_domains = get_env(ENV_REGISTRY_DOMAINS)
            .map(|raw| {
                serde_json::from_str::<Vec<RegistryDomain>>(&raw).map_err(|e| {
                    Error::configuration(format!("{ENV_REGISTRY_DOMAINS} is not valid: {e}"))
                })
            })
            .transpose()?;

        let filter = FilterConfig {
            denied_streams: parse_list_env(&get_env, ENV_DENIED_STREAMS).into_iter().collect(),
            allowed_prefixes: parse_list_env(&get_env, ENV_ALLOWED_STREAM_PREFIXES),
            ignore_release_controller_streams: parse_bool_env(
                &get_env,
                ENV_IGNORE_RELEASE_CONTROLLER_STREAMS,
            )?,
        };
        if let Some(bad) = filter.denied_streams.iter().find(|s| !s.contains('/')) {
            return Err(Error::configuration(format!(
                "{ENV_DENIED_STREAMS} entry '{bad}' must be of the form namespace/name"
            )));
        }

        let log_format = get_env(ENV_LOG_FORMAT)
            .map(|raw| {
                raw.parse::<LogFormat>()
                    .map_err(|e| Error::configuration(format!("{ENV_LOG_FORMAT}: {e}")))
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            workers,
            cache_poll,
            import_mode,
            dry_run,
            mirror,
            registry_domains,
            filter,
            log_format,
        })
    }

    /// Registry hostnames for the given clusters.
    #[must_use]
    pub fn registry_domains(&self, clusters: &ClusterSet) -> RegistryDomains {
        match &self.registry_domains {
            Some(domains) => RegistryDomains::new(domains.iter().cloned()),
            None => RegistryDomains::ci_defaults(clusters.names()),
        }
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_bool_env<F>(get_env: &F, key: &str) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(other) => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_list_env<F>(get_env: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn to_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        Error::configuration(format!("{key} value {value} exceeds supported range"))
    })
}
