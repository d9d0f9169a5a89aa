//! Error types for the synchronisation engine.

/// The result type used throughout tagsync-controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling tags or draining mirror tasks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cluster call failed.
    #[error("{operation} on cluster {cluster}: {source}")]
    Cluster {
        /// Cluster the call went to.
        cluster: String,
        /// What was being attempted, e.g. `get imagestream ci/app`.
        operation: String,
        /// The underlying error.
        #[source]
        source: tagsync_core::Error,
    },

    /// The request can never succeed without an external change.
    #[error("terminal error: {message}")]
    Terminal {
        /// Description of the failure.
        message: String,
    },

    /// Several independent operations failed.
    #[error("{} errors occurred: [{}]", .errors.len(), join(.errors))]
    Aggregate {
        /// Individual failures, in the order they happened.
        errors: Vec<Error>,
    },

    /// Invalid runtime configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting.
        message: String,
    },

    /// The external mirror tool failed.
    #[error("mirror failed: {message}")]
    Mirror {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<tagsync_core::Error>,
    },

    /// An error from tagsync-core without cluster context.
    #[error("core error: {0}")]
    Core(#[from] tagsync_core::Error),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Wraps a core error with the cluster and operation it came from.
    #[must_use]
    pub fn cluster(
        cluster: impl Into<String>,
        operation: impl Into<String>,
        source: tagsync_core::Error,
    ) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Creates a terminal error.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a mirror error with a source.
    #[must_use]
    pub fn mirror(message: impl Into<String>, source: tagsync_core::Error) -> Self {
        Self::Mirror {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Combines the failures of a fan-out.
    ///
    /// # Errors
    ///
    /// Returns the single error unchanged if there is exactly one, or an
    /// [`Error::Aggregate`] if there are several.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate { errors }),
        }
    }

    /// Returns true if retrying cannot help.
    ///
    /// An aggregate is terminal only if every member is.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Terminal { .. } | Self::Configuration { .. } => true,
            Self::Cluster { source, .. } | Self::Core(source) => source.is_terminal(),
            Self::Aggregate { errors } => errors.iter().all(Self::is_terminal),
            Self::Mirror { .. } => false,
        }
    }

    /// Returns true if the failure is a write race resolved by the next event.
    #[must_use]
    pub fn is_conflict_or_exists(&self) -> bool {
        match self {
            Self::Cluster { source, .. } | Self::Core(source) => source.is_conflict_or_exists(),
            Self::Aggregate { errors } => errors.iter().all(Self::is_conflict_or_exists),
            _ => false,
        }
    }

    /// Returns true if the failure is a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Cluster { source, .. } | Self::Core(source) => source.is_not_found(),
            _ => false,
        }
    }
}

/// Attaches cluster context to core results.
pub(crate) trait ClusterContext<T> {
    fn on_cluster(self, cluster: &str, operation: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ClusterContext<T> for tagsync_core::Result<T> {
    fn on_cluster(self, cluster: &str, operation: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::cluster(cluster, operation(), e))
    }
}
