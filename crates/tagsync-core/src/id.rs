//! Identities for streams, tags, and reconcile requests.
//!
//! A [`TagRequest`] is what travels through the work queue: a namespace and
//! a composite `stream:tag` name, rendered as `namespace/stream:tag`. It is
//! only turned into a [`TagIdentity`] when the composite name splits into
//! exactly one stream and one tag.
//!
//! # Example
//!
//! ```rust
//! use tagsync_core::id::{TagIdentity, TagRequest};
//!
//! let request: TagRequest = "ci/applyconfig:latest".parse().unwrap();
//! let tag = TagIdentity::try_from(&request).unwrap();
//! assert_eq!(tag.stream, "applyconfig");
//! assert_eq!(tag.tag, "latest");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A namespaced image stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamIdentity {
    /// Namespace holding the stream.
    pub namespace: String,
    /// Stream name.
    pub name: String,
}

impl StreamIdentity {
    /// Creates a stream identity.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the identity of one of this stream's tags.
    #[must_use]
    pub fn tag(&self, tag: impl Into<String>) -> TagIdentity {
        TagIdentity {
            namespace: self.namespace.clone(),
            stream: self.name.clone(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single tag within a stream. Globally meaningful across clusters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagIdentity {
    /// Namespace holding the stream.
    pub namespace: String,
    /// Owning stream name.
    pub stream: String,
    /// Tag name within the stream.
    pub tag: String,
}

impl TagIdentity {
    /// Creates a tag identity.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        stream: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
            tag: tag.into(),
        }
    }

    /// Returns the owning stream.
    #[must_use]
    pub fn stream_identity(&self) -> StreamIdentity {
        StreamIdentity::new(&self.namespace, &self.stream)
    }

    /// Returns the composite `stream:tag` name.
    #[must_use]
    pub fn composite_name(&self) -> String {
        format!("{}:{}", self.stream, self.tag)
    }

    /// Returns the queue key for this tag.
    #[must_use]
    pub fn request(&self) -> TagRequest {
        TagRequest::new(&self.namespace, self.composite_name())
    }
}

impl fmt::Display for TagIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.stream, self.tag)
    }
}

impl TryFrom<&TagRequest> for TagIdentity {
    type Error = Error;

    fn try_from(request: &TagRequest) -> Result<Self> {
        let (stream, tag) = split_composite_name(&request.name)?;
        Ok(Self::new(&request.namespace, stream, tag))
    }
}

/// Splits `stream:tag` into its parts.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] unless the name contains exactly one
/// colon with a non-empty part on each side.
pub fn split_composite_name(name: &str) -> Result<(&str, &str)> {
    let parts = name.split(':').count();
    if parts != 2 {
        return Err(Error::invalid_request(format!(
            "splitting {name} by `:` didn't yield two but {parts} results"
        )));
    }
    match name.split_once(':') {
        Some((stream, tag)) if !stream.is_empty() && !tag.is_empty() => Ok((stream, tag)),
        _ => Err(Error::invalid_request(format!(
            "tag name {name} must be of the form <stream>:<tag>"
        ))),
    }
}

/// A reconcile request key: a namespace plus a composite `stream:tag` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagRequest {
    /// Namespace of the stream.
    pub namespace: String,
    /// Composite `stream:tag` name; validated only when converted.
    pub name: String,
}

impl TagRequest {
    /// Creates a request key without validating the name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TagRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for TagRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::invalid_request(format!(
                "request key {s} must be of the form <namespace>/<stream>:<tag>"
            ))),
        }
    }
}
