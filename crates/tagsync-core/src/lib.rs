//! # tagsync-core
//!
//! Shared primitives for replicating image stream tags across clusters.
//!
//! - **Identities**: streams, tags, and the `namespace/stream:tag` request key
//! - **Resource model**: streams, tag snapshots, namespaces, pull secrets
//! - **Cluster contract**: the per-cluster [`ClusterClient`] and the ordered
//!   [`ClusterSet`] registry
//! - **Image tooling**: inspection and mirroring contracts plus registry
//!   hostname rewriting
//! - **Errors**: the not-found / conflict / terminal / retriable taxonomy
//!
//! ## Example
//!
//! ```rust
//! use tagsync_core::prelude::*;
//!
//! let request: TagRequest = "ci/applyconfig:latest".parse().unwrap();
//! let tag = TagIdentity::try_from(&request).unwrap();
//! assert_eq!(tag.stream_identity().to_string(), "ci/applyconfig");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cluster;
pub mod error;
pub mod id;
pub mod image;
pub mod model;
pub mod observability;
pub mod well_known;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterClient, ClusterSet, StreamEvent};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::id::{StreamIdentity, TagIdentity, TagRequest};
    pub use crate::image::{
        ImageInfo, ImageInspector, ImageMirrorer, InspectOptions, MirrorOptions, MirrorPair,
        RegistryDomain, RegistryDomains,
    };
    pub use crate::model::{
        ImageBinding, ImageImport, ImageSource, ImageStream, ImportStatus, NamedTagHistory,
        Namespace, ObjectMeta, PullSecret, SourceKind, StreamSpec, StreamStatus, TagEvent,
        TagReference, TagSnapshot,
    };
}

pub use cluster::{ClusterClient, ClusterSet, StreamEvent};
pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
