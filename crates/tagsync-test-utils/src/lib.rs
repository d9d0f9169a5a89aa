//! Shared test utilities for tagsync integration tests.
//!
//! This crate provides:
//! - [`TracingCluster`]: in-memory cluster with write recording, failure
//!   injection, and simulated cache lag
//! - [`StreamBuilder`] and time helpers for fixtures
//! - [`RecordingMirrorer`] and [`StaticInspector`] for the image tooling
//!
//! # Example
//!
//! ```rust,ignore
//! use tagsync_test_utils::{StreamBuilder, TracingCluster, at_minutes};
//!
//! let app = TracingCluster::new("app.ci");
//! app.seed_stream(StreamBuilder::new("ci", "applyconfig").tag("latest", "sha256:a", at_minutes(0)).build());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod cluster;
pub mod fakes;
pub mod fixtures;

pub use cluster::*;
pub use fakes::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tagsync=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
