//! Recording fakes for the image tooling contracts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tagsync_core::error::{Error, Result};
use tagsync_core::image::{
    ImageInfo, ImageInspector, ImageMirrorer, InspectOptions, MirrorOptions, MirrorPair,
};

/// One call to [`ImageMirrorer::mirror`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCall {
    /// Pairs passed to the call.
    pub pairs: Vec<MirrorPair>,
    /// Options passed to the call.
    pub options: MirrorOptions,
}

/// Mirrorer that records calls and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingMirrorer {
    calls: Arc<Mutex<Vec<MirrorCall>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingMirrorer {
    /// Creates a mirrorer that succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().expect("lock") = Some(message.into());
    }

    /// Returns recorded calls.
    pub fn calls(&self) -> Vec<MirrorCall> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ImageMirrorer for RecordingMirrorer {
    async fn mirror(&self, pairs: &[MirrorPair], options: &MirrorOptions) -> Result<()> {
        self.calls.lock().expect("lock").push(MirrorCall {
            pairs: pairs.to_vec(),
            options: options.clone(),
        });
        match self.failure.lock().expect("lock").as_ref() {
            Some(message) => Err(Error::unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

/// Inspector answering from a fixed table; unknown references are missing.
#[derive(Debug, Clone, Default)]
pub struct StaticInspector {
    images: Arc<Mutex<HashMap<String, ImageInfo>>>,
    inspected: Arc<Mutex<Vec<String>>>,
}

impl StaticInspector {
    /// Creates an inspector that knows no images.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `reference` with `digest`.
    pub fn insert(&self, reference: impl Into<String>, digest: impl Into<String>) {
        self.images.lock().expect("lock").insert(
            reference.into(),
            ImageInfo {
                digest: digest.into(),
                architecture: "amd64".to_string(),
                created: None,
            },
        );
    }

    /// Returns every reference inspected so far.
    pub fn inspected(&self) -> Vec<String> {
        self.inspected.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ImageInspector for StaticInspector {
    async fn inspect(&self, reference: &str, _options: &InspectOptions) -> Result<ImageInfo> {
        self.inspected.lock().expect("lock").push(reference.to_string());
        Ok(self
            .images
            .lock()
            .expect("lock")
            .get(reference)
            .cloned()
            .unwrap_or_default())
    }
}
