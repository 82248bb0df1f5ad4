//! Sequences one enhancement request over storage, the model and the pipeline.

use std::sync::Arc;

use crate::lifecycle::{InferenceError, ModelManager, ModelState};
use crate::pipeline::{self, PipelineError};
use crate::storage::{ImageStore, Namespace, StorageError, UploadError, UploadPolicy};

pub const IMPROVED_PREFIX: &str = "improved_";

/// Name of the enhanced output derived from a stored source name.
pub fn improved_name(name: &str) -> String {
    format!("{IMPROVED_PREFIX}{name}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancementResult {
    pub improved_name: String,
    pub success: bool,
    /// The output is a byte copy of the source because no model was available.
    pub fallback: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    #[error("source image {0:?} not found")]
    SourceNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("enhancing {name:?} failed: {cause}")]
    Processing {
        name: String,
        #[source]
        cause: ProcessingError,
    },
}

impl EnhanceError {
    /// The undecodable-input case, which callers report differently from other failures.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            EnhanceError::Processing {
                cause: ProcessingError::Pipeline(PipelineError::Decode(_) | PipelineError::TooSmall { .. }),
                ..
            }
        )
    }
}

#[derive(Clone)]
pub struct Enhancer {
    store: Arc<dyn ImageStore>,
    models: Arc<ModelManager>,
    uploads: UploadPolicy,
}

impl Enhancer {
    pub fn new(store: Arc<dyn ImageStore>, models: Arc<ModelManager>, uploads: UploadPolicy) -> Self {
        Self {
            store,
            models,
            uploads,
        }
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn upload_policy(&self) -> &UploadPolicy {
        &self.uploads
    }

    /// Validates an upload, stores it under a fresh unique name and returns that name.
    pub fn accept_upload(&self, filename: &str, bytes: &[u8]) -> Result<String, UploadError> {
        self.uploads.validate_image_size(bytes)?;
        let stored = self.uploads.generate_stored_name(filename)?;
        self.store.save(Namespace::Original, &stored, bytes)?;
        log::info!("Stored upload {filename:?} as {stored}");
        Ok(stored)
    }

    /// Enhances the stored original `name` into `improved_<name>`.
    ///
    /// Without a ready model the source is copied byte for byte. Once the
    /// model is ready, any pipeline failure is returned rather than masked by
    /// a copy.
    pub fn enhance(&self, name: &str) -> Result<EnhancementResult, EnhanceError> {
        if !self.store.exists(Namespace::Original, name) {
            return Err(EnhanceError::SourceNotFound(name.to_string()));
        }
        let target = improved_name(name);
        let source = self.store.load(Namespace::Original, name)?;

        if self.models.warmup() != ModelState::Ready {
            log::debug!("Model unavailable, copying {name} to {target}");
            self.store.save(Namespace::Improved, &target, &source)?;
            return Ok(EnhancementResult {
                improved_name: target,
                success: true,
                fallback: true,
                width: None,
                height: None,
            });
        }

        let (width, height) = self
            .run_pipeline(&source, &target)
            .map_err(|cause| EnhanceError::Processing {
                name: name.to_string(),
                cause,
            })?;
        log::info!("Enhanced {name} into {target} ({width}x{height})");
        Ok(EnhancementResult {
            improved_name: target,
            success: true,
            fallback: false,
            width: Some(width),
            height: Some(height),
        })
    }

    fn run_pipeline(&self, source: &[u8], target: &str) -> Result<(u32, u32), ProcessingError> {
        let scale = self
            .models
            .descriptor()
            .ok_or(InferenceError::ModelNotReady)?
            .scale_factor;

        let input = pipeline::preprocess(source, scale)?;
        log::debug!("Preprocessed {target} input to {:?}", input.shape());
        let output = self.models.infer(&input)?;
        let image = pipeline::postprocess(&output)?;
        let dimensions = image.dimensions();
        let encoded = pipeline::encode(image, target)?;
        self.store.save(Namespace::Improved, target, &encoded)?;
        Ok(dimensions)
    }
}
