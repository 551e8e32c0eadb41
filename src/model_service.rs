use crate::detection::Detections;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model weights not found: {0}")]
    WeightsNotFound(String),
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Failed to load class labels: {0}")]
    Labels(#[from] crate::labels::LabelsError),
    #[error("Model has {outputs} output classes but {labels} class labels")]
    ClassCountMismatch { labels: usize, outputs: usize },
    #[error("Image decoding error: {0}")]
    ImageDecode(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A detector that reads an image from disk and returns its detections.
///
/// Calls block for the duration of inference and must not run on async worker threads.
pub trait DetectionModel: Send + Sync + 'static {
    fn predict(&self, image_path: &Path) -> Result<Detections, ModelError>;

    /// Whether the weights are in memory. Lazily loaded models report `false` until first use.
    fn is_loaded(&self) -> bool {
        true
    }
}
