use crate::{
    annotation::PlotStyle,
    image_codec::{encode_image_base64, save_temp_image, ImageCodecError},
    model_service::{DetectionModel, ModelError},
};
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub tumor_class: String,
    pub confidence: f32,
    /// Base64 encoded JPEG with every detection drawn in.
    pub image: String,
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Uploaded file is empty")]
    EmptyUpload,
    #[error("Uploaded file is not a readable image: {0}")]
    InvalidImage(String),
    #[error("No detection found in the image")]
    NoDetection,
    #[error("Model error: {0}")]
    Model(ModelError),
    #[error("Failed to write scratch file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode annotated image: {0}")]
    Encode(#[from] ImageCodecError),
    #[error("Prediction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ModelError> for PredictionError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::ImageDecode(reason) => PredictionError::InvalidImage(reason),
            other => PredictionError::Model(other),
        }
    }
}

impl PredictionError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PredictionError::EmptyUpload
                | PredictionError::InvalidImage(_)
                | PredictionError::NoDetection
        )
    }
}

pub struct PredictionService<M: DetectionModel> {
    model: Arc<M>,
    style: Arc<PlotStyle>,
    scratch_dir: PathBuf,
    jpeg_quality: u8,
}

impl<M: DetectionModel> Clone for PredictionService<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            style: self.style.clone(),
            scratch_dir: self.scratch_dir.clone(),
            jpeg_quality: self.jpeg_quality,
        }
    }
}

impl<M: DetectionModel> PredictionService<M> {
    pub fn new(model: Arc<M>, style: PlotStyle, scratch_dir: PathBuf, jpeg_quality: u8) -> Self {
        Self {
            model,
            style: Arc::new(style),
            scratch_dir,
            jpeg_quality,
        }
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Runs the whole upload-to-response pipeline on the blocking pool.
    #[instrument(skip(self, content), fields(upload_bytes = content.len()))]
    pub async fn predict(&self, content: Vec<u8>) -> Result<PredictionResult, PredictionError> {
        if content.is_empty() {
            return Err(PredictionError::EmptyUpload);
        }

        let service = self.clone();
        tokio::task::spawn_blocking(move || service.predict_blocking(&content)).await?
    }

    fn predict_blocking(&self, content: &[u8]) -> Result<PredictionResult, PredictionError> {
        // Removed when it goes out of scope, whatever the outcome.
        let scratch = save_temp_image(content, &self.scratch_dir)?;
        tracing::debug!("Upload written to {:?}", scratch.path());

        let detections = self.model.predict(scratch.path())?;
        drop(scratch);

        let top = detections.top().ok_or(PredictionError::NoDetection)?;
        let tumor_class = detections.label(top);
        let confidence = top.confidence;

        tracing::info!(
            "Predicted {} with confidence {:.3} ({} detections)",
            tumor_class,
            confidence,
            detections.len()
        );

        let annotated = detections.plot(&self.style);
        let image = encode_image_base64(&annotated, self.jpeg_quality)?;

        Ok(PredictionResult {
            tumor_class,
            confidence,
            image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::testing::{png_bytes, ColorModel, FailingModel};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::GenericImageView;

    fn service<M: DetectionModel>(model: M, dir: &std::path::Path) -> PredictionService<M> {
        PredictionService::new(
            Arc::new(model),
            PlotStyle::default(),
            dir.to_path_buf(),
            95,
        )
    }

    fn scratch_is_empty(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_predict_returns_top_detection() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let service = service(ColorModel::default(), dir.path());

        let result = service.predict(png_bytes(64, 40, [220, 20, 20])).await?;

        assert_eq!(result.tumor_class, "glioma");
        assert!((result.confidence - 0.91).abs() < 1e-6);

        let jpeg = STANDARD.decode(&result.image)?;
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!(decoded.dimensions(), (64, 40));
        assert!(scratch_is_empty(dir.path()));

        Ok(())
    }

    #[tokio::test]
    async fn test_predict_is_repeatable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let service = service(ColorModel::default(), dir.path());
        let upload = png_bytes(32, 32, [20, 220, 20]);

        let first = service.predict(upload.clone()).await?;
        let second = service.predict(upload).await?;

        assert_eq!(first.tumor_class, "meningioma");
        assert_eq!(first.tumor_class, second.tumor_class);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(service.model().calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_no_detection() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(ColorModel::default(), dir.path());

        let err = service
            .predict(png_bytes(16, 16, [10, 10, 10]))
            .await
            .unwrap_err();

        assert!(matches!(err, PredictionError::NoDetection));
        assert!(err.is_client_error());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_invalid_image() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(ColorModel::default(), dir.path());

        let err = service
            .predict(b"this is a text file".to_vec())
            .await
            .unwrap_err();

        assert!(matches!(err, PredictionError::InvalidImage(_)));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_empty_upload_skips_model() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(ColorModel::default(), dir.path());

        let err = service.predict(Vec::new()).await.unwrap_err();

        assert!(matches!(err, PredictionError::EmptyUpload));
        assert_eq!(service.model().calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_failure_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(FailingModel, dir.path());

        let err = service
            .predict(png_bytes(8, 8, [200, 0, 0]))
            .await
            .unwrap_err();

        assert!(matches!(err, PredictionError::Model(ModelError::WeightsNotFound(_))));
        assert!(!err.is_client_error());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_scratch_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(ColorModel::default(), &dir.path().join("missing"));

        let err = service
            .predict(png_bytes(8, 8, [200, 0, 0]))
            .await
            .unwrap_err();

        assert!(matches!(err, PredictionError::Io(_)));
    }
}
