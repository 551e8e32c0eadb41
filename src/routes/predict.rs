use crate::{
    model_service::DetectionModel,
    prediction::{PredictionError, PredictionResult},
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("Invalid multipart upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("No `file` field in upload")]
    MissingFile,
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

impl PredictImageError {
    fn status(&self) -> StatusCode {
        match self {
            PredictImageError::Multipart(e) => e.status(),
            PredictImageError::MissingFile => StatusCode::BAD_REQUEST,
            PredictImageError::Prediction(PredictionError::NoDetection) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PredictImageError::Prediction(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            PredictImageError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Prediction failed: {}", self);
        } else {
            tracing::warn!("Prediction rejected: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_image<M: DetectionModel>(
    State(state): State<SharedState<M>>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResult>, PredictImageError> {
    let mut content = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) || field.file_name().is_some() {
            tracing::debug!(
                "Reading upload field {:?} ({:?})",
                field.name(),
                field.file_name()
            );
            content = Some(field.bytes().await?);
            break;
        }
    }

    let content = content.ok_or(PredictImageError::MissingFile)?;
    let result = state.prediction_service.predict(content.to_vec()).await?;

    Ok(Json(result))
}
