mod health;
mod predict;

use crate::{model_service::DetectionModel, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes<M: DetectionModel>() -> Router<SharedState<M>> {
    Router::new()
        .route("/health", get(health::healthcheck::<M>))
        .route("/api/predict", post(predict::predict_image::<M>))
}
