use crate::{model_service::DetectionModel, server::SharedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub model_loaded: bool,
}

pub async fn healthcheck<M: DetectionModel>(
    State(state): State<SharedState<M>>,
) -> impl IntoResponse {
    Json(Health {
        status: "Available".into(),
        model_loaded: state.prediction_service.model().is_loaded(),
    })
}
