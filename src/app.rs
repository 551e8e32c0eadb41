use crate::{
    annotation::PlotStyle, config::Config, ort_service::ModelHandle,
    prediction::PredictionService, server::HttpServer,
};
use anyhow::Context;
use std::sync::Arc;

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let model = Arc::new(ModelHandle::new(config.model.clone()));

    if config.model.preload {
        let handle = model.clone();
        tokio::task::spawn_blocking(move || handle.ensure_loaded().map(|_| ()))
            .await?
            .context("failed to preload detection model")?;
    } else {
        tracing::info!(
            "Detection model {:?} will be loaded on first request",
            config.model.get_path()
        );
    }

    let scratch_dir = config.scratch.get_dir();
    std::fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("failed to create scratch dir {:?}", scratch_dir))?;

    let prediction_service = PredictionService::new(
        model,
        PlotStyle::from_config(&config.annotation),
        scratch_dir,
        config.annotation.jpeg_quality,
    );

    let server = HttpServer::new(prediction_service, &config.server)
        .await
        .with_context(|| format!("failed to bind {}", config.server.get_address()))?;

    server.run().await
}
