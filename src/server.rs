use crate::{
    config::ServerConfig, model_service::DetectionModel, prediction::PredictionService,
    routes::api_routes,
};
use axum::{extract::DefaultBodyLimit, Router};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct SharedState<M: DetectionModel> {
    pub prediction_service: PredictionService<M>,
}

impl<M: DetectionModel> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            prediction_service: self.prediction_service.clone(),
        }
    }
}

pub fn build_router<M: DetectionModel>(
    prediction_service: PredictionService<M>,
    max_upload_bytes: usize,
) -> Router {
    let app_state = SharedState { prediction_service };

    Router::new()
        .merge(api_routes::<M>())
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: DetectionModel>(
        prediction_service: PredictionService<M>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let router = build_router(prediction_service, config.max_upload_bytes);
        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown");
            })
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
