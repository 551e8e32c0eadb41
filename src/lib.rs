mod annotation;
mod image_codec;
mod ort_service;
mod routes;
mod server;

pub mod app;
pub mod config;
pub mod detection;
pub mod labels;
pub mod model_service;
pub mod prediction;

pub use annotation::PlotStyle;
pub use app::start_app;
pub use ort_service::{ModelHandle, OrtModelService};
pub use server::{build_router, HttpServer};
