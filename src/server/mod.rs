mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use log::info;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::error::AppError;
pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::predict_handler,
        api::feedback_handler,
        api::train_handler,
        api::domains_handler,
        api::health_handler,
        api::metrics_handler,
    ),
    components(schemas(
        types::PredictForm,
        types::PredictResponse,
        types::FeedbackRequest,
        types::FeedbackResponse,
        types::TrainResponse,
        types::DomainInfo,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/predict", post(api::predict_handler))
        .route("/feedback", post(api::feedback_handler))
        .route("/train", post(api::train_handler))
        .route("/domains", get(api::domains_handler))
        .route("/health", get(api::health_handler))
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}

/// 定期重新提交因训练繁忙而被推迟的领域
pub fn spawn_sweeper(state: Arc<AppState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Some(handle) = state.engine.trainer.sweep() {
                info!("巡检：补训领域 `{}`", handle.domain());
            }
        }
    })
}
