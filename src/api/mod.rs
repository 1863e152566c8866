pub mod handlers;

use crate::service::{IngestionGateway, ReviewService};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;

pub use handlers::*;

/// 共享状态: 上传入口 + 审核服务
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub review: Arc<ReviewService>,
    pub max_upload_bytes: usize,
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;

    let invoices = Router::new()
        .route("/invoices", post(upload).get(list_invoices))
        .route("/invoices/queue", get(processing_queue))
        .route("/invoices/awaiting", get(awaiting_review))
        .route("/invoices/download", get(download))
        .route("/invoices/:id", get(invoice_detail).delete(delete_invoice))
        .route("/invoices/:id/approve", post(approve))
        .route("/invoices/:id/reprocess", post(reprocess))
        .route("/invoices/:id/complete", post(complete))
        .route("/invoices/:id/file", get(original_file));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", invoices)
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(max_upload_bytes)))
        .with_state(state)
}
