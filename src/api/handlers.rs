use super::AppState;
use crate::db::InvoiceFilter;
use crate::error::PipelineError;
use crate::models::{Invoice, InvoiceStatus};
use crate::service::{ApprovalRequest, InvoiceDetail, UploadReceipt};
use axum::{
    extract::{rejection::JsonRejection, Json, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_name: Option<String>,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::DuplicateInvoice { .. } => StatusCode::CONFLICT,
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidState { .. } | PipelineError::TierExhausted(_) => StatusCode::CONFLICT,
            PipelineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Extraction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let (existing_id, existing_name) = match &self {
            PipelineError::DuplicateInvoice {
                existing_id,
                existing_name,
            } => (Some(*existing_id), Some(existing_name.clone())),
            _ => (None, None),
        };
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            existing_id,
            existing_name,
        };
        (status, Json(body)).into_response()
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, PipelineError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| PipelineError::Validation(e.body_text()))
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 上传发票 (multipart 字段 "file")
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReceipt>), PipelineError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Validation(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| PipelineError::Validation(e.body_text()))?;
        let receipt = state.gateway.ingest(&filename, &data).await?;
        return Ok((StatusCode::CREATED, Json(receipt)));
    }
    Err(PipelineError::Validation("multipart field 'file' is required".to_string()))
}

/// 列表查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub search: Option<String>,
    pub invoice_date_from: Option<String>,
    pub invoice_date_to: Option<String>,
    pub upload_date_from: Option<String>,
    pub upload_date_to: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date(name: &str, value: &Option<String>) -> Result<Option<NaiveDate>, PipelineError> {
    non_empty(value)
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|_| PipelineError::Validation(format!("{} must be YYYY-MM-DD, got '{}'", name, v)))
        })
        .transpose()
}

impl ListQuery {
    pub fn to_filter(&self) -> Result<InvoiceFilter, PipelineError> {
        let mut statuses: IndexSet<InvoiceStatus> = IndexSet::new();
        if let Some(raw) = non_empty(&self.status) {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                statuses.insert(part.parse().map_err(PipelineError::Validation)?);
            }
        }

        Ok(InvoiceFilter {
            statuses: statuses.into_iter().collect(),
            search: non_empty(&self.search).map(str::to_string),
            invoice_date_from: parse_date("invoice_date_from", &self.invoice_date_from)?,
            invoice_date_to: parse_date("invoice_date_to", &self.invoice_date_to)?,
            upload_date_from: parse_date("upload_date_from", &self.upload_date_from)?,
            upload_date_to: parse_date("upload_date_to", &self.upload_date_to)?,
        })
    }
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Invoice>>, PipelineError> {
    let filter = query.to_filter()?;
    Ok(Json(state.review.list(&filter).await?))
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub invoices: Vec<Invoice>,
}

#[derive(Debug, Serialize)]
pub struct AwaitingResponse {
    pub invoices: Vec<Invoice>,
    pub count: usize,
}

/// 处理队列
pub async fn processing_queue(State(state): State<AppState>) -> Result<Json<QueueResponse>, PipelineError> {
    let invoices = state.review.processing().await?;
    Ok(Json(QueueResponse { invoices }))
}

/// 审核队列
pub async fn awaiting_review(State(state): State<AppState>) -> Result<Json<AwaitingResponse>, PipelineError> {
    let invoices = state.review.awaiting().await?;
    let count = invoices.len();
    Ok(Json(AwaitingResponse { invoices, count }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub ids: Option<String>,
}

fn parse_ids(raw: &str) -> Result<Vec<i64>, PipelineError> {
    let mut ids: IndexSet<i64> = IndexSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part
            .parse()
            .map_err(|_| PipelineError::Validation(format!("invalid invoice id '{}'", part)))?;
        ids.insert(id);
    }
    Ok(ids.into_iter().collect())
}

/// CSV 导出
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, PipelineError> {
    let raw = non_empty(&query.ids)
        .ok_or_else(|| PipelineError::Validation("ids parameter is required".to_string()))?;
    let export = state.review.export_csv(&parse_ids(raw)?).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.filename),
            ),
        ],
        export.content,
    )
        .into_response())
}

pub async fn invoice_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InvoiceDetail>, PipelineError> {
    Ok(Json(state.review.detail(id).await?))
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub approved: bool,
    #[serde(rename = "nextId")]
    pub next_id: Option<i64>,
}

/// 审核通过
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ApprovalRequest>, JsonRejection>,
) -> Result<Json<ApproveResponse>, PipelineError> {
    let request = json_body(payload)?;
    let next_id = state.review.approve(id, request).await?;
    Ok(Json(ApproveResponse {
        approved: true,
        next_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReprocessRequest {
    pub tier: u8,
}

/// 人工指定层级重新处理
pub async fn reprocess(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ReprocessRequest>, JsonRejection>,
) -> Result<StatusCode, PipelineError> {
    let request = json_body(payload)?;
    state.review.reprocess(id, request.tier).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn complete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, PipelineError> {
    state.review.complete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, PipelineError> {
    state.review.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 原始文件
pub async fn original_file(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Response, PipelineError> {
    let file = state.review.original_file(id).await?;
    let mime = mime_guess::from_path(&file.filename).first_or_octet_stream();

    Ok((
        [
            (header::CONTENT_TYPE, mime.essence_str().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", file.filename.replace('"', "")),
            ),
        ],
        file.data,
    )
        .into_response())
}
