//! Report scheduling endpoints (spec.md §6's `/reports` endpoints, §4.G).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;
use wagerbridge_core::types::{ReportFormat, ReportJob, RequestScope};
use wagerbridge_core::CoreError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ScheduleReportRequest {
    pub report_kind: String,
    pub format: ReportFormat,
    #[serde(default)]
    pub parameters: Value,
}

pub async fn schedule(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Json(body): Json<ScheduleReportRequest>,
) -> ApiResult<Json<ReportJob>> {
    state.admission.check_permission(&scope, "reports", "create")?;
    let job = state
        .reports
        .schedule(
            scope.partner_id,
            body.report_kind,
            body.format,
            body.parameters,
            scope.api_key_id.to_string(),
        )
        .await?;
    Ok(Json(job))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.admission.check_permission(&scope, "reports", "read")?;

    let job = state
        .reports
        .find_job(id)
        .await?
        .ok_or_else(|| CoreError::not_found("report_job", id.to_string()))?;
    if job.partner_id != scope.partner_id {
        return Err(CoreError::Authorization("report belongs to a different partner".to_string()).into());
    }
    let file_path = job
        .file_path
        .clone()
        .ok_or_else(|| ApiError::BadRequest("report is not completed yet".to_string()))?;

    let bytes = fs::read(&file_path)
        .await
        .map_err(|err| ApiError::Core(CoreError::Internal(err.to_string())))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        job.format.mime_type().parse().expect("mime type is a valid header value"),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        format!(
            "attachment; filename=\"{}-{}.{}\"",
            job.report_kind,
            job.id,
            job.format.extension()
        )
        .parse()
        .expect("filename is a valid header value"),
    );

    Ok((headers, bytes))
}
