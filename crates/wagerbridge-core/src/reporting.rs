//! Reporting scheduler (spec.md §4.G): accepts report requests, persists
//! them as `pending` jobs, and hands them to a worker pool that claims
//! jobs via the cache layer's distributed lock so replicas never
//! double-process the same job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::CacheLayer;
use crate::error::{CoreError, CoreResult};
use crate::types::{ReportFormat, ReportJob, ReportJobStatus};

const LOCK_TTL: Duration = Duration::from_secs(120);

/// Declared parameter schema for each supported report kind (spec.md §4.G:
/// "validate parameters against the requested report type's declared
/// schema"). Only presence/type of required fields is checked — the
/// renderer is the one that interprets them.
struct ReportParamSchema {
    required_strings: &'static [&'static str],
}

fn schema_for_report_kind(report_kind: &str) -> Option<ReportParamSchema> {
    match report_kind {
        "transactions" => Some(ReportParamSchema {
            required_strings: &["start_date", "end_date"],
        }),
        "game_performance" => Some(ReportParamSchema {
            required_strings: &["start_date", "end_date"],
        }),
        "daily_summary" => Some(ReportParamSchema {
            required_strings: &["date", "currency"],
        }),
        "monthly_summary" => Some(ReportParamSchema {
            required_strings: &["year", "month"],
        }),
        "player_activity" => Some(ReportParamSchema {
            required_strings: &["player_id"],
        }),
        _ => None,
    }
}

fn validate_report_parameters(report_kind: &str, parameters: &Value) -> CoreResult<()> {
    let schema = schema_for_report_kind(report_kind)
        .ok_or_else(|| CoreError::Validation(format!("unknown report kind: {report_kind}")))?;
    let fields = parameters
        .as_object()
        .ok_or_else(|| CoreError::Validation("report parameters must be a JSON object".to_string()))?;
    for field in schema.required_strings {
        if !fields.contains_key(*field) {
            return Err(CoreError::Validation(format!(
                "report kind {report_kind} requires parameter \"{field}\""
            )));
        }
    }
    Ok(())
}

/// Renders a scheduled report's bytes and writes them to durable storage.
/// An external collaborator per spec.md's non-goals (CSV/PDF/Excel
/// rendering and settlement computation are out of scope); this trait is
/// the seam the scheduler dispatches across.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, job: &ReportJob) -> CoreResult<RenderedReport>;
}

pub struct RenderedReport {
    pub file_path: String,
    pub file_size: i64,
}

pub struct ReportingScheduler {
    pool: PgPool,
    cache: Arc<CacheLayer>,
    renderer: Arc<dyn ReportRenderer>,
    sender: mpsc::Sender<Uuid>,
}

impl ReportingScheduler {
    /// `queue_capacity` bounds the in-process queue; `enqueue` returns
    /// `SERVICE_UNAVAILABLE` once it is full rather than blocking callers.
    pub fn new(
        pool: PgPool,
        cache: Arc<CacheLayer>,
        renderer: Arc<dyn ReportRenderer>,
        worker_pool_size: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let scheduler = Self {
            pool,
            cache,
            renderer,
            sender,
        };
        scheduler.spawn_workers(receiver, worker_pool_size);
        scheduler
    }

    fn spawn_workers(&self, receiver: mpsc::Receiver<Uuid>, worker_pool_size: usize) {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for worker_id in 0..worker_pool_size {
            let pool = self.pool.clone();
            let cache = Arc::clone(&self.cache);
            let renderer = Arc::clone(&self.renderer);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job_id = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(job_id) = job_id else {
                        break;
                    };
                    process_job(&pool, &cache, renderer.as_ref(), job_id, worker_id).await;
                }
            });
        }
    }

    pub async fn schedule(
        &self,
        partner_id: Uuid,
        report_kind: String,
        format: ReportFormat,
        parameters: Value,
        requested_by: String,
    ) -> CoreResult<ReportJob> {
        validate_report_parameters(&report_kind, &parameters)?;

        let job = ReportJob {
            id: Uuid::new_v4(),
            partner_id,
            report_kind,
            format,
            parameters,
            status: ReportJobStatus::Pending,
            file_path: None,
            file_size: None,
            error_message: None,
            requested_by,
            created_at: Utc::now(),
            completed_at: None,
        };

        sqlx::query(
            "INSERT INTO report_jobs
             (id, partner_id, report_kind, format, parameters, status, requested_by, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(job.id)
        .bind(job.partner_id)
        .bind(&job.report_kind)
        .bind(job.format)
        .bind(&job.parameters)
        .bind(job.status)
        .bind(&job.requested_by)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        self.sender.try_send(job.id).map_err(|_| {
            CoreError::Upstream("report queue is full, retry later".to_string())
        })?;

        Ok(job)
    }

    pub async fn find_job(&self, id: Uuid) -> CoreResult<Option<ReportJob>> {
        let row = sqlx::query_as::<_, ReportJobRow>(
            "SELECT id, partner_id, report_kind, format, parameters, status, file_path, file_size,
                    error_message, requested_by, created_at, completed_at
             FROM report_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}

async fn process_job(pool: &PgPool, cache: &CacheLayer, renderer: &dyn ReportRenderer, job_id: Uuid, worker_id: usize) {
    let lock_name = format!("report:{job_id}");
    let token = match cache.lock(&lock_name, LOCK_TTL).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            info!(job_id = %job_id, worker_id, "report job claimed by another replica");
            return;
        }
        Err(err) => {
            warn!(error = %err, job_id = %job_id, "failed to acquire report job lock");
            return;
        }
    };

    let outcome = run_job(pool, renderer, job_id).await;

    if let Err(err) = cache.unlock(&lock_name, &token).await {
        warn!(error = %err, job_id = %job_id, "failed to release report job lock");
    }

    if let Err(err) = outcome {
        error!(error = %err, job_id = %job_id, worker_id, "report job failed");
    }
}

async fn run_job(pool: &PgPool, renderer: &dyn ReportRenderer, job_id: Uuid) -> CoreResult<()> {
    let claimed = sqlx::query(
        "UPDATE report_jobs SET status = 'processing' WHERE id = $1 AND status = 'pending'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    if claimed.rows_affected() == 0 {
        return Ok(());
    }

    let row = sqlx::query_as::<_, ReportJobRow>(
        "SELECT id, partner_id, report_kind, format, parameters, status, file_path, file_size,
                error_message, requested_by, created_at, completed_at
         FROM report_jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;
    let job: ReportJob = row.into();

    match renderer.render(&job).await {
        Ok(rendered) => {
            sqlx::query(
                "UPDATE report_jobs SET status = 'completed', file_path = $1, file_size = $2, completed_at = now()
                 WHERE id = $3",
            )
            .bind(&rendered.file_path)
            .bind(rendered.file_size)
            .bind(job_id)
            .execute(pool)
            .await?;
        }
        Err(err) => {
            sqlx::query(
                "UPDATE report_jobs SET status = 'failed', error_message = $1, completed_at = now() WHERE id = $2",
            )
            .bind(err.to_string())
            .bind(job_id)
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct ReportJobRow {
    id: Uuid,
    partner_id: Uuid,
    report_kind: String,
    format: ReportFormat,
    parameters: Value,
    status: ReportJobStatus,
    file_path: Option<String>,
    file_size: Option<i64>,
    error_message: Option<String>,
    requested_by: String,
    created_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<ReportJobRow> for ReportJob {
    fn from(row: ReportJobRow) -> Self {
        ReportJob {
            id: row.id,
            partner_id: row.partner_id,
            report_kind: row.report_kind,
            format: row.format,
            parameters: row.parameters,
            status: row.status,
            file_path: row.file_path,
            file_size: row.file_size,
            error_message: row.error_message,
            requested_by: row.requested_by,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRenderer;

    #[async_trait]
    impl ReportRenderer for StubRenderer {
        async fn render(&self, job: &ReportJob) -> CoreResult<RenderedReport> {
            Ok(RenderedReport {
                file_path: format!("/tmp/{}.csv", job.id),
                file_size: 0,
            })
        }
    }

    #[tokio::test]
    async fn renderer_stub_produces_a_path() {
        let job = ReportJob {
            id: Uuid::new_v4(),
            partner_id: Uuid::new_v4(),
            report_kind: "daily_summary".to_string(),
            format: ReportFormat::Csv,
            parameters: Value::Null,
            status: ReportJobStatus::Pending,
            file_path: None,
            file_size: None,
            error_message: None,
            requested_by: "test".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };
        let rendered = StubRenderer.render(&job).await.unwrap();
        assert!(rendered.file_path.contains(&job.id.to_string()));
    }

    #[test]
    fn validate_report_parameters_rejects_missing_required_field() {
        let err = validate_report_parameters("daily_summary", &serde_json::json!({ "date": "2026-07-01" }))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn validate_report_parameters_accepts_complete_payload() {
        assert!(validate_report_parameters(
            "daily_summary",
            &serde_json::json!({ "date": "2026-07-01", "currency": "USD" }),
        )
        .is_ok());
    }

    #[test]
    fn validate_report_parameters_rejects_unknown_report_kind() {
        let err = validate_report_parameters("settlement", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
