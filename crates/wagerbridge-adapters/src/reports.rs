//! Filesystem-backed report storage. Rendering itself — producing actual
//! CSV/PDF/Excel bytes — is an external collaborator outside this
//! platform's scope; [`FilesystemReportRenderer`] wraps a pluggable
//! byte-producing closure-like trait and only owns writing the result to
//! `storage_path` and stamping the file size.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use wagerbridge_core::error::{CoreError, CoreResult};
use wagerbridge_core::reporting::{RenderedReport, ReportRenderer};
use wagerbridge_core::types::ReportJob;

#[async_trait]
pub trait ReportBodyRenderer: Send + Sync {
    async fn render_body(&self, job: &ReportJob) -> CoreResult<Vec<u8>>;
}

pub struct FilesystemReportRenderer {
    storage_path: PathBuf,
    body_renderer: Box<dyn ReportBodyRenderer>,
}

impl FilesystemReportRenderer {
    pub fn new(storage_path: impl Into<PathBuf>, body_renderer: Box<dyn ReportBodyRenderer>) -> Self {
        Self {
            storage_path: storage_path.into(),
            body_renderer,
        }
    }
}

#[async_trait]
impl ReportRenderer for FilesystemReportRenderer {
    async fn render(&self, job: &ReportJob) -> CoreResult<RenderedReport> {
        let bytes = self.body_renderer.render_body(job).await?;

        fs::create_dir_all(&self.storage_path)
            .await
            .map_err(|err| CoreError::Internal(err.to_string()))?;

        let file_path = self
            .storage_path
            .join(format!("{}.{}", job.id, job.format.extension()));
        fs::write(&file_path, &bytes)
            .await
            .map_err(|err| CoreError::Internal(err.to_string()))?;

        Ok(RenderedReport {
            file_path: file_path.to_string_lossy().to_string(),
            file_size: bytes.len() as i64,
        })
    }
}

/// Placeholder body renderer emitting a minimal CSV header so the
/// scheduler's write/transition machinery is exercisable without a real
/// rendering backend wired in yet.
pub struct StubCsvBodyRenderer;

#[async_trait]
impl ReportBodyRenderer for StubCsvBodyRenderer {
    async fn render_body(&self, job: &ReportJob) -> CoreResult<Vec<u8>> {
        Ok(format!("report_kind,partner_id\n{},{}\n", job.report_kind, job.partner_id).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use wagerbridge_core::types::{ReportFormat, ReportJobStatus};

    #[tokio::test]
    async fn renders_and_writes_to_a_temp_directory() {
        let dir = std::env::temp_dir().join(format!("wagerbridge-test-{}", Uuid::new_v4()));
        let renderer = FilesystemReportRenderer::new(dir.clone(), Box::new(StubCsvBodyRenderer));
        let job = ReportJob {
            id: Uuid::new_v4(),
            partner_id: Uuid::new_v4(),
            report_kind: "daily_summary".to_string(),
            format: ReportFormat::Csv,
            parameters: serde_json::Value::Null,
            status: ReportJobStatus::Processing,
            file_path: None,
            file_size: None,
            error_message: None,
            requested_by: "test".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };
        let rendered = renderer.render(&job).await.unwrap();
        assert!(rendered.file_size > 0);
        assert!(rendered.file_path.ends_with(".csv"));
        let contents = fs::read_to_string(&rendered.file_path).await.unwrap();
        assert!(contents.contains("daily_summary"));
        fs::remove_dir_all(&dir).await.ok();
    }
}
