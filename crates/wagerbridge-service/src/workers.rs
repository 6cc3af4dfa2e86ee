//! Background task queues that keep the request path decoupled from
//! work that does not need to complete before a response is sent
//! (Design note: "HTTP-response-tied background tasks → explicit task
//! queue"). Both follow the same bounded-`mpsc` + worker-pool shape as
//! `wagerbridge_core::reporting::ReportingScheduler`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};
use wagerbridge_core::admission::redact_sensitive_fields;
use wagerbridge_core::aml::AmlPipeline;
use wagerbridge_core::types::{AuditLog, Transaction};
use wagerbridge_core::CoreResult;

/// Dispatches completed wallet transactions to the AML pipeline outside
/// the request/response cycle (spec.md §5: AML analysis runs after, but
/// not atomically with, the wallet commit).
pub struct AmlQueue {
    sender: mpsc::Sender<Transaction>,
}

impl AmlQueue {
    pub fn new(pipeline: Arc<AmlPipeline>, worker_pool_size: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        spawn_workers(pipeline, receiver, worker_pool_size);
        Self { sender }
    }

    /// Best-effort enqueue: a full queue drops the analysis rather than
    /// blocking the caller's wallet operation response.
    pub fn enqueue(&self, transaction: Transaction) {
        if let Err(err) = self.sender.try_send(transaction) {
            warn!(error = %err, "AML analysis queue full, dropping transaction from this cycle");
        }
    }
}

fn spawn_workers(pipeline: Arc<AmlPipeline>, receiver: mpsc::Receiver<Transaction>, worker_pool_size: usize) {
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    for worker_id in 0..worker_pool_size {
        let pipeline = Arc::clone(&pipeline);
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move {
            loop {
                let transaction = {
                    let mut guard = receiver.lock().await;
                    guard.recv().await
                };
                let Some(transaction) = transaction else {
                    break;
                };
                if let Err(err) = pipeline.analyze(&transaction).await {
                    error!(error = %err, worker_id, transaction_id = %transaction.id, "AML analysis failed");
                }
            }
        });
    }
}

/// Persists redacted request/response audit entries off the request path.
pub struct AuditLogWriter {
    sender: mpsc::Sender<AuditLog>,
}

impl AuditLogWriter {
    pub fn new(pool: sqlx::PgPool, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        spawn_audit_worker(pool, receiver);
        Self { sender }
    }

    pub fn record(&self, mut entry: AuditLog) {
        entry.request_body = entry.request_body.as_ref().map(redact_sensitive_fields);
        entry.response_body = entry.response_body.as_ref().map(redact_sensitive_fields);
        if let Err(err) = self.sender.try_send(entry) {
            warn!(error = %err, "audit log queue full, dropping entry");
        }
    }
}

fn spawn_audit_worker(pool: sqlx::PgPool, mut receiver: mpsc::Receiver<AuditLog>) {
    tokio::spawn(async move {
        while let Some(entry) = receiver.recv().await {
            if let Err(err) = insert_audit_log(&pool, &entry).await {
                error!(error = %err, request_id = %entry.request_id, "failed to persist audit log entry");
            }
        }
    });
}

async fn insert_audit_log(pool: &sqlx::PgPool, entry: &AuditLog) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO audit_logs
         (request_id, timestamp, partner_id, api_key_id, ip, method, path, status_code,
          latency_ms, request_body, response_body)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(entry.request_id)
    .bind(entry.timestamp)
    .bind(entry.partner_id)
    .bind(entry.api_key_id)
    .bind(&entry.ip)
    .bind(&entry.method)
    .bind(&entry.path)
    .bind(entry.status_code as i32)
    .bind(entry.latency_ms as i64)
    .bind(&entry.request_body)
    .bind(&entry.response_body)
    .execute(pool)
    .await?;
    Ok(())
}
