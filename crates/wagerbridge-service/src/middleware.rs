//! Admission-pipeline wiring (spec.md §4.C, stages 1-3) as axum
//! middleware. Stage 4 (permission check) runs inside each handler, since
//! only the handler knows which `resource:action` pair it needs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use wagerbridge_core::admission::RateLimitDecision;
use wagerbridge_core::types::AuditLog;

use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

/// Stamps `X-RateLimit-{Limit,Remaining,Reset}` on every admission-gated
/// response (spec.md §4.C).
fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(
        "x-ratelimit-limit",
        decision.limit.to_string().parse().expect("digits are valid header values"),
    );
    headers.insert(
        "x-ratelimit-remaining",
        decision.remaining.to_string().parse().expect("digits are valid header values"),
    );
    headers.insert(
        "x-ratelimit-reset",
        decision.reset_secs.to_string().parse().expect("digits are valid header values"),
    );
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Runs admission stages 1-3 and inserts the resulting [`RequestScope`]
/// into the request's extensions for handlers to read. Requests to
/// `AdmissionConfig::exempt_paths` skip all three stages.
pub async fn admission(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let path = request.uri().path().to_string();
    let method = request.method().to_string();

    if state.admission.is_exempt(&path) {
        return Ok(next.run(request).await);
    }

    let ip = client_ip(request.headers(), peer);

    let raw_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Core(wagerbridge_core::CoreError::Authentication(
            "missing x-api-key header".to_string(),
        )))?
        .to_string();

    let scope = state.admission.authenticate(&raw_key, &ip).await?;
    state.admission.check_ip_whitelist(scope.partner_id, &ip).await?;
    let decision = state.admission.check_rate_limit(scope.partner_id, &path).await?;
    if let Some(retry_after_secs) = decision.retry_after_secs {
        let mut response =
            ApiError::Core(wagerbridge_core::CoreError::RateLimited { retry_after_secs }).into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision);
        response.headers_mut().insert(
            "retry-after",
            retry_after_secs.to_string().parse().expect("digits are valid header values"),
        );
        return Ok(response);
    }

    let partner_id = scope.partner_id;
    let api_key_id = scope.api_key_id;
    request.extensions_mut().insert(scope);

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);

    let entry = AuditLog {
        request_id: uuid::Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        partner_id: Some(partner_id),
        api_key_id: Some(api_key_id),
        ip,
        method,
        path,
        status_code: response.status().as_u16(),
        latency_ms: start.elapsed().as_millis() as u64,
        request_body: None,
        response_body: None,
    };
    state.audit.record(entry);

    Ok(response)
}
