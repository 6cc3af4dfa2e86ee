//! Partner-facing key and IP-whitelist management (spec.md §6's `/auth`
//! endpoints). Every handler here operates only on the caller's own
//! `partner_id`, taken from the admission-produced [`RequestScope`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wagerbridge_core::types::{PartnerIp, RequestScope};
use wagerbridge_core::{CoreError, Repository};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    /// The full `<prefix>.<secret>` credential, returned exactly once.
    pub api_key: String,
    pub key_prefix: String,
    pub permissions: Vec<String>,
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Json(body): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<CreateApiKeyResponse>> {
    state.admission.check_permission(&scope, "admin", "manage_keys")?;

    let (api_key, secret) = state
        .api_keys
        .create(scope.partner_id, &body.name, &body.permissions, body.expires_at)
        .await?;

    Ok(Json(CreateApiKeyResponse {
        id: api_key.id,
        api_key: secret.0,
        key_prefix: api_key.key_prefix,
        permissions: api_key.permissions,
    }))
}

pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.admission.check_permission(&scope, "admin", "manage_keys")?;

    let existing = state
        .api_keys
        .find_by_id(id)
        .await?
        .ok_or_else(|| CoreError::not_found("api_key", id.to_string()))?;
    if existing.partner_id != scope.partner_id {
        return Err(CoreError::Authorization("api key belongs to a different partner".to_string()).into());
    }

    state.api_keys.deactivate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddIpWhitelistRequest {
    pub cidr: String,
}

pub async fn add_ip_whitelist(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Json(body): Json<AddIpWhitelistRequest>,
) -> ApiResult<Json<PartnerIp>> {
    state.admission.check_permission(&scope, "admin", "manage_ips")?;
    let entry = state.api_keys.insert_allowed_ip(scope.partner_id, &body.cidr).await?;
    Ok(Json(entry))
}
