//! Game catalog, session launch, and provider callback endpoints
//! (spec.md §6's `/games` endpoints, §4.E).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;
use wagerbridge_core::session::{LaunchGameRequest, LaunchGameResponse};
use wagerbridge_core::types::{CallbackResponse, Game, RequestScope};
use wagerbridge_core::{CoreError, Filter, FilterSet, Repository};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn default_page_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct GamesQuery {
    pub category: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

pub async fn list_games(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<GamesQuery>,
) -> ApiResult<Json<Vec<Game>>> {
    state.admission.check_permission(&scope, "games", "read")?;

    let mut filters = FilterSet::new();
    if let Some(category) = query.category {
        filters = filters.push(Filter::IContains("category", category));
    }

    let page = wagerbridge_core::Page {
        offset: query.offset.max(0),
        limit: query.limit.clamp(1, 200),
    };
    let games = state.games.find(&filters, None, page).await?;
    Ok(Json(games.into_iter().filter(|g| g.is_active()).collect()))
}

pub async fn get_game(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Game>> {
    state.admission.check_permission(&scope, "games", "read")?;
    let game = state
        .games
        .find_by_id(id)
        .await?
        .ok_or_else(|| CoreError::not_found("game", id.to_string()))?;
    Ok(Json(game))
}

pub async fn launch_session(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Json(body): Json<LaunchGameRequest>,
) -> ApiResult<Json<LaunchGameResponse>> {
    state.admission.check_permission(&scope, "games", "session")?;
    let response = state.sessions.launch_game(body, scope.partner_id).await?;
    Ok(Json(response))
}

const SIGNATURE_HEADER: &str = "x-provider-signature";

/// The provider callback protocol authenticates with its own HMAC over
/// the raw body (`ProviderCallback`/§6), layered on top of the admission
/// pipeline's ordinary API-key auth for the partner making the call.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<CallbackResponse>> {
    state.admission.check_permission(&scope, "games", "callback")?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing provider signature header".to_string()))?;

    let response = state
        .sessions
        .process_callback(&body, signature, scope.partner_id)
        .await?;
    Ok(Json(response))
}
