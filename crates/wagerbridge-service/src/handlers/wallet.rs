//! Wallet ledger endpoints (spec.md §6's `/wallet` endpoints, §4.D).
//! Every completed operation is handed to the AML queue for
//! out-of-request analysis (spec.md §5).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use wagerbridge_core::types::{
    RequestScope, RollbackRequest, Transaction, TransactionType, Wallet, WalletOperationRequest,
    WalletOperationResult,
};
use wagerbridge_core::{CoreError, Filter, FilterSet, FilterValue, Repository};

use crate::error::ApiResult;
use crate::handlers::PageQuery;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WalletOpBody {
    pub currency: String,
    pub amount: Decimal,
    pub reference_id: String,
    pub game_id: Option<Uuid>,
    pub game_session_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    pub reference_id: String,
    pub original_reference_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub currency: String,
}

pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<Json<Wallet>> {
    state.admission.check_permission(&scope, "wallet", "read")?;
    let wallet = state
        .wallets_repo
        .find_by_player_partner(player_id, scope.partner_id, &query.currency)
        .await?
        .ok_or_else(|| CoreError::not_found("wallet", player_id.to_string()))?;
    Ok(Json(wallet))
}

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Transaction>>> {
    state.admission.check_permission(&scope, "wallet", "read")?;
    let filters = FilterSet::new()
        .push(Filter::Eq("player_id", FilterValue::Uuid(player_id)))
        .push(Filter::Eq("partner_id", FilterValue::Uuid(scope.partner_id)));
    let transactions = state.transactions_repo.find(&filters, None, query.page()).await?;
    Ok(Json(transactions))
}

async fn dispatch(
    state: &AppState,
    scope: &RequestScope,
    player_id: Uuid,
    body: WalletOpBody,
    transaction_type: TransactionType,
) -> ApiResult<Json<WalletOperationResult>> {
    let req = WalletOperationRequest {
        player_id,
        partner_id: scope.partner_id,
        currency: body.currency,
        amount: body.amount,
        reference_id: body.reference_id,
        transaction_type,
        game_id: body.game_id,
        game_session_id: body.game_session_id,
        metadata: body.metadata,
    };

    let result = if transaction_type.is_credit() {
        state.wallets.credit(req).await?
    } else {
        state.wallets.debit(req).await?
    };

    if let Ok(Some(transaction)) = state
        .transactions_repo
        .find_by_partner_reference(scope.partner_id, &result.reference_id)
        .await
    {
        state.aml_queue.enqueue(transaction);
    }

    Ok(Json(result))
}

pub async fn deposit(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Json(body): Json<WalletOpBody>,
) -> ApiResult<Json<WalletOperationResult>> {
    state.admission.check_permission(&scope, "wallet", "write")?;
    dispatch(&state, &scope, player_id, body, TransactionType::Deposit).await
}

pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Json(body): Json<WalletOpBody>,
) -> ApiResult<Json<WalletOperationResult>> {
    state.admission.check_permission(&scope, "wallet", "write")?;
    dispatch(&state, &scope, player_id, body, TransactionType::Withdrawal).await
}

pub async fn bet(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Json(body): Json<WalletOpBody>,
) -> ApiResult<Json<WalletOperationResult>> {
    state.admission.check_permission(&scope, "wallet", "write")?;
    dispatch(&state, &scope, player_id, body, TransactionType::Bet).await
}

pub async fn win(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Json(body): Json<WalletOpBody>,
) -> ApiResult<Json<WalletOperationResult>> {
    state.admission.check_permission(&scope, "wallet", "write")?;
    dispatch(&state, &scope, player_id, body, TransactionType::Win).await
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(scope): Extension<RequestScope>,
    Path(player_id): Path<Uuid>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<WalletOperationResult>> {
    state.admission.check_permission(&scope, "wallet", "write")?;
    let req = RollbackRequest {
        player_id,
        partner_id: scope.partner_id,
        reference_id: body.reference_id,
        original_reference_id: body.original_reference_id,
    };
    let result = state.wallets.rollback(req).await?;

    if let Ok(Some(transaction)) = state
        .transactions_repo
        .find_by_partner_reference(scope.partner_id, &result.reference_id)
        .await
    {
        state.aml_queue.enqueue(transaction);
    }

    Ok(Json(result))
}
