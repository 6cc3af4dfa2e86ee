//! Game session & callback engine (spec.md §4.E).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::CacheLayer;
use crate::error::{CoreError, CoreResult};
use crate::repository::GameSessionRepository;
use crate::security;
use crate::types::{
    CallbackAction, CallbackResponse, Game, GameProvider, GameSession, GameSessionData,
    GameSessionStatus, GameTransaction, IntegrationType, ProviderCallback, RollbackRequest,
    TransactionStatus, TransactionType, WalletOperationRequest,
};
use crate::wallet::WalletEngine;

const NONCE_TTL: Duration = Duration::from_secs(600);
const CALLBACK_TIMESTAMP_SKEW_SECS: i64 = 300;
const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchGameRequest {
    pub player_id: Uuid,
    pub game_id: Uuid,
    pub currency: String,
    pub language: String,
    pub return_url: Option<String>,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchGameResponse {
    pub launch_url: String,
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

/// Resolves games/providers without depending on any one concrete
/// repository shape; the service crate supplies the Postgres-backed impl.
#[async_trait::async_trait]
pub trait GameCatalog: Send + Sync {
    async fn find_game(&self, game_id: Uuid) -> CoreResult<Option<Game>>;
    async fn find_provider(&self, provider_id: Uuid) -> CoreResult<Option<GameProvider>>;
    async fn find_partner_shared_secret(&self, partner_id: Uuid) -> CoreResult<String>;
}

/// Builds the provider-facing launch URL for the `aggregator` integration
/// type over HTTP; kept as a trait so the core crate stays transport-free.
#[async_trait::async_trait]
pub trait AggregatorLauncher: Send + Sync {
    async fn request_launch_url(
        &self,
        endpoint: &str,
        fields: &std::collections::BTreeMap<String, String>,
    ) -> CoreResult<String>;
}

pub struct GameSessionEngine {
    pool: PgPool,
    sessions: Arc<GameSessionRepository>,
    catalog: Arc<dyn GameCatalog>,
    aggregator: Arc<dyn AggregatorLauncher>,
    wallets: Arc<WalletEngine>,
    cache: Arc<CacheLayer>,
    iframe_host: String,
}

impl GameSessionEngine {
    pub fn new(
        pool: PgPool,
        sessions: Arc<GameSessionRepository>,
        catalog: Arc<dyn GameCatalog>,
        aggregator: Arc<dyn AggregatorLauncher>,
        wallets: Arc<WalletEngine>,
        cache: Arc<CacheLayer>,
        iframe_host: String,
    ) -> Self {
        Self {
            pool,
            sessions,
            catalog,
            aggregator,
            wallets,
            cache,
            iframe_host,
        }
    }

    pub async fn launch_game(&self, req: LaunchGameRequest, partner_id: Uuid) -> CoreResult<LaunchGameResponse> {
        let game = self
            .catalog
            .find_game(req.game_id)
            .await?
            .ok_or_else(|| CoreError::not_found("game", req.game_id.to_string()))?;
        if !game.is_active() {
            return Err(CoreError::Validation("game is not active".to_string()));
        }

        let provider = self
            .catalog
            .find_provider(game.provider_id)
            .await?
            .ok_or_else(|| CoreError::not_found("game_provider", game.provider_id.to_string()))?;
        if !provider.is_active() {
            return Err(CoreError::Validation("game provider is not active".to_string()));
        }

        self.wallets
            .ensure_wallet_exists(req.player_id, partner_id, &req.currency)
            .await?;

        // spec.md §4.B: lock the player row (here, the player's wallet row,
        // since this schema has no standalone player table) before reading
        // the active session, so two concurrent launches for the same
        // player/game serialize instead of racing on the insert below.
        let mut tx = self
            .wallets
            .begin_locked_on_player(req.player_id, partner_id, &req.currency)
            .await?;

        if let Some(existing) = self
            .sessions
            .get_active_session_for_player_game_locked(&mut tx, req.player_id, req.game_id)
            .await?
        {
            tx.commit().await?;
            let launch_url = self.resolve_launch_url(&provider, &game, &req, &existing.token).await?;
            return Ok(LaunchGameResponse {
                launch_url,
                token: existing.token,
                expires_at: existing.expires_at,
            });
        }

        let token = security::generate_session_token();
        let now = Utc::now();
        let session = GameSession {
            id: Uuid::new_v4(),
            token: token.clone(),
            player_id: req.player_id,
            partner_id,
            game_id: req.game_id,
            status: GameSessionStatus::Active,
            session_data: GameSessionData {
                currency: req.currency.clone(),
                language: req.language.clone(),
                return_url: req.return_url.clone(),
            },
            started_at: now,
            ended_at: None,
            expires_at: now + ChronoDuration::hours(SESSION_TTL_HOURS),
        };

        match self.sessions.insert_tx(&mut tx, &session).await {
            Ok(()) => {
                tx.commit().await?;
                let launch_url = self.resolve_launch_url(&provider, &game, &req, &token).await?;
                Ok(LaunchGameResponse {
                    launch_url,
                    token,
                    expires_at: session.expires_at,
                })
            }
            // Unique-index race: kept as a documented secondary guard even
            // though the row lock above should already serialize launches
            // for the same (player, game).
            Err(CoreError::Database(sqlx::Error::Database(db_err)))
                if db_err.code().as_deref() == Some("23505") =>
            {
                let winner = self
                    .sessions
                    .get_active_session_for_player_game(req.player_id, req.game_id)
                    .await?
                    .ok_or_else(|| CoreError::Internal("session race with no winning row".to_string()))?;
                let launch_url = self.resolve_launch_url(&provider, &game, &req, &winner.token).await?;
                Ok(LaunchGameResponse {
                    launch_url,
                    token: winner.token,
                    expires_at: winner.expires_at,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Dispatches to the synchronous `direct`/`iframe` builder or the
    /// async aggregator call, keyed off the provider's integration type.
    async fn resolve_launch_url(
        &self,
        provider: &GameProvider,
        game: &Game,
        req: &LaunchGameRequest,
        token: &str,
    ) -> CoreResult<String> {
        match provider.integration_type {
            IntegrationType::Aggregator => self.launch_via_aggregator(provider, game, req, token).await,
            IntegrationType::Direct | IntegrationType::Iframe => self.build_launch_url(provider, game, req, token),
        }
    }

    fn build_launch_url(
        &self,
        provider: &GameProvider,
        game: &Game,
        req: &LaunchGameRequest,
        token: &str,
    ) -> CoreResult<String> {
        match provider.integration_type {
            IntegrationType::Direct => {
                let signature = security::sign_launch_token(
                    &provider.api_secret,
                    token,
                    &game.game_code,
                    &req.currency,
                    &req.player_id.to_string(),
                );
                let mut query = vec![
                    ("token".to_string(), token.to_string()),
                    ("gameCode".to_string(), game.game_code.clone()),
                    ("currency".to_string(), req.currency.clone()),
                    ("language".to_string(), req.language.clone()),
                    ("playerId".to_string(), req.player_id.to_string()),
                    ("balance".to_string(), req.balance.to_string()),
                ];
                if let Some(return_url) = &req.return_url {
                    query.push(("returnUrl".to_string(), return_url.clone()));
                }
                query.push(("platform".to_string(), "wagerbridge".to_string()));
                query.push(("signature".to_string(), signature));
                Ok(build_url(&provider.api_endpoint, &query))
            }
            IntegrationType::Iframe => Ok(build_url(
                &self.iframe_host,
                &[
                    ("token".to_string(), token.to_string()),
                    ("gameId".to_string(), game.id.to_string()),
                ],
            )),
            IntegrationType::Aggregator => {
                // Resolved asynchronously by `launch_game` via the
                // aggregator trait; direct/iframe are synchronous string
                // builds so this branch is unreachable from `launch_game`
                // itself (see `launch_via_aggregator`).
                Err(CoreError::Internal(
                    "aggregator launch must go through launch_via_aggregator".to_string(),
                ))
            }
        }
    }

    /// Aggregator launches require an outbound HTTP call, so they are
    /// dispatched separately from the synchronous `direct`/`iframe` paths.
    pub async fn launch_via_aggregator(
        &self,
        provider: &GameProvider,
        game: &Game,
        req: &LaunchGameRequest,
        token: &str,
    ) -> CoreResult<String> {
        let signature = security::sign_launch_token(
            &provider.api_secret,
            token,
            &game.game_code,
            &req.currency,
            &req.player_id.to_string(),
        );
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("token".to_string(), token.to_string());
        fields.insert("gameCode".to_string(), game.game_code.clone());
        fields.insert("currency".to_string(), req.currency.clone());
        fields.insert("playerId".to_string(), req.player_id.to_string());
        fields.insert("timestamp".to_string(), Utc::now().timestamp().to_string());
        fields.insert("signature".to_string(), signature);

        self.aggregator
            .request_launch_url(&provider.api_endpoint, &fields)
            .await
            .map_err(|err| CoreError::Upstream(err.to_string()))
    }

    pub async fn process_callback(
        &self,
        raw_body: &[u8],
        signature_header: &str,
        partner_id: Uuid,
    ) -> CoreResult<CallbackResponse> {
        let callback: ProviderCallback = serde_json::from_slice(raw_body)?;

        let now = Utc::now().timestamp();
        if (now - callback.timestamp).abs() > CALLBACK_TIMESTAMP_SKEW_SECS {
            return Err(CoreError::Authentication("invalid timestamp".to_string()));
        }

        if !self.cache.check_and_store_nonce(&callback.nonce, NONCE_TTL).await? {
            return Err(CoreError::Authentication("nonce already used".to_string()));
        }

        let shared_secret = self.catalog.find_partner_shared_secret(partner_id).await?;
        if !security::verify_callback_signature(&shared_secret, raw_body, signature_header) {
            return Err(CoreError::Authentication("invalid signature".to_string()));
        }

        let session = self
            .sessions
            .find_by_token(&callback.token)
            .await?
            .ok_or_else(|| CoreError::Authentication("unknown or expired session".to_string()))?;
        if !session.is_active(Utc::now()) {
            return Err(CoreError::Authentication("session is not active".to_string()));
        }
        if session.partner_id != partner_id {
            return Err(CoreError::Authentication("session belongs to a different partner".to_string()));
        }

        if let Some(existing) = self
            .find_game_transaction_by_reference(&callback.reference_id)
            .await?
        {
            return match existing.status {
                TransactionStatus::Completed => {
                    let wallet = sqlx::query_as::<_, (Decimal,)>(
                        "SELECT balance FROM wallets WHERE id = (SELECT wallet_id FROM transactions WHERE id = $1)",
                    )
                    .bind(existing.transaction_id)
                    .fetch_one(&self.pool)
                    .await?;
                    Ok(CallbackResponse {
                        status: "success",
                        balance: wallet.0,
                        currency: session.session_data.currency.clone(),
                        transaction_id: existing.transaction_id.unwrap_or(existing.id),
                    })
                }
                _ => Err(CoreError::Conflict("callback already in progress".to_string())),
            };
        }

        let result = match callback.action {
            CallbackAction::Bet => {
                let amount = callback
                    .amount
                    .ok_or_else(|| CoreError::Validation("bet callback requires amount".to_string()))?;
                self.wallets
                    .debit(WalletOperationRequest {
                        player_id: session.player_id,
                        partner_id,
                        currency: callback.currency.clone().unwrap_or_else(|| session.session_data.currency.clone()),
                        amount,
                        reference_id: callback.reference_id.clone(),
                        transaction_type: TransactionType::Bet,
                        game_id: Some(session.game_id),
                        game_session_id: Some(session.id),
                        metadata: callback.game_data.clone(),
                    })
                    .await
            }
            CallbackAction::Win => {
                let amount = callback
                    .amount
                    .ok_or_else(|| CoreError::Validation("win callback requires amount".to_string()))?;
                self.wallets
                    .credit(WalletOperationRequest {
                        player_id: session.player_id,
                        partner_id,
                        currency: callback.currency.clone().unwrap_or_else(|| session.session_data.currency.clone()),
                        amount,
                        reference_id: callback.reference_id.clone(),
                        transaction_type: TransactionType::Win,
                        game_id: Some(session.game_id),
                        game_session_id: Some(session.id),
                        metadata: callback.game_data.clone(),
                    })
                    .await
            }
            CallbackAction::Refund => {
                let original_reference_id = callback
                    .original_reference_id
                    .clone()
                    .ok_or_else(|| CoreError::Validation("refund callback requires original_reference_id".to_string()))?;
                self.wallets
                    .rollback(RollbackRequest {
                        player_id: session.player_id,
                        partner_id,
                        reference_id: callback.reference_id.clone(),
                        original_reference_id,
                    })
                    .await
            }
        };

        let (status, transaction_status) = match &result {
            Ok(_) => ("completed", TransactionStatus::Completed),
            Err(_) => ("failed", TransactionStatus::Failed),
        };

        self.record_game_transaction(&callback, &session, transaction_status, result.as_ref().ok().map(|r| r.transaction_id))
            .await?;
        let _ = status;

        let result = result?;
        Ok(CallbackResponse {
            status: "success",
            balance: result.balance,
            currency: result.currency,
            transaction_id: result.transaction_id,
        })
    }

    async fn find_game_transaction_by_reference(&self, reference_id: &str) -> CoreResult<Option<GameTransaction>> {
        let row = sqlx::query_as::<_, GameTransactionRow>(
            "SELECT id, reference_id, game_session_id, transaction_id, round_id, action, status, created_at
             FROM game_transactions WHERE reference_id = $1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_game_transaction(
        &self,
        callback: &ProviderCallback,
        session: &GameSession,
        status: TransactionStatus,
        transaction_id: Option<Uuid>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO game_transactions
             (id, reference_id, game_session_id, transaction_id, round_id, action, status, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(Uuid::new_v4())
        .bind(&callback.reference_id)
        .bind(session.id)
        .bind(transaction_id)
        .bind(&callback.round_id)
        .bind(callback.action)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn build_url(base: &str, query: &[(String, String)]) -> String {
    let encoded: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect();
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}{}", encoded.join("&"))
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(sqlx::FromRow)]
struct GameTransactionRow {
    id: Uuid,
    reference_id: String,
    game_session_id: Uuid,
    transaction_id: Option<Uuid>,
    round_id: String,
    action: CallbackAction,
    status: TransactionStatus,
    created_at: chrono::DateTime<Utc>,
}

impl From<GameTransactionRow> for GameTransaction {
    fn from(row: GameTransactionRow) -> Self {
        GameTransaction {
            id: row.id,
            reference_id: row.reference_id,
            game_session_id: row.game_session_id,
            transaction_id: row.transaction_id,
            round_id: row.round_id,
            action: row.action,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_timestamp_boundary_is_inclusive_at_300s() {
        let now = 1_000_000i64;
        assert!((now - (now - CALLBACK_TIMESTAMP_SKEW_SECS)).abs() <= CALLBACK_TIMESTAMP_SKEW_SECS);
        assert!((now - (now - CALLBACK_TIMESTAMP_SKEW_SECS - 1)).abs() > CALLBACK_TIMESTAMP_SKEW_SECS);
    }
}
