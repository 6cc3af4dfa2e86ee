//! Wallet engine (spec.md §4.D): atomic, idempotent credit/debit/rollback.
//!
//! Every operation opens its own serializable transaction and retries
//! exactly once on a Postgres serialization failure (SQLSTATE 40001) or
//! deadlock (40P01) — anything else, including business errors, surfaces
//! immediately without a retry.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::cache::CacheLayer;
use crate::config::WalletConfig;
use crate::error::{CoreError, CoreResult};
use crate::repository::{TransactionRepository, WalletRepository};
use crate::types::{
    RollbackRequest, Transaction, TransactionStatus, TransactionType, WalletOperationRequest,
    WalletOperationResult,
};

pub struct WalletEngine {
    pool: PgPool,
    wallets: Arc<WalletRepository>,
    transactions: Arc<TransactionRepository>,
    cache: Arc<CacheLayer>,
    limits: WalletConfig,
}

impl WalletEngine {
    pub fn new(
        pool: PgPool,
        wallets: Arc<WalletRepository>,
        transactions: Arc<TransactionRepository>,
        cache: Arc<CacheLayer>,
        limits: WalletConfig,
    ) -> Self {
        Self {
            pool,
            wallets,
            transactions,
            cache,
            limits,
        }
    }

    fn max_transaction_amount(&self, currency: &str) -> Decimal {
        resolve_max_transaction(&self.limits, currency)
    }

    pub async fn credit(&self, req: WalletOperationRequest) -> CoreResult<WalletOperationResult> {
        self.apply(req, Sign::Credit).await
    }

    pub async fn debit(&self, req: WalletOperationRequest) -> CoreResult<WalletOperationResult> {
        self.apply(req, Sign::Debit).await
    }

    /// Creates a zero-balance wallet for `(player_id, partner_id, currency)`
    /// if one does not already exist (spec.md §4.E step 2). Idempotent and
    /// outside the reference-id idempotency scheme since it carries no
    /// transaction of its own.
    pub async fn ensure_wallet_exists(&self, player_id: Uuid, partner_id: Uuid, currency: &str) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        if self
            .wallets
            .lock_for_update(&mut tx, player_id, partner_id, currency)
            .await?
            .is_none()
        {
            self.wallets.create(&mut tx, player_id, partner_id, currency).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Opens a fresh transaction and locks the player's wallet row for
    /// `(player_id, partner_id, currency)`. There is no standalone player
    /// table in this schema, so the wallet row — guaranteed to exist by
    /// the time a game session is launched — stands in for the "player
    /// row" spec.md §4.B locks before a session lookup/insert: it serializes
    /// concurrent launches for the same player exactly as a dedicated player
    /// row would. The caller performs its session read/insert against the
    /// returned transaction and is responsible for committing it.
    pub async fn begin_locked_on_player(
        &self,
        player_id: Uuid,
        partner_id: Uuid,
        currency: &str,
    ) -> CoreResult<sqlx::Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        self.wallets.lock_for_update(&mut tx, player_id, partner_id, currency).await?;
        Ok(tx)
    }

    async fn apply(&self, req: WalletOperationRequest, sign: Sign) -> CoreResult<WalletOperationResult> {
        validate_amount(req.amount)?;
        let ceiling = self.max_transaction_amount(&req.currency);
        if req.amount > ceiling {
            return Err(CoreError::Validation(format!(
                "amount {} exceeds the maximum single transaction of {} {}",
                req.amount, ceiling, req.currency
            )));
        }

        match self.apply_once(&req, sign).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_retryable_db_conflict() => self.apply_once(&req, sign).await,
            Err(err) => Err(err),
        }
    }

    async fn apply_once(&self, req: &WalletOperationRequest, sign: Sign) -> CoreResult<WalletOperationResult> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = self
            .transactions
            .find_by_partner_reference(req.partner_id, &req.reference_id)
            .await?
        {
            return match existing.status {
                TransactionStatus::Completed => Ok(WalletOperationResult {
                    balance: existing.updated_balance,
                    currency: existing.currency,
                    reference_id: existing.reference_id,
                    transaction_id: existing.id,
                    amount: existing.amount,
                    transaction_type: existing.transaction_type,
                }),
                TransactionStatus::Pending | TransactionStatus::Failed => Err(CoreError::Conflict(
                    format!("reference_id {} already has a non-completed transaction", req.reference_id),
                )),
                TransactionStatus::Canceled => Err(CoreError::Conflict(format!(
                    "reference_id {} was already canceled",
                    req.reference_id
                ))),
            };
        }

        let existing_wallet = self
            .wallets
            .lock_for_update(&mut tx, req.player_id, req.partner_id, &req.currency)
            .await?;

        let wallet = match existing_wallet {
            Some(wallet) => wallet,
            None if matches!(sign, Sign::Credit) => {
                self.wallets
                    .create(&mut tx, req.player_id, req.partner_id, &req.currency)
                    .await?
            }
            None => return Err(CoreError::not_found("wallet", req.player_id.to_string())),
        };

        if !wallet.is_usable() {
            return Err(CoreError::Validation("wallet is inactive or locked".to_string()));
        }

        let signed_amount = match sign {
            Sign::Credit => req.amount,
            Sign::Debit => -req.amount,
        };
        let new_balance = wallet.balance + signed_amount;
        if new_balance < Decimal::ZERO {
            return Err(CoreError::InsufficientFunds);
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            reference_id: req.reference_id.clone(),
            wallet_id: wallet.id,
            player_id: req.player_id,
            partner_id: req.partner_id,
            transaction_type: req.transaction_type,
            amount: req.amount,
            currency: req.currency.clone(),
            status: TransactionStatus::Completed,
            original_balance: wallet.balance,
            updated_balance: new_balance,
            game_id: req.game_id,
            game_session_id: req.game_session_id,
            original_transaction_id: None,
            metadata: req.metadata.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.transactions.insert(&mut tx, &transaction).await?;
        self.wallets.update_balance(&mut tx, wallet.id, new_balance).await?;
        tx.commit().await?;

        self.cache
            .invalidate_by_tag(&format!("wallet:{}", wallet.id))
            .await;
        self.cache
            .invalidate_by_tag(&format!("player:{}:balance", req.player_id))
            .await;

        Ok(WalletOperationResult {
            balance: new_balance,
            currency: req.currency.clone(),
            reference_id: req.reference_id.clone(),
            transaction_id: transaction.id,
            amount: req.amount,
            transaction_type: req.transaction_type,
        })
    }

    pub async fn rollback(&self, req: RollbackRequest) -> CoreResult<WalletOperationResult> {
        match self.rollback_once(&req).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_retryable_db_conflict() => self.rollback_once(&req).await,
            Err(err) => Err(err),
        }
    }

    async fn rollback_once(&self, req: &RollbackRequest) -> CoreResult<WalletOperationResult> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = self
            .transactions
            .find_by_partner_reference(req.partner_id, &req.reference_id)
            .await?
        {
            return match existing.status {
                TransactionStatus::Completed => Ok(WalletOperationResult {
                    balance: existing.updated_balance,
                    currency: existing.currency,
                    reference_id: existing.reference_id,
                    transaction_id: existing.id,
                    amount: existing.amount,
                    transaction_type: existing.transaction_type,
                }),
                _ => Err(CoreError::Conflict(format!(
                    "reference_id {} already has a non-completed transaction",
                    req.reference_id
                ))),
            };
        }

        let original = self
            .transactions
            .find_by_partner_reference(req.partner_id, &req.original_reference_id)
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", req.original_reference_id.clone()))?;

        if original.status != TransactionStatus::Completed {
            return Err(CoreError::Conflict(
                "original transaction is not completed or was already rolled back".to_string(),
            ));
        }

        let wallet = self
            .wallets
            .lock_for_update(&mut tx, req.player_id, req.partner_id, &original.currency)
            .await?
            .ok_or_else(|| CoreError::not_found("wallet", req.player_id.to_string()))?;

        if !wallet.is_usable() {
            return Err(CoreError::Validation("wallet is inactive or locked".to_string()));
        }

        // Reversing amount is the negation of the original's signed delta.
        let original_delta = original.updated_balance - original.original_balance;
        let reversing_amount = -original_delta;
        let new_balance = wallet.balance + reversing_amount;
        if new_balance < Decimal::ZERO {
            return Err(CoreError::InsufficientFunds);
        }

        let reversing = Transaction {
            id: Uuid::new_v4(),
            reference_id: req.reference_id.clone(),
            wallet_id: wallet.id,
            player_id: req.player_id,
            partner_id: req.partner_id,
            transaction_type: TransactionType::Rollback,
            amount: reversing_amount.abs(),
            currency: original.currency.clone(),
            status: TransactionStatus::Completed,
            original_balance: wallet.balance,
            updated_balance: new_balance,
            game_id: original.game_id,
            game_session_id: original.game_session_id,
            original_transaction_id: Some(original.id),
            metadata: serde_json::json!({ "rollback_of": original.id }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.transactions.insert(&mut tx, &reversing).await?;
        self.wallets.update_balance(&mut tx, wallet.id, new_balance).await?;
        mark_canceled(&mut tx, original.id).await?;
        tx.commit().await?;

        self.cache
            .invalidate_by_tag(&format!("wallet:{}", wallet.id))
            .await;
        self.cache
            .invalidate_by_tag(&format!("player:{}:balance", req.player_id))
            .await;

        Ok(WalletOperationResult {
            balance: new_balance,
            currency: original.currency,
            reference_id: req.reference_id.clone(),
            transaction_id: reversing.id,
            amount: reversing.amount,
            transaction_type: TransactionType::Rollback,
        })
    }
}

async fn mark_canceled(tx: &mut sqlx::Transaction<'_, Postgres>, transaction_id: Uuid) -> CoreResult<()> {
    sqlx::query("UPDATE transactions SET status = 'canceled', updated_at = now() WHERE id = $1")
        .bind(transaction_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Sign {
    Credit,
    Debit,
}

fn validate_amount(amount: Decimal) -> CoreResult<()> {
    if amount <= Decimal::ZERO {
        Err(CoreError::Validation("amount must be greater than zero".to_string()))
    } else {
        Ok(())
    }
}

fn resolve_max_transaction(limits: &WalletConfig, currency: &str) -> Decimal {
    limits
        .max_transaction_by_currency
        .get(currency)
        .copied()
        .unwrap_or(limits.default_max_transaction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        assert!(validate_amount(Decimal::ZERO).is_err());
        assert!(validate_amount(Decimal::new(-100, 2)).is_err());
    }

    #[test]
    fn positive_amounts_pass() {
        assert!(validate_amount(Decimal::new(1000, 2)).is_ok());
    }

    #[test]
    fn max_transaction_falls_back_to_default_for_unlisted_currency() {
        let limits = WalletConfig::default();
        assert_eq!(
            resolve_max_transaction(&limits, "XRP"),
            limits.default_max_transaction
        );
    }

    #[test]
    fn max_transaction_uses_per_currency_override() {
        let mut limits = WalletConfig::default();
        limits
            .max_transaction_by_currency
            .insert("USD".to_string(), Decimal::new(500_00, 2));
        assert_eq!(resolve_max_transaction(&limits, "USD"), Decimal::new(500_00, 2));
    }
}
