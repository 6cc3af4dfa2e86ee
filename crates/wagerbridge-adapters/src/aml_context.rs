//! Postgres-backed [`AmlContextProvider`]: player risk attributes and
//! historical transaction statistics the scoring pipeline needs but the
//! core crate stays free of direct SQL for (spec.md §4.F signals 6-8).

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wagerbridge_core::aml::AmlContextProvider;
use wagerbridge_core::error::{CoreError, CoreResult};
use wagerbridge_core::types::{Transaction, TransactionStatus, TransactionType};

pub struct PgAmlContextProvider {
    pool: PgPool,
}

impl PgAmlContextProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AmlContextProvider for PgAmlContextProvider {
    async fn player_country(&self, player_id: Uuid) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT country FROM players WHERE id = $1")
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<Option<String>, _>("country")).transpose()?.flatten())
    }

    async fn is_pep(&self, player_id: Uuid) -> CoreResult<bool> {
        let row = sqlx::query("SELECT is_pep FROM players WHERE id = $1")
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<bool, _>("is_pep")).transpose()?.unwrap_or(false))
    }

    async fn linked_account_count(&self, player_id: Uuid) -> CoreResult<u32> {
        let row = sqlx::query(
            "SELECT count(*) AS linked FROM player_links
             WHERE player_id = $1 OR linked_player_id = $1",
        )
        .bind(player_id)
        .fetch_one(&self.pool)
        .await?;
        let linked: i64 = row.try_get("linked")?;
        Ok(linked.max(0) as u32 + 1)
    }

    async fn historical_game_share(&self, player_id: Uuid, game_id: Uuid) -> CoreResult<f64> {
        let row = sqlx::query(
            "SELECT
                 count(*) FILTER (WHERE game_id = $2)::float8 AS for_game,
                 greatest(count(*), 1)::float8 AS total
             FROM transactions WHERE player_id = $1 AND transaction_type = 'bet'",
        )
        .bind(player_id)
        .bind(game_id)
        .fetch_one(&self.pool)
        .await?;
        let for_game: f64 = row.try_get("for_game")?;
        let total: f64 = row.try_get("total")?;
        Ok(for_game / total)
    }

    async fn recent_transactions(&self, player_id: Uuid, since: DateTime<Utc>) -> CoreResult<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE player_id = $1 AND created_at >= $2 ORDER BY created_at DESC",
        )
        .bind(player_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(Transaction {
                    id: r.try_get("id")?,
                    reference_id: r.try_get("reference_id")?,
                    wallet_id: r.try_get("wallet_id")?,
                    player_id: r.try_get("player_id")?,
                    partner_id: r.try_get("partner_id")?,
                    transaction_type: r.try_get::<TransactionType, _>("transaction_type")?,
                    amount: r.try_get("amount")?,
                    currency: r.try_get("currency")?,
                    status: r.try_get::<TransactionStatus, _>("status")?,
                    original_balance: r.try_get("original_balance")?,
                    updated_balance: r.try_get("updated_balance")?,
                    game_id: r.try_get("game_id")?,
                    game_session_id: r.try_get("game_session_id")?,
                    original_transaction_id: r.try_get("original_transaction_id")?,
                    metadata: r
                        .try_get::<Option<serde_json::Value>, _>("metadata")?
                        .unwrap_or(serde_json::Value::Null),
                    created_at: r.try_get("created_at")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(CoreError::from)
    }

    async fn thirty_day_bet_stats(&self, player_id: Uuid) -> CoreResult<(f64, f64)> {
        let row = sqlx::query(
            "SELECT
                 coalesce(avg(amount), 0)::float8 AS mean,
                 coalesce(stddev_pop(amount), 0)::float8 AS stddev
             FROM transactions
             WHERE player_id = $1 AND transaction_type = 'bet' AND created_at >= now() - interval '30 days'",
        )
        .bind(player_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("mean")?, row.try_get("stddev")?))
    }
}
