//! Generic repository layer (spec.md §4.B): a small filter DSL plus a
//! `Repository<T>` trait, grounded in the teacher's storage-trait
//! composition style (`palm-daemon::storage::traits`) but built around a
//! Postgres query builder rather than a fixed CRUD interface, since the
//! admission/wallet/session/AML subsystems each need different filter
//! shapes over the same handful of tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::*;

/// A single column comparison. `field` is the literal column name — callers
/// are trusted internal code, not request input, so no identifier
/// escaping beyond `QueryBuilder`'s bind-parameter placeholders is needed.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Uuid(Uuid),
    Text(String),
    Bool(bool),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    Int(i64),
}

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(&'static str, FilterValue),
    NotEq(&'static str, FilterValue),
    In(&'static str, Vec<FilterValue>),
    NotIn(&'static str, Vec<FilterValue>),
    Lt(&'static str, FilterValue),
    Lte(&'static str, FilterValue),
    Gt(&'static str, FilterValue),
    Gte(&'static str, FilterValue),
    IContains(&'static str, String),
    IsNull(&'static str, bool),
}

#[derive(Debug, Clone, Default)]
pub struct FilterSet(pub Vec<Filter>);

impl FilterSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, filter: Filter) -> Self {
        self.0.push(filter);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub field: &'static str,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn first(limit: i64) -> Self {
        Self { offset: 0, limit }
    }
}

fn push_filter_value<'a>(builder: &mut QueryBuilder<'a, Postgres>, value: FilterValue) {
    match value {
        FilterValue::Uuid(v) => {
            builder.push_bind(v);
        }
        FilterValue::Text(v) => {
            builder.push_bind(v);
        }
        FilterValue::Bool(v) => {
            builder.push_bind(v);
        }
        FilterValue::Decimal(v) => {
            builder.push_bind(v);
        }
        FilterValue::Timestamp(v) => {
            builder.push_bind(v);
        }
        FilterValue::Int(v) => {
            builder.push_bind(v);
        }
    }
}

/// Appends `WHERE ...` (or `AND ...` if a predicate already exists) clauses
/// for every filter in `filters` onto `builder`.
pub fn apply_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filters: &FilterSet) {
    for (idx, filter) in filters.0.iter().enumerate() {
        builder.push(if idx == 0 { " WHERE " } else { " AND " });
        match filter.clone() {
            Filter::Eq(field, value) => {
                builder.push(field).push(" = ");
                push_filter_value(builder, value);
            }
            Filter::NotEq(field, value) => {
                builder.push(field).push(" != ");
                push_filter_value(builder, value);
            }
            Filter::In(field, values) => {
                builder.push(field).push(" = ANY(");
                builder.push_bind(values_as_texts(values));
                builder.push(")");
            }
            Filter::NotIn(field, values) => {
                builder.push(field).push(" != ALL(");
                builder.push_bind(values_as_texts(values));
                builder.push(")");
            }
            Filter::Lt(field, value) => {
                builder.push(field).push(" < ");
                push_filter_value(builder, value);
            }
            Filter::Lte(field, value) => {
                builder.push(field).push(" <= ");
                push_filter_value(builder, value);
            }
            Filter::Gt(field, value) => {
                builder.push(field).push(" > ");
                push_filter_value(builder, value);
            }
            Filter::Gte(field, value) => {
                builder.push(field).push(" >= ");
                push_filter_value(builder, value);
            }
            Filter::IContains(field, needle) => {
                builder.push(field).push(" ILIKE ");
                builder.push_bind(format!("%{needle}%"));
            }
            Filter::IsNull(field, is_null) => {
                builder.push(field).push(if is_null { " IS NULL" } else { " IS NOT NULL" });
            }
        }
    }
}

/// `In`/`NotIn` operate on heterogeneous `FilterValue`s but Postgres arrays
/// must be uniform; every caller in this codebase uses `In`/`NotIn` with
/// text-representable values (UUIDs or strings), so this normalizes to
/// `text[]` and relies on implicit cast for UUID columns.
fn values_as_texts(values: Vec<FilterValue>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            FilterValue::Uuid(u) => u.to_string(),
            FilterValue::Text(t) => t,
            FilterValue::Bool(b) => b.to_string(),
            FilterValue::Decimal(d) => d.to_string(),
            FilterValue::Timestamp(t) => t.to_rfc3339(),
            FilterValue::Int(i) => i.to_string(),
        })
        .collect()
}

#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<T>>;
    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<T>>;
    async fn count(&self, filters: &FilterSet) -> CoreResult<i64>;
}

// ---------------------------------------------------------------------
// Wallet repository
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct WalletRepository {
    pool: PgPool,
}

impl WalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Wallet> {
        Ok(Wallet {
            id: row.try_get("id")?,
            player_id: row.try_get("player_id")?,
            partner_id: row.try_get("partner_id")?,
            currency: row.try_get("currency")?,
            balance: row.try_get("balance")?,
            active: row.try_get("active")?,
            locked: row.try_get("locked")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn find_by_player_partner(
        &self,
        player_id: Uuid,
        partner_id: Uuid,
        currency: &str,
    ) -> CoreResult<Option<Wallet>> {
        let row = sqlx::query(
            "SELECT * FROM wallets WHERE player_id = $1 AND partner_id = $2 AND currency = $3",
        )
        .bind(player_id)
        .bind(partner_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    /// Locks the wallet row for the duration of the caller's transaction
    /// (spec.md §4.D step 2: `SELECT ... FOR UPDATE`). Creates the row
    /// first if it is absent and the caller is performing a credit.
    ///
    /// Wallets are keyed on the `(player_id, partner_id, currency)` unique
    /// triple, so `currency` must be part of the lookup, not just the row
    /// that happens to be created.
    pub async fn lock_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        player_id: Uuid,
        partner_id: Uuid,
        currency: &str,
    ) -> CoreResult<Option<Wallet>> {
        let row = sqlx::query(
            "SELECT * FROM wallets WHERE player_id = $1 AND partner_id = $2 AND currency = $3 FOR UPDATE",
        )
        .bind(player_id)
        .bind(partner_id)
        .bind(currency)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    pub async fn create(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        player_id: Uuid,
        partner_id: Uuid,
        currency: &str,
    ) -> CoreResult<Wallet> {
        let row = sqlx::query(
            "INSERT INTO wallets (id, player_id, partner_id, currency, balance, active, locked, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, true, false, now(), now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(player_id)
        .bind(partner_id)
        .bind(currency)
        .fetch_one(&mut **tx)
        .await?;
        Self::from_row(&row).map_err(CoreError::from)
    }

    pub async fn update_balance(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        wallet_id: Uuid,
        new_balance: Decimal,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE wallets SET balance = $1, updated_at = now() WHERE id = $2")
            .bind(new_balance)
            .bind(wallet_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository<Wallet> for WalletRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Wallet>> {
        let row = sqlx::query("SELECT * FROM wallets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<Wallet>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM wallets");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM wallets");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

// ---------------------------------------------------------------------
// Transaction repository
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Transaction> {
        Ok(Transaction {
            id: row.try_get("id")?,
            reference_id: row.try_get("reference_id")?,
            wallet_id: row.try_get("wallet_id")?,
            player_id: row.try_get("player_id")?,
            partner_id: row.try_get("partner_id")?,
            transaction_type: row.try_get("transaction_type")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            status: row.try_get("status")?,
            original_balance: row.try_get("original_balance")?,
            updated_balance: row.try_get("updated_balance")?,
            game_id: row.try_get("game_id")?,
            game_session_id: row.try_get("game_session_id")?,
            original_transaction_id: row.try_get("original_transaction_id")?,
            metadata: row.try_get::<Option<Value>, _>("metadata")?.unwrap_or(Value::Null),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Idempotency lookup: `(partner_id, reference_id)` uniquely identifies
    /// a wallet operation (spec.md §4.D step 1).
    pub async fn find_by_partner_reference(
        &self,
        partner_id: Uuid,
        reference_id: &str,
    ) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query(
            "SELECT * FROM transactions WHERE partner_id = $1 AND reference_id = $2",
        )
        .bind(partner_id)
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    pub async fn insert(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        transaction: &Transaction,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO transactions
             (id, reference_id, wallet_id, player_id, partner_id, transaction_type, amount,
              currency, status, original_balance, updated_balance, game_id, game_session_id,
              original_transaction_id, metadata, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
        )
        .bind(transaction.id)
        .bind(&transaction.reference_id)
        .bind(transaction.wallet_id)
        .bind(transaction.player_id)
        .bind(transaction.partner_id)
        .bind(transaction.transaction_type)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(transaction.status)
        .bind(transaction.original_balance)
        .bind(transaction.updated_balance)
        .bind(transaction.game_id)
        .bind(transaction.game_session_id)
        .bind(transaction.original_transaction_id)
        .bind(&transaction.metadata)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository<Transaction> for TransactionRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<Transaction>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM transactions");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        } else {
            builder.push(" ORDER BY created_at DESC");
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM transactions");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

// ---------------------------------------------------------------------
// Game session repository
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct GameSessionRepository {
    pool: PgPool,
}

impl GameSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<GameSession> {
        let session_data: Value = row.try_get("session_data")?;
        Ok(GameSession {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            player_id: row.try_get("player_id")?,
            partner_id: row.try_get("partner_id")?,
            game_id: row.try_get("game_id")?,
            status: row.try_get("status")?,
            session_data: serde_json::from_value(session_data)
                .unwrap_or(GameSessionData {
                    currency: String::new(),
                    language: String::new(),
                    return_url: None,
                }),
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    /// spec.md §4.E: a player may hold at most one active session per game.
    pub async fn get_active_session_for_player_game(
        &self,
        player_id: Uuid,
        game_id: Uuid,
    ) -> CoreResult<Option<GameSession>> {
        let row = sqlx::query(
            "SELECT * FROM game_sessions
             WHERE player_id = $1 AND game_id = $2 AND status = 'active' AND expires_at > now()",
        )
        .bind(player_id)
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    /// Transaction-scoped variant of [`Self::get_active_session_for_player_game`]
    /// for use after the caller has already locked the player's row
    /// (spec.md §4.B: "acquires a `FOR NO KEY UPDATE` lock on the player
    /// row, then selects the active session").
    pub async fn get_active_session_for_player_game_locked(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        player_id: Uuid,
        game_id: Uuid,
    ) -> CoreResult<Option<GameSession>> {
        let row = sqlx::query(
            "SELECT * FROM game_sessions
             WHERE player_id = $1 AND game_id = $2 AND status = 'active' AND expires_at > now()",
        )
        .bind(player_id)
        .bind(game_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    pub async fn insert_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        session: &GameSession,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO game_sessions
             (id, token, player_id, partner_id, game_id, status, session_data, started_at, ended_at, expires_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(session.id)
        .bind(&session.token)
        .bind(session.player_id)
        .bind(session.partner_id)
        .bind(session.game_id)
        .bind(session.status)
        .bind(serde_json::to_value(&session.session_data)?)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.expires_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn find_by_token(&self, token: &str) -> CoreResult<Option<GameSession>> {
        let row = sqlx::query("SELECT * FROM game_sessions WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    pub async fn insert(&self, session: &GameSession) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO game_sessions
             (id, token, player_id, partner_id, game_id, status, session_data, started_at, ended_at, expires_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(session.id)
        .bind(&session.token)
        .bind(session.player_id)
        .bind(session.partner_id)
        .bind(session.game_id)
        .bind(session.status)
        .bind(serde_json::to_value(&session.session_data)?)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: Uuid, status: GameSessionStatus, ended_at: Option<DateTime<Utc>>) -> CoreResult<()> {
        sqlx::query("UPDATE game_sessions SET status = $1, ended_at = $2 WHERE id = $3")
            .bind(status)
            .bind(ended_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository<GameSession> for GameSessionRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<GameSession>> {
        let row = sqlx::query("SELECT * FROM game_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<GameSession>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM game_sessions");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM game_sessions");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

// ---------------------------------------------------------------------
// Partner / ApiKey repositories
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct PartnerRepository {
    pool: PgPool,
}

impl PartnerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Partner> {
        let commission: Value = row.try_get("commission")?;
        Ok(Partner {
            id: row.try_get("id")?,
            short_code: row.try_get("short_code")?,
            partner_type: row.try_get("partner_type")?,
            status: row.try_get("status")?,
            commission: serde_json::from_value(commission).unwrap_or(CommissionModel {
                model: "revenue_share".to_string(),
                rate: Decimal::ZERO,
            }),
            contact_email: row.try_get("contact_email")?,
            contract_start: row.try_get("contract_start")?,
            contract_end: row.try_get("contract_end")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn find_by_short_code(&self, short_code: &str) -> CoreResult<Option<Partner>> {
        let row = sqlx::query("SELECT * FROM partners WHERE short_code = $1")
            .bind(short_code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }
}

#[async_trait]
impl Repository<Partner> for PartnerRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Partner>> {
        let row = sqlx::query("SELECT * FROM partners WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<Partner>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM partners");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM partners");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

#[derive(Clone)]
pub struct ApiKeyRepository {
    pool: PgPool,
}

impl ApiKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<ApiKey> {
        Ok(ApiKey {
            id: row.try_get("id")?,
            partner_id: row.try_get("partner_id")?,
            key_prefix: row.try_get("key_prefix")?,
            secret_hash: row.try_get("secret_hash")?,
            name: row.try_get("name")?,
            permissions: row.try_get("permissions")?,
            active: row.try_get("active")?,
            expires_at: row.try_get("expires_at")?,
            last_used_at: row.try_get("last_used_at")?,
            last_used_ip: row.try_get("last_used_ip")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn find_by_prefix(&self, key_prefix: &str) -> CoreResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_prefix = $1")
            .bind(key_prefix)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    pub async fn touch_usage(&self, id: Uuid, ip: &str) -> CoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = now(), last_used_ip = $1 WHERE id = $2")
            .bind(ip)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_allowed_ips(&self, partner_id: Uuid) -> CoreResult<Vec<PartnerIp>> {
        let rows = sqlx::query("SELECT * FROM partner_ips WHERE partner_id = $1")
            .bind(partner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PartnerIp {
                    id: row.try_get("id")?,
                    partner_id: row.try_get("partner_id")?,
                    cidr: row.try_get("cidr")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(CoreError::from)
    }

    pub async fn insert_allowed_ip(&self, partner_id: Uuid, cidr: &str) -> CoreResult<PartnerIp> {
        let row = sqlx::query(
            "INSERT INTO partner_ips (id, partner_id, cidr, created_at) VALUES ($1, $2, $3, now()) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(partner_id)
        .bind(cidr)
        .fetch_one(&self.pool)
        .await?;
        Ok(PartnerIp {
            id: row.try_get("id")?,
            partner_id: row.try_get("partner_id")?,
            cidr: row.try_get("cidr")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Creates a new API key for `partner_id`. The plaintext secret is
    /// returned alongside the persisted record and never stored.
    pub async fn create(
        &self,
        partner_id: Uuid,
        name: &str,
        permissions: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<(ApiKey, PlaintextApiSecret)> {
        let secret = crate::security::generate_api_secret();
        let secret_hash = crate::security::hash_password(&secret)
            .map_err(|err| CoreError::Internal(err.to_string()))?;
        let key_prefix = secret[..8].to_string();

        let row = sqlx::query(
            "INSERT INTO api_keys
             (id, partner_id, key_prefix, secret_hash, name, permissions, active, expires_at, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,true,$7,now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(partner_id)
        .bind(&key_prefix)
        .bind(&secret_hash)
        .bind(name)
        .bind(permissions)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        let api_key = Self::from_row(&row).map_err(CoreError::from)?;
        Ok((api_key, PlaintextApiSecret(format!("{key_prefix}.{secret}"))))
    }

    pub async fn deactivate(&self, id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query("UPDATE api_keys SET active = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Repository<ApiKey> for ApiKeyRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<ApiKey>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM api_keys");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM api_keys");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

// ---------------------------------------------------------------------
// Game catalog listing
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct GameRepository {
    pool: PgPool,
}

impl GameRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> sqlx::Result<Game> {
        Ok(Game {
            id: row.try_get("id")?,
            provider_id: row.try_get("provider_id")?,
            game_code: row.try_get("game_code")?,
            category: row.try_get("category")?,
            status: row.try_get("status")?,
            rtp: row.try_get("rtp")?,
            min_bet: row.try_get("min_bet")?,
            max_bet: row.try_get("max_bet")?,
            features: row.try_get("features")?,
        })
    }
}

#[async_trait]
impl Repository<Game> for GameRepository {
    async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Game>> {
        let row = sqlx::query("SELECT * FROM games WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose().map_err(CoreError::from)
    }

    async fn find(&self, filters: &FilterSet, sort: Option<Sort>, page: Page) -> CoreResult<Vec<Game>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM games");
        apply_filters(&mut builder, filters);
        if let Some(sort) = sort {
            builder.push(" ORDER BY ").push(sort.field);
            builder.push(match sort.direction {
                SortDirection::Asc => " ASC",
                SortDirection::Desc => " DESC",
            });
        } else {
            builder.push(" ORDER BY game_code ASC");
        }
        builder.push(" OFFSET ").push_bind(page.offset);
        builder.push(" LIMIT ").push_bind(page.limit);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect::<sqlx::Result<_>>().map_err(CoreError::from)
    }

    async fn count(&self, filters: &FilterSet) -> CoreResult<i64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT count(*) FROM games");
        apply_filters(&mut builder, filters);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_set_builds_without_panicking() {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM wallets");
        let filters = FilterSet::new()
            .push(Filter::Eq("partner_id", FilterValue::Uuid(Uuid::nil())))
            .push(Filter::Gte("balance", FilterValue::Decimal(Decimal::ZERO)))
            .push(Filter::IsNull("locked", false));
        apply_filters(&mut builder, &filters);
        let sql = builder.sql();
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("AND"));
    }
}
