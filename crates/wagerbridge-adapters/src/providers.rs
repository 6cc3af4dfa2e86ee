//! Game/provider catalog lookups and the outbound HTTP call to aggregator
//! integrations (spec.md §4.E step 4). A 10s timeout applies to every
//! provider round-trip (spec.md §5).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wagerbridge_core::error::{CoreError, CoreResult};
use wagerbridge_core::session::{AggregatorLauncher, GameCatalog};
use wagerbridge_core::types::{Game, GameProvider};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PgGameCatalog {
    pool: PgPool,
}

impl PgGameCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GameCatalog for PgGameCatalog {
    async fn find_game(&self, game_id: Uuid) -> CoreResult<Option<Game>> {
        let row = sqlx::query("SELECT * FROM games WHERE id = $1")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Game {
                id: r.try_get("id")?,
                provider_id: r.try_get("provider_id")?,
                game_code: r.try_get("game_code")?,
                category: r.try_get("category")?,
                status: r.try_get("status")?,
                rtp: r.try_get("rtp")?,
                min_bet: r.try_get("min_bet")?,
                max_bet: r.try_get("max_bet")?,
                features: r.try_get("features")?,
            })
        })
        .transpose()
        .map_err(CoreError::from)
    }

    async fn find_provider(&self, provider_id: Uuid) -> CoreResult<Option<GameProvider>> {
        let row = sqlx::query("SELECT * FROM game_providers WHERE id = $1")
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(GameProvider {
                id: r.try_get("id")?,
                code: r.try_get("code")?,
                integration_type: r.try_get("integration_type")?,
                api_endpoint: r.try_get("api_endpoint")?,
                api_key: r.try_get("api_key")?,
                api_secret: r.try_get("api_secret")?,
                status: r.try_get("status")?,
                supported_currencies: r.try_get("supported_currencies")?,
                supported_languages: r.try_get("supported_languages")?,
            })
        })
        .transpose()
        .map_err(CoreError::from)
    }

    async fn find_partner_shared_secret(&self, partner_id: Uuid) -> CoreResult<String> {
        let row = sqlx::query("SELECT shared_secret FROM partner_secrets WHERE partner_id = $1")
            .bind(partner_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("partner_secret", partner_id.to_string()))?;
        Ok(row.try_get("shared_secret")?)
    }
}

pub struct ReqwestAggregatorLauncher {
    client: reqwest::Client,
}

impl ReqwestAggregatorLauncher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
        }
    }
}

impl Default for ReqwestAggregatorLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregatorLauncher for ReqwestAggregatorLauncher {
    async fn request_launch_url(
        &self,
        endpoint: &str,
        fields: &BTreeMap<String, String>,
    ) -> CoreResult<String> {
        let response = self
            .client
            .post(endpoint)
            .json(fields)
            .send()
            .await
            .map_err(|err| CoreError::Upstream(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!(
                "provider launch endpoint returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| CoreError::Upstream(err.to_string()))?;
        body.get("game_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| CoreError::Upstream("provider response missing game_url".to_string()))
    }
}
