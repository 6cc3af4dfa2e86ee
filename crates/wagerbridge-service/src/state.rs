use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use wagerbridge_adapters::{
    FilesystemReportRenderer, InMemoryKvStore, PgAmlContextProvider, PgGameCatalog,
    RedisKvStore, ReqwestAggregatorLauncher, StubCsvBodyRenderer,
};
use wagerbridge_core::aml::AmlPipeline;
use wagerbridge_core::{
    AdmissionPipeline, ApiKeyRepository, CacheLayer, GameRepository, GameSessionEngine,
    GameSessionRepository, PartnerRepository, ReportingScheduler, TransactionRepository,
    WagerBridgeConfig, WalletEngine, WalletRepository,
};

use crate::workers::{AmlQueue, AuditLogWriter};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database pool error: {0}")]
    Pool(#[from] sqlx::Error),
    #[error("kv store connection error: {0}")]
    Kv(String),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WagerBridgeConfig>,
    pub pool: sqlx::PgPool,
    pub cache: Arc<CacheLayer>,
    pub admission: Arc<AdmissionPipeline>,
    pub api_keys: Arc<ApiKeyRepository>,
    pub partners: Arc<PartnerRepository>,
    pub games: Arc<GameRepository>,
    pub wallets: Arc<WalletEngine>,
    pub wallets_repo: Arc<WalletRepository>,
    pub transactions_repo: Arc<TransactionRepository>,
    pub sessions: Arc<GameSessionEngine>,
    pub aml_queue: Arc<AmlQueue>,
    pub reports: Arc<ReportingScheduler>,
    pub audit: Arc<AuditLogWriter>,
}

impl AppState {
    pub async fn bootstrap(config: WagerBridgeConfig) -> Result<Self, BootstrapError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.storage.max_db_connections)
            .connect(&config.storage.database_url)
            .await?;

        let l2: Box<dyn wagerbridge_core::KvStore> = if config.storage.kv_url.starts_with("redis://") {
            Box::new(
                RedisKvStore::connect(&config.storage.kv_url)
                    .await
                    .map_err(|err| BootstrapError::Kv(err.to_string()))?,
            )
        } else {
            Box::new(InMemoryKvStore::new())
        };
        let cache = Arc::new(CacheLayer::new(l2, config.storage.l1_capacity));

        let api_keys = Arc::new(ApiKeyRepository::new(pool.clone()));
        let partners = Arc::new(PartnerRepository::new(pool.clone()));
        let games = Arc::new(GameRepository::new(pool.clone()));
        let wallets_repo = Arc::new(WalletRepository::new(pool.clone()));
        let transactions_repo = Arc::new(TransactionRepository::new(pool.clone()));
        let sessions_repo = Arc::new(GameSessionRepository::new(pool.clone()));

        let admission = Arc::new(AdmissionPipeline::new(
            Arc::clone(&cache),
            Arc::clone(&api_keys),
            config.admission.clone(),
        ));

        let wallets = Arc::new(WalletEngine::new(
            pool.clone(),
            Arc::clone(&wallets_repo),
            Arc::clone(&transactions_repo),
            Arc::clone(&cache),
            config.wallet.clone(),
        ));

        let catalog = Arc::new(PgGameCatalog::new(pool.clone()));
        let aggregator = Arc::new(ReqwestAggregatorLauncher::new());
        let sessions = Arc::new(GameSessionEngine::new(
            pool.clone(),
            sessions_repo,
            catalog,
            aggregator,
            Arc::clone(&wallets),
            Arc::clone(&cache),
            config.server.iframe_host.clone(),
        ));

        let aml_context = Arc::new(PgAmlContextProvider::new(pool.clone()));
        let aml_pipeline = Arc::new(AmlPipeline::new(pool.clone(), aml_context, config.aml.clone()));
        let aml_queue = Arc::new(AmlQueue::new(
            aml_pipeline,
            config.reporting.worker_pool_size,
            config.reporting.queue_capacity,
        ));

        let renderer = Arc::new(FilesystemReportRenderer::new(
            config.reporting.storage_path.clone(),
            Box::new(StubCsvBodyRenderer),
        ));
        let reports = Arc::new(ReportingScheduler::new(
            pool.clone(),
            Arc::clone(&cache),
            renderer,
            config.reporting.worker_pool_size,
            config.reporting.queue_capacity,
        ));

        let audit = Arc::new(AuditLogWriter::new(pool.clone(), config.reporting.queue_capacity));

        Ok(Self {
            config: Arc::new(config),
            pool,
            cache,
            admission,
            api_keys,
            partners,
            games,
            wallets,
            wallets_repo,
            transactions_repo,
            sessions,
            aml_queue,
            reports,
            audit,
        })
    }
}
