//! Core domain logic for the WagerBridge B2B casino integration platform:
//! the wallet ledger, game session & callback engine, AML analysis
//! pipeline, request-admission layer, reporting scheduler, and the cache
//! and repository layers they all share.
//!
//! This crate is transport-free: it has no knowledge of HTTP, Redis, or
//! Postgres connection setup beyond `sqlx::PgPool`/`sqlx::Transaction` as
//! the ambient persistence handle. Concrete KV/provider/renderer
//! implementations live in `wagerbridge-adapters`.

#![deny(unsafe_code)]

pub mod admission;
pub mod aml;
pub mod cache;
pub mod config;
pub mod error;
pub mod permissions;
pub mod repository;
pub mod reporting;
pub mod security;
pub mod session;
pub mod types;
pub mod wallet;

pub use admission::{AdmissionPipeline, RateLimitDecision};
pub use aml::{AmlContextProvider, AmlPipeline};
pub use cache::{Cached, CacheLayer, KvStore};
pub use config::WagerBridgeConfig;
pub use error::{CoreError, CoreResult};
pub use permissions::{Permission, PermissionSet};
pub use repository::{
    ApiKeyRepository, Filter, FilterSet, FilterValue, GameRepository, GameSessionRepository, Page,
    PartnerRepository, Repository, Sort, SortDirection, TransactionRepository, WalletRepository,
};
pub use reporting::{ReportRenderer, ReportingScheduler};
pub use session::{AggregatorLauncher, GameCatalog, GameSessionEngine, LaunchGameRequest, LaunchGameResponse};
pub use wallet::WalletEngine;
