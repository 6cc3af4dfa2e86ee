//! Concrete adapters for the traits `wagerbridge-core` defines: a Redis
//! (or in-memory) [`KvStore`](wagerbridge_core::KvStore), Postgres-backed
//! game/provider catalog lookups with a `reqwest` aggregator launcher, and
//! filesystem-backed report storage.

#![deny(unsafe_code)]

pub mod aml_context;
pub mod kv;
pub mod providers;
pub mod reports;

pub use aml_context::PgAmlContextProvider;
pub use kv::{InMemoryKvStore, RedisKvStore};
pub use providers::{PgGameCatalog, ReqwestAggregatorLauncher};
pub use reports::{FilesystemReportRenderer, ReportBodyRenderer, StubCsvBodyRenderer};
