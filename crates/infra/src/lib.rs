//! Infrastructure layer: Postgres queue storage, the Elasticsearch apply
//! adapter, and configuration.

pub mod config;
pub mod postgres;
pub mod search;

pub use config::Settings;
pub use postgres::{PostgresDeadLetterStore, PostgresTaskStore};
pub use search::ElasticsearchProjection;
