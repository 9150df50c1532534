//! Postgres-backed persistence layer: connection pooling, migrations, row
//! models, and one query module per table/concept.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
