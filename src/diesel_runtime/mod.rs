//! Diesel ORM runtime infrastructure
//!
//! Connection pooling for the Postgres-backed recovery audit log.

pub mod database;

pub use database::{Database, DatabaseConfig, Pool, PooledConnection};
