//! PostgreSQL access for the record store

pub mod migrations;
pub mod pool;

pub use pool::Database;
