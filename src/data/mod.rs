//! Data layer module
//!
//! Persistence behind the [`RelationshipStore`] contract:
//! - Store trait used by the federation core
//! - SQLite implementation
//! - Stored entity models

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::RelationshipStore;

#[cfg(test)]
mod database_test;
