//! Infrastructure layer with concrete implementations of domain contracts.

pub mod database;

pub use database::{SqliteConfig, SqliteStore};
