//! Database-backed operation stores.

pub mod sqlite;

pub use sqlite::{SqliteConfig, SqliteStore};
