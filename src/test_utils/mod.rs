//! Test utilities: mock implementations of the domain contracts.

pub mod mocks;

pub use mocks::{MemoryStore, MockConfig, MockGateway};
