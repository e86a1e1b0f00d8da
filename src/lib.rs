//! Asynchronous on-chain operation tracker.
//!
//! Tracks user-initiated operations whose completion is not synchronous with
//! the request: cross-ledger transfers observed across two independent
//! ledgers, and time-delayed redemption requests that become actionable only
//! after a server-enforced waiting period. Both are long-running state
//! machines with durable persistence, adaptive polling, and explicit retry.
//!
//! The ledger surface is a capability trait ([`domain::LedgerGateway`]);
//! wallet connection, transaction signing, and presentation are external
//! collaborators.

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
