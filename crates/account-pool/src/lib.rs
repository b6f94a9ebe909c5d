//! Account pool: round-robin selection, health state machine, and
//! request-time OAuth refresh over accounts managed by `account-store`.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{AccountState, Lease, Outcome, Pool, PoolStatus, classify_status};
