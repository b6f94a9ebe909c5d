//! In-memory request/response log for the proxy dispatcher.
//!
//! Bounded, FIFO-evicting, filterable. Holds no on-disk state; this is
//! a diagnostics aid, not an audit trail, so it is entirely reset on
//! process restart.

pub mod sink;
pub mod types;

pub use sink::{DEFAULT_BODY_CAP_BYTES, LogSink};
pub use types::{NewEntry, RequestLogEntry, RequestLogSummary};
