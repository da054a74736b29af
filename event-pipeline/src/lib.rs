//! Event pipeline service.
//!
//! Consumes raw JSON events from Kafka, drops duplicates through a Postgres dedup table
//! and writes every new event as one JSON object under a partitioned key in S3.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message and hide the chain.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod event;
pub mod kafka;
pub mod metrics_consts;
pub mod quarantine;
pub mod retry;
pub mod server;
pub mod service;
pub mod storage;

pub use coordinator::{BatchCoordinator, BatchResult, BatchSummary, RecordStatus, StreamRecord};
pub use event::{normalize, NormalizedEvent};
