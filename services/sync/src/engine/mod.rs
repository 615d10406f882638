//! Incremental sync engine: watermark, change-set fetch, mapping, reconciliation and upsert.

pub mod catalog;
pub mod fetcher;
pub mod mapper;
pub mod orchestrator;
pub mod reconciler;
pub mod summary;
pub mod upsert;
pub mod watermark;

pub use orchestrator::SyncOrchestrator;
pub use summary::{RunStatus, RunSummary};
