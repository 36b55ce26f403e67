//! AutifyME Core: the workflow orchestration engine.
//!
//! Advances business processes through their steps, pauses them for human
//! approval, routes AI steps to interchangeable model providers with
//! cost-aware fallback, and keeps an immutable audit and cost trail.
//!
//! Steps are opaque: the engine sequences, suspends, retries and accounts
//! for them, while a [`StepExecutor`](engine::StepExecutor) supplied by the
//! embedding application does the actual work.
//!
//! Persistence goes through the [`WorkflowStore`](store::WorkflowStore)
//! trait (`MemoryStore` or the SQLite-backed `SqliteStore`).

pub mod approval;
pub mod audit;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod providers;
pub mod retry;
pub mod store;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use engine::WorkflowEngine;
pub use error::EngineError;
pub use store::{MemoryStore, SqliteStore, WorkflowStore};
