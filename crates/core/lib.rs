//! # tq-core - Core types and traits for the task queue
//!
//! This crate provides the core pieces of the tq job queue:
//! - `Job`, `JobId`, `JobStatus` types
//! - `TaskRegistry` for case-insensitive handler lookup
//! - `RetryPolicy` for exponential backoff with jitter
//! - `Storage` trait and the in-memory `MemoryStorage` backend
//! - `Worker` for claiming and executing jobs
//! - Error types

mod config;
mod error;
mod job;
mod memory;
mod reaper;
mod registry;
mod retrier;
mod retry;
mod storage;
mod worker;

// Re-export main types
pub use config::{generate_worker_id, WorkerConfig, WorkerConfigBuilder};
pub use error::{Result, TaskError, TaskResult, TqError};
pub use job::{Job, JobId, JobStatus};
pub use memory::MemoryStorage;
pub use reaper::Reaper;
pub use registry::{RegistrySnapshot, TaskArgs, TaskFn, TaskRegistry};
pub use retrier::requeue_after;
pub use retry::RetryPolicy;
pub use storage::{DeadLetter, DynStorage, SharedStorage, Storage};
pub use worker::{MetricsSnapshot, Worker};

// Re-export dependencies handlers and backends need
pub use async_trait::async_trait;
pub use chrono;
pub use serde_json;
