//! Crawler execution engine: state machines, operation queues, dedup,
//! worker pool, and scheduling.
//!
//! This crate ties the storage backend and the stage handlers into
//! end-to-end crawler runs:
//! - [`Registry`] — loads definitions and indexes crawlers by name
//! - [`Crawler`] — the per-crawler state machine and its counters
//! - [`WorkerPool`] — concurrent executors draining the queues
//! - [`Scheduler`] — starts runs for due crawlers

pub mod crawler;
pub mod dedup;
pub mod definition;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use crawler::Crawler;
pub use dedup::DedupStore;
pub use definition::{CrawlerDefinition, StageDef};
pub use queue::OperationQueue;
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use worker::WorkerPool;
