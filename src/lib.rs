//! Photo indexing and face identity resolution.
//!
//! The crate is organised around a durable job pipeline: callers create a job
//! in the SQLite store, split the work into batches and hand each batch to a
//! bounded worker pool. Batches report their tallies back to the store with
//! atomic relative updates, and a completion watcher finalises the job.

pub mod config;
pub mod db;
pub mod faces;
pub mod jobs;
pub mod library;
pub mod logging;
pub mod scanner;

pub use config::Config;
pub use db::Database;
pub use jobs::{JobStatus, JobView, Orchestrator};
