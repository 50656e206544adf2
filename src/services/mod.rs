//! Business-logic services: the Job Queue, Scheduler, Rate Limiter,
//! Release Selector, Indexer Fanout, Pipeline Executor, and Announce
//! Listeners (spec.md §4).

pub mod announce;
pub mod download;
pub mod indexer;
pub mod job_queue;
pub mod library_sync;
pub mod media_server;
pub mod pipeline;
pub mod quality;
pub mod rate_limiter;
pub mod scheduler;
