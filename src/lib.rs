//! media-jobs - Concurrent media processing pipeline
//!
//! Queues transcoding requests, runs them through ffmpeg on a bounded worker
//! pool with deadlines, cancellation and retries, and de-duplicates identical
//! work through a persistent result cache.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
