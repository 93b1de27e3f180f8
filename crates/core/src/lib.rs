//! Batch super-resolution for images and videos.
//!
//! A [`job::Job`] is validated up front, handed to an isolated worker process
//! by [`lifecycle::LifecycleController`], and processed there by
//! [`orchestrator::Orchestrator`] through the image and video pipelines.
//! Progress travels back through a single status file
//! ([`progress::ProgressChannel`]).

pub mod config;
pub mod device;
pub mod error;
pub mod inference;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod tiling;
pub mod workspace;
