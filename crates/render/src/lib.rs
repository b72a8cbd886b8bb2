//! Rendering job queue.
//!
//! Accepts render requests, schedules them by priority under a global
//! concurrency limit and a one-job-per-session rule, drives each job's
//! composite command through a [`backend::RenderBackend`], and retries
//! with degraded parameters before falling back to a synthesized
//! placeholder image.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
mod font;
pub mod job;
pub mod placeholder;
pub mod queue;
pub mod strategy;

pub use error::RenderError;
pub use queue::RenderQueue;
