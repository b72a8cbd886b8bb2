//! Worker process supervision.
//!
//! Spawns one headless rendering-engine process per session, leases it a
//! local port for its command endpoint, serialises command delivery
//! through a per-worker [`channel::CommandChannel`], and reclaims workers
//! that die, stop answering, or sit idle.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod ports;
pub mod process;
pub mod runtime;
pub mod transport;

pub use error::WorkerManagerError;
pub use manager::WorkerProcessManager;
