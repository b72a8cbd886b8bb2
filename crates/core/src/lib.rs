//! Pure domain logic shared by the worker manager and the render queue.
//!
//! Nothing in this crate performs I/O or spawns tasks; it holds the
//! types, state machine, parameter resolution, and command building that
//! both subsystems agree on.

pub mod command;
pub mod env;
pub mod error;
pub mod naming;
pub mod render;
pub mod scheduling;
pub mod types;
