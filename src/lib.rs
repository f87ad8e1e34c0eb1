//! # engine-spine
//!
//! SQLite-backed job/event engine.
//!
//! Accepts asynchronous jobs, tracks their lifecycle, streams ordered events
//! to live subscribers with gap-free replay, fails jobs orphaned by a crash
//! on the next start, and writes an immutable receipt for every job that
//! reaches a terminal state.

pub mod broadcaster;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod receipt;
pub mod stream;
pub mod telemetry;
pub mod workspace;

pub use engine::Engine;
pub use error::{Error, Result};
