//! Core library for the TubeCast comment-scheduling engine.
//!
//! TubeCast turns user-defined schedules into a durable stream of
//! comment-post operations across many authenticated accounts, with
//! per-account and per-video constraints, quota accounting, proxy
//! rotation, and a sleep/rotation rhythm that mimics human behavior.

pub mod cache;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod llm;
pub mod queue;
pub mod storage;
pub mod upstream;

pub use error::*;

/// Returns the version of the tubecast-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
