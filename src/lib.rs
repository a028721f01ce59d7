//! Analysis of Chromium JSON traces from clang builds, memory tracers and CPU profilers.
//!
//! Decoding, per-file statistics, call hierarchy reconstruction and the cross-file build report
//! are all pure functions of the trace bytes. [file] and [config] hold the orchestration around
//! them: reading files, caching analyses and batching.

pub mod config;
pub mod file;
pub mod hierarchy;
pub mod json;
pub mod report;
pub mod summary;
pub mod threads;
pub mod timings;
