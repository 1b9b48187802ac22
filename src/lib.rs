//! komagen: generation orchestration for manga panels
//!
//! Drives a remote image generation service from panel requests. Characters stay consistent
//! across panels through reference images and adapters; batches of requests run with bounded
//! concurrency, dependency ordering, retries and cancellation, and every job's progress is
//! recorded in a session that observers can follow.

pub mod character;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod generation;
pub mod logging;
pub mod service;
pub mod session;
pub mod types;
