//! Scenario harness for faultline.
//!
//! This crate provides:
//! - A catalog of in-process fault scenarios (segfaults on a protected page,
//!   raised signals, nested supervision, forced runtime mutation)
//! - A runner that executes them under a chosen disposition and checks that
//!   signal dispositions are left as they were found
//! - Structured JSONL logging and artifact indexing for each run

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::{Expected, Scenario};
