//! `soulwait`: wait until a condition holds inside a browser page.
//!
//! Exposes modules for integration testing

pub mod cli;
pub mod config;
pub mod metrics;

pub use config::{WaitConfig, WaitDefaults};
