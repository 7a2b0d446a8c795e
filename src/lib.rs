//! BALANCER: equal-weight exchange rebalancing agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod exchange;
pub mod services;
pub mod engine;
