//! Prediction-market fund backend library
//!
//! Exposes the fund core, venue adapters and HTTP surface for the binary and
//! integration tests.

pub mod api;
pub mod config;
pub mod fund;
pub mod markets;
pub mod middleware;
