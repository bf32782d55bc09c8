//! Core types and configuration for the ladder-trader system.
//!
//! This crate provides shared types used across all other crates:
//! - Market data and position lifecycle types (candles, fills, exit reasons)
//! - Exit/cost configuration with ladder validation
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::{CostConfig, ExitConfig, ResolvedLadder, TpLevel};
pub use error::{Error, Result};
pub use types::*;
