//! Lovebird Shared Types and Utilities
//!
//! This crate contains the types and database helpers shared across the
//! Lovebird billing engine and its worker.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
