//! replay-review library crate.
//!
//! Renders recorded browser sessions to video, analyzes them, and rolls the
//! analyses up per user and per group. The `replay-review` binary drives
//! these modules; they are exposed here for integration testing.

pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod logging;
pub mod render;
pub mod rollup;
pub mod services;
pub mod slots;
pub mod source;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
