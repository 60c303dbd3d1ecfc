//! Core types and traits for heartbridge
//!
//! This crate provides the broker abstraction, the cross-context callback
//! scheduler, configuration and logging used by the other heartbridge crates.

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
