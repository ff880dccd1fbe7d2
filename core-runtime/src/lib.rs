//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the sync core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//! - Cache-aside helper
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the logging conventions, the configuration surface and the
//! event broadcasting mechanism used throughout the system.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
