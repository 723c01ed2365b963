#[macro_use]
extern crate log;

/// Connection configuration
pub mod config;

/// Wire events and the framed codec
pub mod proto;

/// Producer and consumer endpoints with their stream state machines
pub mod node;

/// Background task bodies
pub mod jobs;

/// Utilities for easier development
pub mod utils;
