//! Configuration module
//!
//! Handles loading the relay configuration and resolving projects.

mod project;
mod relay;

pub use project::*;
pub use relay::*;
