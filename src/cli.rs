//! Command-line interfaces for the agent and host binaries.

pub mod agent;
pub mod host;
