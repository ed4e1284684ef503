//! Control plane for a fleet of coding-agent instances.

pub mod agent;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod mcp;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
