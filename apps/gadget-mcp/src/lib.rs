pub mod cluster;
pub mod command;
pub mod config;
pub mod gadget;
pub mod mcp;
pub mod telemetry;
