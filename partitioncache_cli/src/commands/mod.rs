//! Subcommand implementations (spec §6 "Command-line surface").

pub mod cache;
pub mod eviction_manager;
pub mod monitor;
pub mod processor;
pub mod queue;
