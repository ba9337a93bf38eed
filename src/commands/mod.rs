//! CLI command implementations for herakles-process-collector.
//!
//! - `check`: Configuration and snapshot validation
//! - `config`: Configuration file generation
//! - `test`: Collection cycles against snapshots
//! - `generate`: Synthetic snapshot generation

pub mod check;
pub mod config;
pub mod generate;
pub mod test;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use generate::command_generate_snapshot;
pub use test::command_test;
