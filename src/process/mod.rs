//! Process inventory: counters, groups, table parsing and reconciliation.
//!
//! This module provides:
//! - `pid`: per-PID CPU/memory samples with wraparound-aware deltas
//! - `stats`: configured process groups and their matching rules
//! - `table`: HOST-RESOURCES-MIB table constants and parsing
//! - `reconcile`: attribution of observed PIDs to groups across cycles

pub mod pid;
pub mod reconcile;
pub mod stats;
pub mod table;

// Re-export commonly used types
pub use pid::{counter_value, Pid, WRAP};
pub use reconcile::{reconcile, Reconciliation};
pub use stats::{is_md5, md5_hex, ProcessConfig, ProcessStats, EMPTY_ARGS_DIGEST};
pub use table::{cpu_oid, mem_oid, parse_process_tables, ProcessEntry, PROCESS_TABLES};
