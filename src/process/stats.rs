//! Process groups: one configured matching rule and the PIDs it owns.

use crate::events::Severity;
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::pid::{Pid, WRAP};

/// Digest of an empty argument string.
pub static EMPTY_ARGS_DIGEST: Lazy<String> = Lazy::new(|| md5_hex(""));

/// Lowercase hex MD5 of `s`.
pub fn md5_hex(s: &str) -> String {
    hex::encode(Md5::digest(s.as_bytes()))
}

/// Whether `s` looks like a lowercase hex MD5 digest.
pub fn is_md5(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// One configured process-matching rule, as supplied by the modeler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Stable configuration id, unique per device
    pub id: String,

    /// Modeled name. Rules that match on arguments may carry the argument
    /// fingerprint as a second token: `"<name> <md5>"`.
    #[serde(default)]
    pub name: Option<String>,

    /// Name shown to operators and used as event component
    pub original_name: String,

    /// Pattern searched in the observed command line
    pub regex: String,

    #[serde(default)]
    pub ignore_parameters: bool,

    /// Raise an event when a PID of this group is replaced
    #[serde(default)]
    pub restart: bool,

    #[serde(default = "default_severity")]
    pub severity: Severity,

    /// Event key for this group's status events
    #[serde(default)]
    pub process_class: String,
}

fn default_severity() -> Severity {
    Severity::Warning
}

impl ProcessConfig {
    /// Rule with default flags; mostly useful for tests and generated configs.
    pub fn new(id: &str, name: &str, regex: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            original_name: name.split(' ').next().unwrap_or(name).to_string(),
            regex: regex.to_string(),
            ignore_parameters: false,
            restart: false,
            severity: default_severity(),
            process_class: format!("/Process/{}", id),
        }
    }

    /// Name used in metric paths and logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.original_name)
    }
}

/// Tracker for one process group on one device.
#[derive(Debug, Clone)]
pub struct ProcessStats {
    config: ProcessConfig,
    pattern: Option<Regex>,
    digest: String,
    cpu: u64,
    pids: BTreeMap<u32, Pid>,
}

fn compile(config: &ProcessConfig) -> Option<Regex> {
    match Regex::new(&config.regex) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(
                "Invalid regex {:?} for process {}: {}",
                config.regex, config.original_name, e
            );
            None
        }
    }
}

fn digest_for(config: &ProcessConfig) -> String {
    if !config.ignore_parameters {
        if let Some(name) = &config.name {
            let parts: Vec<&str> = name.split(' ').collect();
            if parts.len() == 2 && !parts[1].is_empty() {
                return parts[1].to_string();
            }
        }
    }
    EMPTY_ARGS_DIGEST.clone()
}

impl ProcessStats {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            pattern: compile(&config),
            digest: digest_for(&config),
            config,
            cpu: 0,
            pids: BTreeMap::new(),
        }
    }

    /// Swaps in a new configuration. Counters and tracked PIDs survive.
    pub fn update(&mut self, config: ProcessConfig) {
        if config.regex != self.config.regex {
            self.pattern = compile(&config);
        }
        self.digest = digest_for(&config);
        self.config = config;
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether the rule matches the observed process.
    ///
    /// With `use_digest` the MD5 of `args` must also equal the group digest.
    pub fn matches(&self, name: Option<&str>, args: &str, use_digest: bool) -> bool {
        let name = match (name, self.config.name.as_ref()) {
            (Some(name), Some(_)) => name,
            _ => return false,
        };
        let pattern = match &self.pattern {
            Some(p) => p,
            None => return false,
        };

        let matched = if self.config.ignore_parameters || args.is_empty() {
            pattern.is_match(name)
        } else {
            pattern.is_match(format!("{} {}", name, args).trim())
        };

        if matched && use_digest && !self.digest.is_empty() {
            return md5_hex(args) == self.digest;
        }
        matched
    }

    /// Whether the rule matches on arguments and carries a fingerprint.
    pub fn has_args_fingerprint(&self) -> bool {
        if self.config.ignore_parameters {
            return false;
        }
        let name = match &self.config.name {
            Some(name) => name,
            None => return false,
        };
        let tokens: Vec<&str> = name.trim().split(' ').collect();
        if tokens.len() < 2 {
            return true; // the empty-args digest stands in
        }
        tokens
            .last()
            .map(|t| is_md5(&t.to_lowercase()))
            .unwrap_or(false)
    }

    /// Records a CPU sample for `pid` and adds its delta to the group total.
    pub fn update_cpu(&mut self, pid: u32, raw: Option<u64>) {
        let tracker = self.pids.entry(pid).or_default();
        if let Some(delta) = tracker.update_cpu(raw) {
            self.cpu = self.cpu.saturating_add(delta) % WRAP;
        }
    }

    pub fn update_memory(&mut self, pid: u32, raw: Option<u64>) {
        self.pids.entry(pid).or_default().update_memory(raw);
    }

    /// Cumulative group CPU counter, bounded by [`WRAP`].
    pub fn cpu(&self) -> u64 {
        self.cpu
    }

    /// Summed memory of all tracked PIDs, saturating at `u64::MAX`.
    pub fn memory(&self) -> u64 {
        self.pids
            .values()
            .filter_map(Pid::memory)
            .fold(0u64, u64::saturating_add)
    }

    /// Number of tracked PIDs holding at least one sample.
    pub fn sampled_pids(&self) -> usize {
        self.pids
            .values()
            .filter(|p| p.cpu().is_some() || p.memory().is_some())
            .count()
    }

    pub fn tracked_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.pids.keys().copied()
    }

    pub fn discard_pid(&mut self, pid: u32) -> Option<Pid> {
        self.pids.remove(&pid)
    }
}
