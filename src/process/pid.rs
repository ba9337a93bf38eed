//! Per-PID counter tracking with 32-bit wraparound handling.

use crate::transport::OidValue;
use tracing::warn;

/// Bound of the host-resources CPU counter (`hrSWRunPerfCPU`).
pub const WRAP: u64 = 0xffff_ffff;

/// Last raw CPU and memory samples seen for one process id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pid {
    cpu: Option<u64>,
    memory: Option<u64>,
}

impl Pid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last raw CPU counter value.
    pub fn cpu(&self) -> Option<u64> {
        self.cpu
    }

    /// Last memory gauge value (KiB as reported by the agent).
    pub fn memory(&self) -> Option<u64> {
        self.memory
    }

    /// Records a new CPU counter sample and returns the increment since the
    /// previous one.
    ///
    /// Returns `None` for the first sample, an absent sample, or a decrease
    /// that does not look like a wrap (the counter was reset). A reset re-seeds
    /// the tracker so the next sample yields a delta again. An absent sample
    /// clears the prior value, so the sample after it only seeds.
    pub fn update_cpu(&mut self, raw: Option<u64>) -> Option<u64> {
        let new = match raw {
            Some(n) => n,
            None => {
                self.cpu = None;
                return None;
            }
        };

        let delta = match self.cpu {
            None => None,
            Some(prior) if new >= prior => Some(new - prior),
            Some(prior) => {
                let wrapped = WRAP.saturating_sub(prior).saturating_add(new);
                if wrapped < WRAP / 2 {
                    Some(wrapped)
                } else {
                    None
                }
            }
        };

        self.cpu = Some(new);
        delta
    }

    /// Replaces the memory gauge. An absent sample clears it.
    pub fn update_memory(&mut self, raw: Option<u64>) {
        self.memory = raw;
    }
}

/// Interprets a raw protocol value as a counter.
///
/// The host-resources perf columns are 32-bit. Unparsable values and values
/// beyond that range are logged and treated as absent.
pub fn counter_value(oid: &str, value: Option<&OidValue>) -> Option<u64> {
    let value = value?;
    match value.as_u64() {
        Some(n) if n <= WRAP => Some(n),
        Some(_) => {
            warn!("Ignoring out-of-range value {} for {}", value, oid);
            None
        }
        None => {
            warn!("Ignoring non-numeric value {} for {}", value, oid);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_has_no_delta() {
        let mut pid = Pid::new();
        assert_eq!(pid.update_cpu(Some(100)), None);
        assert_eq!(pid.cpu(), Some(100));
    }

    #[test]
    fn test_increasing_counter() {
        let mut pid = Pid::new();
        pid.update_cpu(Some(100));
        assert_eq!(pid.update_cpu(Some(150)), Some(50));
        assert_eq!(pid.update_cpu(Some(150)), Some(0));
    }

    #[test]
    fn test_wraparound_delta() {
        let mut pid = Pid::new();
        pid.update_cpu(Some(WRAP - 10));
        assert_eq!(pid.update_cpu(Some(5)), Some(15));
        assert_eq!(pid.cpu(), Some(5));
    }

    #[test]
    fn test_counter_reset_yields_no_delta_then_recovers() {
        let mut pid = Pid::new();
        pid.update_cpu(Some(1_000_000));
        assert_eq!(pid.update_cpu(Some(10)), None);
        assert_eq!(pid.update_cpu(Some(30)), Some(20));
    }

    #[test]
    fn test_absent_sample_clears_prior() {
        let mut pid = Pid::new();
        pid.update_cpu(Some(40));
        assert_eq!(pid.update_cpu(None), None);
        assert_eq!(pid.cpu(), None);
        assert_eq!(pid.update_cpu(Some(90)), None);
        assert_eq!(pid.update_cpu(Some(95)), Some(5));
    }

    #[test]
    fn test_counter_value_parsing() {
        assert_eq!(counter_value(".1", Some(&OidValue::Integer(7))), Some(7));
        assert_eq!(counter_value(".1", Some(&OidValue::from("12"))), Some(12));
        assert_eq!(counter_value(".1", Some(&OidValue::from("abc"))), None);
        assert_eq!(counter_value(".1", None), None);
    }

    #[test]
    fn test_counter_value_beyond_32_bits_is_absent() {
        assert_eq!(counter_value(".1", Some(&OidValue::Integer(WRAP as i64))), Some(WRAP));
        assert_eq!(counter_value(".1", Some(&OidValue::Integer(WRAP as i64 + 1))), None);
        assert_eq!(counter_value(".1", Some(&OidValue::from("18014398509481985"))), None);
    }
}
