//! Raw table captures for debugging.
//!
//! Each capture lands in `<prefix>-<device>-<serial>`. The writer remembers
//! the next serial and only bumps it further when that name is already taken,
//! so repeated captures never overwrite each other. Captures are snapshot
//! files and can be replayed with the snapshot transport.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::transport::{Snapshot, TableResult};

#[derive(Debug)]
pub struct CaptureWriter {
    prefix: String,
    serial: AtomicU32,
}

impl CaptureWriter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            serial: AtomicU32::new(0),
        }
    }

    /// Next unused capture path for `device`; reserves its serial.
    pub fn next_path(&self, device: &str) -> PathBuf {
        let mut serial = self.serial.load(Ordering::Relaxed);
        loop {
            let path = PathBuf::from(format!("{}-{}-{}", self.prefix, device, serial));
            serial = serial.wrapping_add(1);
            if !path.exists() {
                self.serial.store(serial, Ordering::Relaxed);
                return path;
            }
        }
    }

    /// Writes the raw table response as a JSON snapshot.
    pub fn write(&self, device: &str, tables: &TableResult) -> io::Result<PathBuf> {
        let path = self.next_path(device);
        let snapshot = Snapshot::from_tables(tables.clone());
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::table::NAME_TABLE;
    use crate::transport::{OidMap, OidValue};
    use tempfile::tempdir;

    #[test]
    fn test_captures_do_not_overwrite() {
        let dir = tempdir().expect("Failed to create temp dir");
        let prefix = dir.path().join("capture");
        let writer = CaptureWriter::new(prefix.to_string_lossy());

        let mut names = OidMap::new();
        names.insert(format!("{}.1", NAME_TABLE), OidValue::from("init"));
        let mut tables = TableResult::new();
        tables.insert(NAME_TABLE.to_string(), names);

        let first = writer.write("dev1", &tables).expect("first capture");
        let second = writer.write("dev1", &tables).expect("second capture");

        assert!(first.to_string_lossy().ends_with("capture-dev1-0"));
        assert!(second.to_string_lossy().ends_with("capture-dev1-1"));

        let replayed = Snapshot::load(&second).expect("capture is a snapshot");
        assert_eq!(replayed.tables, tables);
    }

    #[test]
    fn test_serial_kept_across_writes_and_skips_existing() {
        let dir = tempdir().expect("Failed to create temp dir");
        let prefix = dir.path().join("capture");
        std::fs::write(dir.path().join("capture-dev1-0"), "{}").expect("seed capture");

        let writer = CaptureWriter::new(prefix.to_string_lossy());
        let first = writer.next_path("dev1");
        assert!(first.to_string_lossy().ends_with("capture-dev1-1"));

        // The reserved serial is not handed out again, even though no file
        // was written for it.
        let second = writer.next_path("dev1");
        assert!(second.to_string_lossy().ends_with("capture-dev1-2"));
    }
}
