//! HOST-RESOURCES-MIB process table parsing.

use crate::error::CollectError;
use crate::transport::{OidMap, TableResult};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Root of HOST-RESOURCES-MIB.
pub const HOSTROOT: &str = ".1.3.6.1.2.1.25";
/// `hrSWRunName`
pub const NAME_TABLE: &str = ".1.3.6.1.2.1.25.4.2.1.2";
/// `hrSWRunPath`
pub const PATH_TABLE: &str = ".1.3.6.1.2.1.25.4.2.1.4";
/// `hrSWRunParameters`
pub const ARGS_TABLE: &str = ".1.3.6.1.2.1.25.4.2.1.5";
/// `hrSWRunPerfCPU` prefix, suffixed by the PID
pub const CPU_PREFIX: &str = ".1.3.6.1.2.1.25.5.1.1.1.";
/// `hrSWRunPerfMem` prefix, suffixed by the PID
pub const MEM_PREFIX: &str = ".1.3.6.1.2.1.25.5.1.1.2.";

/// Tables walked by the process scan, in request order.
pub const PROCESS_TABLES: [&str; 3] = [NAME_TABLE, PATH_TABLE, ARGS_TABLE];

pub fn cpu_oid(pid: u32) -> String {
    format!("{}{}", CPU_PREFIX, pid)
}

pub fn mem_oid(pid: u32) -> String {
    format!("{}{}", MEM_PREFIX, pid)
}

/// One observed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub args: String,
}

impl ProcessEntry {
    pub fn new(pid: u32, name: &str, args: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            args: args.to_string(),
        }
    }
}

fn extract(table: Option<&OidMap>) -> BTreeMap<u32, String> {
    let mut rows = BTreeMap::new();
    for (oid, value) in table.into_iter().flatten() {
        let index = oid.rsplit('.').next().unwrap_or_default();
        match index.parse::<u32>() {
            Ok(pid) => {
                rows.insert(pid, value.as_text().trim().to_string());
            }
            Err(_) => warn!("Skipping process table row with bad index {}", oid),
        }
    }
    rows
}

/// Converts the walked name/path/args tables into process entries sorted by
/// PID.
///
/// A path without a backslash replaces the name. An empty or absent name
/// table means the agent does not publish process data.
pub fn parse_process_tables(
    results: &TableResult,
    show_raw: bool,
) -> Result<Vec<ProcessEntry>, CollectError> {
    if show_raw {
        for table in PROCESS_TABLES {
            info!("{} => {:?}", table, results.get(table));
        }
    }

    let names = extract(results.get(NAME_TABLE));
    if names.is_empty() {
        return Err(CollectError::ProtocolUnsupported);
    }
    let paths = extract(results.get(PATH_TABLE));
    let mut args = extract(results.get(ARGS_TABLE));

    Ok(names
        .into_iter()
        .map(|(pid, name)| {
            let name = match paths.get(&pid) {
                Some(path) if !path.is_empty() && !path.contains('\\') => path.clone(),
                _ => name,
            };
            ProcessEntry {
                pid,
                name,
                args: args.remove(&pid).unwrap_or_default(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OidValue;

    fn table(rows: &[(&str, &str, &str)]) -> OidMap {
        rows.iter()
            .map(|(root, pid, v)| (format!("{}.{}", root, pid), OidValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_path_replaces_name() {
        let mut results = TableResult::new();
        results.insert(
            NAME_TABLE.to_string(),
            table(&[(NAME_TABLE, "12", "java"), (NAME_TABLE, "7", "svchost.exe")]),
        );
        results.insert(
            PATH_TABLE.to_string(),
            table(&[
                (PATH_TABLE, "12", "/usr/bin/java "),
                (PATH_TABLE, "7", "C:\\Windows\\svchost.exe"),
            ]),
        );
        results.insert(
            ARGS_TABLE.to_string(),
            table(&[(ARGS_TABLE, "12", " -jar app.jar ")]),
        );

        let procs = parse_process_tables(&results, false).expect("parses");
        assert_eq!(
            procs,
            vec![
                ProcessEntry::new(7, "svchost.exe", ""),
                ProcessEntry::new(12, "/usr/bin/java", "-jar app.jar"),
            ]
        );
    }

    #[test]
    fn test_empty_name_table_is_unsupported() {
        let mut results = TableResult::new();
        results.insert(NAME_TABLE.to_string(), OidMap::new());
        results.insert(PATH_TABLE.to_string(), table(&[(PATH_TABLE, "1", "/sbin/init")]));

        assert!(matches!(
            parse_process_tables(&results, false),
            Err(CollectError::ProtocolUnsupported)
        ));
        assert!(matches!(
            parse_process_tables(&TableResult::new(), true),
            Err(CollectError::ProtocolUnsupported)
        ));
    }

    #[test]
    fn test_bad_index_is_skipped() {
        let mut results = TableResult::new();
        let mut names = table(&[(NAME_TABLE, "3", "init")]);
        names.insert(format!("{}.x", NAME_TABLE), OidValue::from("junk"));
        results.insert(NAME_TABLE.to_string(), names);

        let procs = parse_process_tables(&results, false).expect("parses");
        assert_eq!(procs, vec![ProcessEntry::new(3, "init", "")]);
    }

    #[test]
    fn test_perf_oids() {
        assert_eq!(cpu_oid(42), ".1.3.6.1.2.1.25.5.1.1.1.42");
        assert_eq!(mem_oid(42), ".1.3.6.1.2.1.25.5.1.1.2.42");
        assert!(NAME_TABLE.starts_with(HOSTROOT));
    }
}
