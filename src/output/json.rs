//! JSON report output writer.
//!
//! Writes profile reports and region dumps to JSON files with proper
//! formatting.

use crate::report::{ProfileReport, RegionDump};
use crate::utils::error::OutputError;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Write a profile report to a JSON file
///
/// **Public** - main entry point for JSON output
///
/// # Errors
/// * `OutputError::WriteFailed` - I/O error during write
/// * `OutputError::SerializationFailed` - JSON serialization error
/// * `OutputError::InvalidPath` - Path cannot be created or is invalid
pub fn write_report(report: &ProfileReport, output_path: impl AsRef<Path>) -> Result<(), OutputError> {
    info!(
        "Writing profile of {} to: {}",
        report.name,
        output_path.as_ref().display()
    );
    write_json(report, output_path.as_ref())
}

/// Write a region dump to a JSON file
///
/// **Public** - used by the `dump` command
pub fn write_dump(dump: &RegionDump, output_path: impl AsRef<Path>) -> Result<(), OutputError> {
    info!(
        "Writing dump of {} chunks to: {}",
        dump.chunks.len(),
        output_path.as_ref().display()
    );
    write_json(dump, output_path.as_ref())
}

/// Read a profile report from a JSON file
///
/// # Errors
/// * `OutputError::WriteFailed` - File read error (reusing WriteFailed for I/O)
/// * `OutputError::SerializationFailed` - JSON parse error
pub fn read_report(input_path: impl AsRef<Path>) -> Result<ProfileReport, OutputError> {
    let report: ProfileReport = read_json(input_path.as_ref())?;
    debug!("Report loaded: version {}, unit {}", report.version, report.name);
    Ok(report)
}

pub fn read_dump(input_path: impl AsRef<Path>) -> Result<RegionDump, OutputError> {
    let dump: RegionDump = read_json(input_path.as_ref())?;
    debug!("Dump loaded: version {}, {} chunks", dump.version, dump.chunks.len());
    Ok(dump)
}

fn write_json<T: Serialize>(value: &T, output_path: &Path) -> Result<(), OutputError> {
    // Validate path
    validate_output_path(output_path)?;

    // Create parent directories if needed
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating parent directories: {}", parent.display());
            std::fs::create_dir_all(parent).map_err(|e| {
                OutputError::InvalidPath(format!("Cannot create directory {}: {}", parent.display(), e))
            })?;
        }
    }

    let file = File::create(output_path).map_err(OutputError::WriteFailed)?;
    let writer = BufWriter::new(file);

    // Serialize to JSON with pretty printing
    serde_json::to_writer_pretty(writer, value).map_err(OutputError::SerializationFailed)?;

    info!(
        "Written successfully ({} bytes)",
        calculate_file_size(output_path)
    );
    Ok(())
}

fn read_json<T: DeserializeOwned>(input_path: &Path) -> Result<T, OutputError> {
    debug!("Reading JSON from: {}", input_path.display());

    let file = File::open(input_path).map_err(OutputError::WriteFailed)?;
    let value = serde_json::from_reader(BufReader::new(file)).map_err(OutputError::SerializationFailed)?;
    Ok(value)
}

/// Validate that output path is writable
///
/// **Private** - internal validation
fn validate_output_path(path: &Path) -> Result<(), OutputError> {
    if path.as_os_str().is_empty() {
        return Err(OutputError::InvalidPath("Path is empty".to_string()));
    }

    // Check if we're trying to overwrite a directory
    if path.is_dir() {
        return Err(OutputError::InvalidPath(format!(
            "Path is a directory: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Calculate file size in bytes
///
/// **Private** - internal utility
fn calculate_file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageCounts, CoverageReport};
    use crate::report::StatementRow;
    use crate::store::RegionInfo;
    use tempfile::NamedTempFile;

    fn create_test_report() -> ProfileReport {
        let counts = CoverageCounts {
            statements: 2,
            executed_statements: 1,
            branches: 0,
            executed_branches: 0,
            anomalies: 0,
        };

        ProfileReport {
            version: "1.0.0".to_string(),
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            unit_id: 7,
            owner_db_id: 1,
            name: "test_fn".to_string(),
            statements: vec![StatementRow {
                natural_id: 1,
                parent_natural_id: Some(0),
                block_label: Some("body".to_string()),
                block_num: 1,
                line_number: 3,
                statement_kind: "RETURN".to_string(),
                exec_count: 4,
                exec_count_err: 0,
                total_time_us: 12,
                max_time_us: 5,
                rows: 0,
                query_fingerprint: None,
            }],
            lines: Vec::new(),
            coverage: CoverageReport {
                unit_id: 7,
                name: "test_fn".to_string(),
                counts,
                statement_ratio: 0.5,
                branch_ratio: 1.0,
            },
            summary: None,
        }
    }

    #[test]
    fn test_write_and_read_report() {
        let report = create_test_report();
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        write_report(&report, path).unwrap();
        let loaded = read_report(path).unwrap();

        assert_eq!(loaded.version, report.version);
        assert_eq!(loaded.statements, report.statements);
        assert_eq!(loaded.coverage, report.coverage);
        assert!(loaded.lines.is_empty());
    }

    #[test]
    fn test_write_and_read_dump() {
        let dump = RegionDump {
            version: "1.0.0".to_string(),
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            info: RegionInfo {
                shared: false,
                format_version: 1,
                capacity: 8,
                used_chunks: 0,
                free_chunks: 8,
                unit_capacity: 4,
                used_units: 0,
            },
            chunks: Vec::new(),
            units: Vec::new(),
        };
        let temp_file = NamedTempFile::new().unwrap();

        write_dump(&dump, temp_file.path()).unwrap();
        let loaded = read_dump(temp_file.path()).unwrap();

        assert_eq!(loaded.info, dump.info);
    }

    #[test]
    fn test_validate_output_path_empty() {
        let result = validate_output_path(Path::new(""));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_output_path_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = validate_output_path(temp_dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested_path = temp_dir.path().join("nested/dirs/report.json");

        write_report(&create_test_report(), &nested_path).unwrap();
        assert!(nested_path.exists());
    }
}
