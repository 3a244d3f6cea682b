//! CSV export of collected samples, behind the `storage_csv` feature.
//!
//! One header row (`time,voltage,current_A`) then one row per sample. Absent
//! values are written as empty cells.

use crate::error::{AppResult, DaqError};
use crate::measurement::Sample;
use std::path::Path;

/// Column names of the exported file.
pub const CSV_HEADER: [&str; 3] = ["time", "voltage", "current_A"];

/// Timestamp layout used in the `time` column.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use tracing::info;

    fn cell(value: Option<f64>) -> String {
        value.map_or(String::new(), |v| v.to_string())
    }

    /// Write `samples` to `path`, replacing any existing file.
    ///
    /// Returns the number of rows written. An empty sample list is refused.
    pub fn write_csv(path: &Path, samples: &[Sample]) -> AppResult<usize> {
        if samples.is_empty() {
            return Err(DaqError::Storage("no samples to save".to_string()));
        }

        let file = File::create(path).map_err(|e| {
            DaqError::Storage(format!("Failed to create CSV file at {}: {e}", path.display()))
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| DaqError::Storage(format!("Failed to write CSV header: {e}")))?;

        for sample in samples {
            writer
                .write_record([
                    sample.timestamp.format(TIME_FORMAT).to_string(),
                    cell(sample.voltage),
                    cell(sample.current),
                ])
                .map_err(|e| DaqError::Storage(format!("Failed to write sample: {e}")))?;
        }
        writer.flush()?;

        info!(rows = samples.len(), path = %path.display(), "Samples saved");
        Ok(samples.len())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// CSV support is compiled out.
    pub fn write_csv(_path: &Path, _samples: &[Sample]) -> AppResult<usize> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::write_csv;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::write_csv;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;

    #[test]
    fn test_rows_with_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        let samples = vec![
            Sample::new(Some(0.5), Some(1.25e-9)),
            Sample::new(None, Some(2e-9)),
        ];

        assert_eq!(write_csv(&path, &samples).unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,voltage,current_A");
        assert!(lines[1].ends_with(",0.5,0.00000000125"));
        assert!(lines[2].ends_with(",,0.000000002"));
    }

    #[test]
    fn test_empty_log_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_csv(&dir.path().join("empty.csv"), &[]);
        assert!(matches!(result, Err(DaqError::Storage(_))));
    }
}
