//! Row logger with clean feature flag handling.
//!
//! The controller calls [`SampleLogger::write_row`] once per published poll event. The
//! logger owns header management and the file lifecycle; the controller never looks
//! at the file.
use crate::{
    core::PollEvent,
    error::{AppResult, DaqError},
};

/// Sink for one row per successful poll tick.
pub trait SampleLogger: Send {
    /// Append one row for a published poll event.
    fn write_row(&mut self, event: &PollEvent) -> AppResult<()>;

    /// Flush buffered rows. Called when the logger is replaced or the controller drops it.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Column names written before the access-link channels.
pub const LEADING_COLUMNS: [&str; 5] = ["time", "J1", "J2", "R1", "R2"];

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::path::{Path, PathBuf};

    /// Appends rows `time, J1, J2, R1, R2, <channels...>` to a CSV file.
    pub struct CsvLogWriter {
        path: PathBuf,
        writer: csv::Writer<File>,
        channel_count: usize,
    }

    impl CsvLogWriter {
        /// Open `path` for appending, creating it and its directory if needed.
        ///
        /// The header is written only when the file is new or empty.
        pub fn open(path: impl AsRef<Path>, channel_names: &[String]) -> AppResult<Self> {
            let path = path.as_ref().to_path_buf();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let is_empty = file.metadata()?.len() == 0;

            let mut writer = csv::Writer::from_writer(file);
            if is_empty {
                let header = LEADING_COLUMNS
                    .iter()
                    .copied()
                    .chain(channel_names.iter().map(String::as_str));
                writer.write_record(header).map_err(storage_error)?;
                writer.flush()?;
            }
            tracing::info!("CSV logger writing to '{}'.", path.display());

            Ok(Self {
                path,
                writer,
                channel_count: channel_names.len(),
            })
        }

        /// File the rows go to.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SampleLogger for CsvLogWriter {
        fn write_row(&mut self, event: &PollEvent) -> AppResult<()> {
            let channels = event.access.channels();
            if channels.len() != self.channel_count {
                return Err(DaqError::Storage(format!(
                    "row has {} channels, header has {}",
                    channels.len(),
                    self.channel_count
                )));
            }

            let derived = &event.derived;
            let mut record = Vec::with_capacity(LEADING_COLUMNS.len() + channels.len());
            record.push(event.timestamp.to_rfc3339());
            record.extend(
                [
                    derived.current1,
                    derived.current2,
                    derived.reactivity1,
                    derived.reactivity2,
                ]
                .iter()
                .chain(channels)
                .map(|v| v.to_string()),
            );

            self.writer.write_record(&record).map_err(storage_error)?;
            self.writer.flush()?;
            Ok(())
        }

        fn flush(&mut self) -> AppResult<()> {
            self.writer.flush()?;
            Ok(())
        }
    }

    fn storage_error(err: csv::Error) -> DaqError {
        DaqError::Storage(err.to_string())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::path::Path;

    /// Placeholder when the `storage_csv` feature is disabled.
    pub struct CsvLogWriter;

    impl CsvLogWriter {
        /// Always fails; CSV support is compiled out.
        pub fn open(_path: impl AsRef<Path>, _channel_names: &[String]) -> AppResult<Self> {
            Err(DaqError::Storage(
                "CSV logging not enabled. Rebuild with --features storage_csv".into(),
            ))
        }
    }

    impl SampleLogger for CsvLogWriter {
        fn write_row(&mut self, _event: &PollEvent) -> AppResult<()> {
            Err(DaqError::Storage("CSV logging not enabled".into()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvLogWriter;
#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvLogWriter;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::core::{AccessSample, DerivedSnapshot, ProcessSample};
    use chrono::Utc;
    use std::sync::Arc;

    fn event(channels: Vec<f64>) -> PollEvent {
        let now = Utc::now();
        PollEvent {
            timestamp: now,
            access: Arc::new(AccessSample::new(now, channels)),
            process: Arc::new(ProcessSample::new(now, 2.0, 3.0)),
            derived: DerivedSnapshot {
                current1: 2.0,
                current2: 3.0,
                reactivity1: 0.5,
                reactivity2: 0.25,
            },
        }
    }

    fn names() -> Vec<String> {
        vec!["Tcold".to_string(), "Thot".to_string()]
    }

    #[test]
    fn test_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("run.csv");

        let mut writer = CsvLogWriter::open(&path, &names()).unwrap();
        writer.write_row(&event(vec![280.5, 310.25])).unwrap();
        drop(writer);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,J1,J2,R1,R2,Tcold,Thot");
        assert!(lines[1].ends_with(",2,3,0.5,0.25,280.5,310.25"), "{}", lines[1]);
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");

        for _ in 0..2 {
            let mut writer = CsvLogWriter::open(&path, &names()).unwrap();
            writer.write_row(&event(vec![1.0, 2.0])).unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(text.matches("time,").count(), 1);
    }

    #[test]
    fn test_width_mismatch_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = CsvLogWriter::open(dir.path().join("run.csv"), &names()).unwrap();

        let err = writer.write_row(&event(vec![1.0])).unwrap_err();
        assert!(matches!(err, DaqError::Storage(_)));
    }
}
