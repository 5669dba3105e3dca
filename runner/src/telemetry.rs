mod file;
#[cfg(feature = "sqlite")]
mod sqlite;

use crate::{
    config::TelemetryConfig,
    task::{UnitOutcome, UnitState},
};
#[cfg(test)]
use parking_lot::FairMutex;
#[cfg(test)]
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to write telemetry: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "sqlite")]
    #[error("SQLite telemetry failed: {0}")]
    SQLite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq)]
/// A single phase boundary, `timestamp_rel` is relative to the start of the run
pub struct TimingEntry {
    pub label: String,
    pub tag: String,
    pub timestamp_abs: f64,
    pub timestamp_rel: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitTiming {
    pub uid: String,
    pub name: String,
    pub tag: String,
    pub state: UnitState,
    pub runtime: f64,
}

#[derive(Debug)]
/// All places timing records can be written to
pub enum TelemetrySinks {
    Null,
    File(file::FileSink),
    #[cfg(feature = "sqlite")]
    SQLite(sqlite::SQLiteSink),
    #[cfg(test)]
    Memory(Arc<FairMutex<Vec<TimingEntry>>>),
}

impl TelemetrySinks {
    pub fn load(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        match config {
            TelemetryConfig::None => Ok(Self::Null),
            TelemetryConfig::File { path } => Ok(Self::File(file::FileSink::load(path)?)),
            #[cfg(feature = "sqlite")]
            TelemetryConfig::SQLite { path } => Ok(Self::SQLite(sqlite::SQLiteSink::load(path)?)),
        }
    }

    fn phase(&mut self, entry: &TimingEntry) -> Result<(), TelemetryError> {
        match self {
            Self::Null => Ok(()),
            Self::File(sink) => sink.phase(entry),
            #[cfg(feature = "sqlite")]
            Self::SQLite(sink) => sink.phase(entry),
            #[cfg(test)]
            Self::Memory(entries) => {
                entries.lock().push(entry.clone());
                Ok(())
            }
        }
    }

    fn units(&mut self, units: &[UnitTiming]) -> Result<(), TelemetryError> {
        match self {
            Self::Null => Ok(()),
            Self::File(sink) => sink.units(units),
            #[cfg(feature = "sqlite")]
            Self::SQLite(sink) => sink.units(units),
            #[cfg(test)]
            Self::Memory(_) => Ok(()),
        }
    }

    fn close(self) -> Result<(), TelemetryError> {
        match self {
            Self::File(sink) => sink.close(),
            #[cfg(feature = "sqlite")]
            Self::SQLite(sink) => sink.close(),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
/// Append-only recorder of phase boundaries. Write failures are logged and never abort a run.
pub struct TimingRecorder {
    origin: Instant,
    sink: TelemetrySinks,
}

impl TimingRecorder {
    pub fn new(sink: TelemetrySinks) -> Self {
        Self {
            origin: Instant::now(),
            sink,
        }
    }

    #[cfg(test)]
    pub fn memory() -> (Self, Arc<FairMutex<Vec<TimingEntry>>>) {
        let entries = Arc::new(FairMutex::new(Vec::new()));

        (Self::new(TelemetrySinks::Memory(entries.clone())), entries)
    }

    pub fn start(&mut self, phase: &str, tag: &str) {
        self.mark(format!("{phase}_start"), tag);
    }

    pub fn end(&mut self, phase: &str, tag: &str) {
        self.mark(format!("{phase}_end"), tag);
    }

    fn mark(&mut self, label: String, tag: &str) {
        let timestamp_abs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs_f64())
            .unwrap_or_default();
        let entry = TimingEntry {
            label,
            tag: tag.to_owned(),
            timestamp_abs,
            timestamp_rel: self.origin.elapsed().as_secs_f64(),
        };

        trace!(label = %entry.label, tag = %entry.tag, rel = entry.timestamp_rel, "Phase boundary");

        if let Err(error) = self.sink.phase(&entry) {
            warn!(error = ?error, "Failed to record phase boundary {}: {error}", entry.label);
        }
    }

    /// per unit execution profile of a finished wave
    pub fn units(&mut self, tag: &str, outcomes: &[UnitOutcome]) {
        let units = outcomes
            .iter()
            .map(|outcome| UnitTiming {
                uid: outcome.handle.uid.clone(),
                name: outcome.handle.name.clone(),
                tag: tag.to_owned(),
                state: outcome.state,
                runtime: outcome.runtime.as_secs_f64(),
            })
            .collect::<Vec<_>>();

        if let Err(error) = self.sink.units(&units) {
            warn!(error = ?error, "Failed to record unit timings for {tag}: {error}");
        }
    }

    pub fn close(self) {
        match self.sink.close() {
            Ok(()) => info!("Closed telemetry after {:.3}s", self.origin.elapsed().as_secs_f64()),
            Err(error) => warn!(error = ?error, "Failed to close telemetry: {error}"),
        }
    }
}
