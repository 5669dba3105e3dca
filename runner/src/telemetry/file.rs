use super::{TelemetryError, TimingEntry, UnitTiming};
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

const PHASE_HEADER: &str = "label,tag,timestamp_abs,timestamp_rel";
const UNIT_HEADER: &str = "uid,name,tag,state,runtime";

/// unit timings are kept next to the phase file, `profile.csv` -> `profile.units.csv`
pub fn units_path(path: &Path) -> PathBuf {
    path.with_extension("units.csv")
}

#[derive(Debug)]
/// CSV sink, every record is flushed right away so an aborted run keeps its profile
pub struct FileSink {
    phases: BufWriter<File>,
    units: BufWriter<File>,
}

fn open_append(path: &Path, header: &str) -> Result<BufWriter<File>, TelemetryError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;
    let mut writer = BufWriter::new(file);

    if is_new {
        writeln!(writer, "{header}")?;
        writer.flush()?;
    }

    debug!("Appending telemetry to {path:?}");

    Ok(writer)
}

impl FileSink {
    pub fn load(path: &Path) -> Result<Self, TelemetryError> {
        Ok(Self {
            phases: open_append(path, PHASE_HEADER)?,
            units: open_append(&units_path(path), UNIT_HEADER)?,
        })
    }

    pub fn phase(&mut self, entry: &TimingEntry) -> Result<(), TelemetryError> {
        writeln!(
            self.phases,
            "{},{},{:.6},{:.6}",
            entry.label, entry.tag, entry.timestamp_abs, entry.timestamp_rel
        )?;
        self.phases.flush()?;

        Ok(())
    }

    pub fn units(&mut self, units: &[UnitTiming]) -> Result<(), TelemetryError> {
        for unit in units {
            writeln!(
                self.units,
                "{},{},{},{},{:.3}",
                unit.uid, unit.name, unit.tag, unit.state, unit.runtime
            )?;
        }
        self.units.flush()?;

        Ok(())
    }

    pub fn close(mut self) -> Result<(), TelemetryError> {
        self.phases.flush()?;
        self.units.flush()?;

        Ok(())
    }
}
