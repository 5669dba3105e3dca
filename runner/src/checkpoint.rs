use crate::replica::{CycleCursor, Replica};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to access checkpoint {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize checkpoint: {0}")]
    Serde(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
/// Persisted resumption point: the next cycle step to run and the replicas after the last
/// completed one
pub struct CheckpointRecord {
    pub dimension_index: usize,
    pub current_cycle: usize,
    pub replicas: Vec<Replica>,
}

impl CheckpointRecord {
    pub fn new(cursor: CycleCursor, replicas: &[Replica]) -> Self {
        Self {
            dimension_index: cursor.dim,
            current_cycle: cursor.cycle,
            replicas: replicas.to_vec(),
        }
    }

    pub fn cursor(&self) -> CycleCursor {
        CycleCursor {
            cycle: self.current_cycle,
            dim: self.dimension_index,
        }
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let contents = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let record: Self = serde_yaml::from_str(&contents)?;

        info!(
            cycle = record.current_cycle,
            dim = record.dimension_index,
            replicas = record.replicas.len(),
            "Loaded checkpoint from {path:?}"
        );

        Ok(record)
    }

    /// Write the record next to `path` and rename it into place, a crash never leaves a
    /// partially written checkpoint behind
    pub fn store(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = temporary_path(path);
        let serialized = serde_yaml::to_string(self)?;

        fs::write(&tmp, serialized).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            cycle = self.current_cycle,
            dim = self.dimension_index,
            "Stored checkpoint at {path:?}"
        );

        Ok(())
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut file_name = OsString::from(".");
    file_name.push(path.file_name().unwrap_or_default());
    file_name.push(".tmp");

    path.with_file_name(file_name)
}
