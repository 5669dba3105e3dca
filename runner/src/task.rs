use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::BTreeMap, fmt, time::Duration};

/// URL scheme of the shared staging area of an allocation
pub const STAGING_PREFIX: &str = "staging:///";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StagingAction {
    /// move data between the client and the allocation
    Transfer,
    /// copy data inside the allocation
    Copy,
    /// symlink data inside the allocation
    Link,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StagingDirective {
    pub source: String,
    pub target: String,
    pub action: StagingAction,
}

impl StagingDirective {
    pub fn new(source: impl Into<String>, target: impl Into<String>, action: StagingAction) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            action,
        }
    }

    /// copy `item` from the unit sandbox into the staging area
    pub fn to_staging_area(item: &str) -> Self {
        Self::new(item, format!("{STAGING_PREFIX}{item}"), StagingAction::Copy)
    }

    /// copy `item` from the staging area into the unit sandbox
    pub fn from_staging_area(item: &str) -> Self {
        Self::new(format!("{STAGING_PREFIX}{item}"), item, StagingAction::Copy)
    }
}

/// Split a data directive of the form `source > target`. Without an explicit target the
/// file name of the source is used.
pub fn split_directive(item: &str) -> (String, String) {
    match item.split_once('>') {
        Some((source, target)) => (source.trim().to_owned(), target.trim().to_owned()),
        None => {
            let source = item.trim();
            let target = source.rsplit('/').next().unwrap_or(source);

            (source.to_owned(), target.to_owned())
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
/// Everything a backend needs to run one unit of work. Built once per replica and phase and
/// never changed after submission.
pub struct TaskDescriptor {
    pub name: String,
    pub pre_exec: Vec<String>,
    pub executable: String,
    pub arguments: Vec<String>,
    pub post_exec: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub uses_mpi: bool,
    pub cores: usize,
    pub input_staging: Vec<StagingDirective>,
    pub output_staging: Vec<StagingDirective>,
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum UnitState {
    New = 0,
    Scheduled = 1,
    Executing = 2,
    Done = 3,
    Failed = 4,
    Canceled = 5,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Scheduled => "SCHEDULED",
            Self::Executing => "EXECUTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };

        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Reference to a submitted unit, handed out by the backend
pub struct UnitHandle {
    pub uid: String,
    pub name: String,
    /// backend specific location of the unit's working directory
    pub sandbox: String,
}

#[derive(Clone, Debug)]
/// Terminal status of a unit as reported by `Gateway::wait`
pub struct UnitOutcome {
    pub handle: UnitHandle,
    pub state: UnitState,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl UnitOutcome {
    /// last line of stderr, used for compact failure reports
    pub fn stderr_tail(&self) -> &str {
        self.stderr.lines().last().unwrap_or("")
    }
}
