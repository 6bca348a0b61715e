use serde::{Deserialize, Serialize};

/// RecordStatus is the lifecycle state of a [`crate::Id`]-addressed record,
/// per the transition table owned by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx-support", sqlx(type_name = "record_status", rename_all = "lowercase"))]
pub enum RecordStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
    Invalid,
    Deleted,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Complete | RecordStatus::Cancelled | RecordStatus::Invalid
        )
    }

    pub fn has_open_work(&self) -> bool {
        matches!(self, RecordStatus::Waiting | RecordStatus::Running)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordStatus::Waiting => "waiting",
            RecordStatus::Running => "running",
            RecordStatus::Complete => "complete",
            RecordStatus::Error => "error",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Invalid => "invalid",
            RecordStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// RecordType tags the per-procedure variant of a record, and is what the
/// scheduler dispatches service iteration on (see `ServiceDriver`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx-support", sqlx(type_name = "record_type", rename_all = "lowercase"))]
pub enum RecordType {
    Single,
    Optimization,
    Gridopt,
    Torsion,
    Reaction,
    Neb,
    Manybody,
}

impl RecordType {
    /// Service record types are driven by the iterator (C5) rather than
    /// claimed directly off the task queue (C4).
    pub fn is_service(&self) -> bool {
        !matches!(self, RecordType::Single | RecordType::Optimization)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx-support", sqlx(type_name = "priority", rename_all = "lowercase"))]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx-support", sqlx(type_name = "output_type", rename_all = "lowercase"))]
pub enum OutputType {
    Stdout,
    Stderr,
    Error,
}

/// The wildcard tag sentinel: a manager or task with this tag matches any
/// counterpart tag. Invariant 6 of the data model: `tag` is never null.
pub const ANY_TAG: &str = "*";
