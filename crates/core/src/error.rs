use gridserve_models::{Id, RecordStatus};

/// CoreError enumerates the failure kinds the record/task/service core can
/// produce. Every fallible operation either succeeds atomically or leaves no
/// observable state change; there is no partial-success variant here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },

    #[error("cannot transition {id} from {from} to {to}")]
    InvalidTransition {
        id: Id,
        from: RecordStatus,
        to: RecordStatus,
    },

    #[error("batch of {actual} exceeds the configured limit of {limit}")]
    LimitExceeded { limit: usize, actual: usize },

    #[error("not authenticated")]
    Unauthorized,

    #[error("not permitted: {reason}")]
    Forbidden { reason: String },

    #[error("computation failed: {message}")]
    ComputationFailed { message: String },

    #[error("internal invariant violated: {0}")]
    DeveloperError(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(id: Id, from: RecordStatus, to: RecordStatus) -> Self {
        CoreError::InvalidTransition { id, from, to }
    }

    pub fn developer_error(msg: impl Into<String>) -> Self {
        CoreError::DeveloperError(msg.into())
    }
}
