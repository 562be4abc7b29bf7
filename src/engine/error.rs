use ulid::Ulid;

use crate::model::Span;

#[derive(Debug)]
pub enum EngineError {
    /// Missing or malformed input. Never retried.
    Validation(String),
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    /// HARD classification: the requested span cannot be granted.
    Conflict {
        resource_id: Ulid,
        span: Span,
    },
    /// A write would break a referential rule of the store.
    Constraint(String),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::Conflict { resource_id, span } => write!(
                f,
                "resource {resource_id} is unavailable during {span}: already allocated or under hard maintenance"
            ),
            EngineError::Constraint(msg) => write!(f, "invalid data: {msg}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
