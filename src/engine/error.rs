use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, ResourceId, Status};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("resource already exists: {0}")]
    DuplicateId(ResourceId),

    #[error("invalid interval [{start}, {end}): end must be after start")]
    InvalidInterval { start: Ms, end: Ms },

    #[error("resource {resource_id} is already held by reservation {held_by} for an overlapping interval")]
    Conflict { resource_id: ResourceId, held_by: Ulid },

    #[error("cannot {op} reservation {id} while it is {from}")]
    InvalidTransition { id: Ulid, from: Status, op: &'static str },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "reservation", id: id.to_string() }
    }

    pub fn resource_not_found(id: &str) -> Self {
        EngineError::NotFound { entity: "resource", id: id.to_string() }
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "P0002",
            EngineError::DuplicateId(_) => "23505",
            EngineError::InvalidInterval { .. } => "22007",
            EngineError::Conflict { .. } => "23P01",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::Validation(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Wal(_) => "58030",
            EngineError::Invariant(_) => "XX000",
        }
    }
}
