use ulid::Ulid;

use crate::model::{Money, Ms};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("slot [{start}, {end}) is already taken by appointment {appointment_id}")]
    Conflict {
        appointment_id: Ulid,
        start: Ms,
        end: Ms,
    },
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),
    #[error("{0} already exists: {1}")]
    AlreadyExists(&'static str, Ulid),
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("unrecognized provider status: {0:?}")]
    WebhookMapping(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub(crate) fn not_found(what: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound(what, id.to_string())
    }
}
