//! Router error types

use thiserror::Error;

use crate::cache::CacheError;
use crate::stage::{Direction, StageId};

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("stage {stage} has no {direction} neighbor")]
    MissingNeighbor { stage: String, direction: Direction },

    #[error("stage {0} cannot be its own neighbor")]
    SelfLink(StageId),

    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("core protocol error: {0}")]
    Core(#[from] coapflow_core::Error),
}
