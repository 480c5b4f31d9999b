//! Error types shared across the engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
