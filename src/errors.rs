/// Domain-specific error types for the trading engine.
/// All external failures must be handled. The engine must:
/// - Continue running on recoverable errors (feed gaps, numerical failures)
/// - Halt safely on unrecoverable state corruption
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("feed error: {0}")]
    Feed(String),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Feed(format!("json: {e}"))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::StateCorruption(format!("task join: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
