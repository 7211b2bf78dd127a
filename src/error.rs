use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state format: {0}")]
    InvalidStateFormat(String),

    #[error("Directory walk error: {0}")]
    WalkDir(String),

    #[error("State file not found: {0}")]
    StateNotFound(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl From<std::io::Error> for FilterError {
    fn from(err: std::io::Error) -> Self {
        FilterError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
