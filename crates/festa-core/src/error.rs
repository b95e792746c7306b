use thiserror::Error;

#[derive(Debug, Error)]
pub enum FestaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FestaError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            FestaError::Config(_) => "CONFIG_ERROR",
            FestaError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FestaError>;
