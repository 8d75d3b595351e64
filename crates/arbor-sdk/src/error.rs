use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("missing default root for tree {0}")]
    MissingDefaultRoot(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("type error: {0}")]
    Type(#[from] arbor_types::TypeError),

    #[error("resolution error: {0}")]
    Resolution(#[from] arbor_refs::ResolutionError),

    #[error("update error: {0}")]
    Update(#[from] arbor_tree::UpdateError),

    #[error("driver error: {0}")]
    Driver(#[from] arbor_driver::DriverError),
}

pub type SdkResult<T> = Result<T, SdkError>;
