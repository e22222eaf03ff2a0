use thiserror::Error;

#[derive(Error, Debug)]
pub enum HpcqError {
    #[error("Missing required env var: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue transport error: {0}")]
    Transport(String),

    #[error("Queue rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Queue API rejected request: {0}")]
    QueueApi(String),

    #[error("Image refresh failed: {0}")]
    ImageRefresh(String),

    #[error("No usable runtime image at {0}")]
    ImageUnavailable(String),

    #[error("Job input invalid: {0}")]
    InvalidInput(String),

    #[error("Failed to launch job process: {0}")]
    LaunchFailed(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HpcqError>;

impl HpcqError {
    /// Process exit code for the CLI: 2 for missing config/credentials,
    /// 3 for transport failures, 4 for image refresh failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            HpcqError::MissingEnv(_) | HpcqError::InvalidConfig(_) => 2,
            HpcqError::Transport(_)
            | HpcqError::RateLimited { .. }
            | HpcqError::QueueApi(_)
            | HpcqError::Http(_) => 3,
            HpcqError::ImageRefresh(_) | HpcqError::ImageUnavailable(_) => 4,
            _ => 1,
        }
    }
}
