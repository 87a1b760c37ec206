//! Error types for Syndicast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_) => 3,
            SyndicastError::Platform(PlatformError::Authentication(_)) => 2,
            SyndicastError::Platform(_) => 1,
            SyndicastError::Config(_) => 1,
            SyndicastError::Database(_) => 1,
            SyndicastError::Media(_) => 1,
            SyndicastError::Job(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Row not found: {0}")]
    NotFound(String),
}

/// Errors raised at the platform adapter boundary.
///
/// Adapters convert these into failed `PostResult`s before they reach the
/// delivery worker; only credential refresh and setup paths surface them
/// directly.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No App credentials found for provider {0}")]
    MissingAppCredentials(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Publishing failed: {0}")]
    Publish(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("File type not supported: {0}")]
    UnsupportedType(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job payload could not be decoded: {0}")]
    Payload(String),

    #[error("Job {kind} failed after {attempts} attempt(s): {message}")]
    Exhausted {
        kind: String,
        attempts: u32,
        message: String,
    },

    #[error("Job exceeded its maximum duration of {0}s")]
    Timeout(u64),

    #[error("No handler registered for job kind: {0}")]
    NoHandler(String),
}
