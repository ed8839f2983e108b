use thiserror::Error;

#[derive(Error, Debug)]
pub enum BriefwireError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Feed parse error: {0}")]
    Feed(String),

    #[error("Feed already registered: {0}")]
    DuplicateFeed(String),

    #[error("No feed matches '{0}'")]
    FeedNotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("A run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
