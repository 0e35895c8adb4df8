use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("API returned non-ok status code {0}")]
    RemoteStatus(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Can't decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Got {0} consecutive errors from the progress endpoint")]
    ErrorBudget(u32),

    #[error("Backup task took too much time")]
    TimeBudget,

    #[error("Backup is not ready: {0}")]
    NotReady(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
