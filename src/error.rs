use crate::sink::SinkError;

/// Failures that stop a run before any page is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("could not load configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("could not open output store: {0}")]
    Sink(#[from] SinkError),
    #[error("could not start the browser: {0}")]
    Browser(String),
    #[error("could not determine the page count for {url}: {reason}")]
    Discovery { url: String, reason: String },
}
