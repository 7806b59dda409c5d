use thiserror::Error;

/// Errors that abort the whole process.
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("broker failure: {0}")]
    Broker(#[from] lapin::Error),
    #[error("the delivery stream closed unexpectedly")]
    ConsumerClosed,
}

/// Why an artifact could not be fetched. The coordinator collapses any of
/// these into a single download failure; the distinction only matters for
/// the logs.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request to {uri} failed: {source}")]
    Request {
        uri: String,
        source: reqwest::Error,
    },
    #[error("{uri} answered {status}")]
    Status {
        uri: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to write artifact to disk: {0}")]
    Io(#[from] std::io::Error),
}
