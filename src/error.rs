// Error taxonomy shared by the schedule store, the realtime client and the reconciler.

#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    /// Transport or HTTP status failure while fetching the static dataset or one realtime attempt.
    #[error("Download error: {0}")]
    Download(String),
    /// The static archive is missing a table or a required column.
    #[error("Dataset error: {0}")]
    Dataset(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("File error: {0}")]
    File(String),
    #[error("Unknown stop: {0}")]
    UnknownStop(String),
}

impl From<prost::DecodeError> for TransitError {
    fn from(e: prost::DecodeError) -> Self {
        TransitError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransitError>;
