/// Engine error taxonomy.
///
/// Transient fetch failures are retried inside the API client; what escapes
/// here is already past its retry budget. Per-meter isolation is the default
/// propagation policy: only storage-wide write unavailability aborts a run.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("authorization rejected: {0}")]
    Auth(String),
    #[error("tariff resolution failed: {0}")]
    Resolution(String),
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("state store error: {0}")]
    State(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("run deadline exceeded")]
    Deadline,
}

impl IngestError {
    /// True for failures of the partition/state storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, IngestError::Write(_) | IngestError::State(_))
    }
}
