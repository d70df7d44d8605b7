use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Serial transport is not supported on this host: {0}")]
    NoTransportSupport(String),

    #[error("No authorized serial device available: {0}")]
    NoAuthorizedDevice(String),

    #[error("Failed to open serial port: {0}")]
    OpenFailure(String),

    #[error("Serial channel is not open")]
    NotOpen,

    #[error("No device connected")]
    NotConnected,

    #[error("An execution is already in progress on the device")]
    Busy,

    #[error("Timed out after {timeout_ms}ms waiting for {pattern:?}")]
    Timeout { pattern: String, timeout_ms: u64 },

    #[error("Wait for {0:?} was aborted")]
    Aborted(String),

    #[error("Wait for {0:?} was cancelled")]
    Cancelled(String),

    #[error("Failed to read remote file: {0}")]
    ReadFailure(String),

    #[error("Failed to write remote file: {0}")]
    WriteFailure(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Remote operation failed: {0}")]
    RemoteOperationFailure(String),

    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[cfg(feature = "sse")]
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl AppError {
    /// True for failures of the physical link, as opposed to protocol or remote errors.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            AppError::NoTransportSupport(_)
                | AppError::NoAuthorizedDevice(_)
                | AppError::OpenFailure(_)
                | AppError::NotOpen
                | AppError::StdIoError(_)
        )
    }
}

impl From<AppError> for rust_mcp_schema::schema_utils::CallToolError {
    fn from(err: AppError) -> Self {
        tracing::error!("AppError converted to CallToolError: {:?}", err);
        rust_mcp_schema::schema_utils::CallToolError::new(err)
    }
}
