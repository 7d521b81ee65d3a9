use thiserror::Error;

/// Errors returned by the telemetry transport boundary.
///
/// Every transport call resolves to success, a retryable error, or a fatal
/// error. Only [`TransportError::Initialization`] is retryable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The attempt failed while initializing but the setup is compatible.
    /// Repeating the same call may succeed.
    #[error("initialization error: {0}")]
    Initialization(String),
    /// The remote side rejected the call (non-zero reject code).
    #[error("rejected with code {code}: {descriptor}")]
    Rejected { code: u16, descriptor: String },
    /// The local link to the relay failed.
    #[error("link error: {0}")]
    Link(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Initialization(_))
    }

    /// The reject code reported by the transport, zero when none applies.
    pub fn reject_code(&self) -> u16 {
        match self {
            TransportError::Rejected { code, .. } => *code,
            _ => 0,
        }
    }
}

/// Fatal outcomes of the connection sequence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("no bonded relay found; plug a relay in over USB and restart")]
    NoRelayBonded,
    #[error("failed to connect to any of {attempted} bonded relay(s)")]
    RelayConnectFailed { attempted: usize },
    #[error("session rejected by implanted device: {0}")]
    SessionRejected(TransportError),
    #[error("{stage} gave up after {attempts} attempt(s)")]
    RetriesExhausted { stage: &'static str, attempts: u32 },
    #[error("connection sequence cancelled")]
    Cancelled,
    #[error("operation requires a connected relay")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(TransportError),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse configuration file '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
