use thiserror::Error;

/// Text sent to the remote side when a failure must not leak detail.
pub const GENERIC_FAILURE: &str = "request failed";

/// Custom error types for the SFU server
#[derive(Debug, Error)]
pub enum SfuError {
    /// Protocol errors
    #[error("invalid request data: {0}")]
    InvalidSignalingMessage(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// RPC errors
    #[error("{0}")]
    RequestFailed(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// Signaling precondition errors, surfaced verbatim to the caller
    #[error("There can only be one producer transport for this peer")]
    ProducerTransportExists,

    #[error("There can only be one consumer transport for this peer")]
    ConsumerTransportExists,

    #[error("no producer transport")]
    NoProducerTransport,

    #[error("no consumer transport")]
    NoConsumerTransport,

    #[error("invalid transport id")]
    InvalidTransportId(String),

    #[error("invalid peer")]
    InvalidPeer(String),

    #[error("can not consume from producer")]
    CannotConsume(String),

    #[error("peer has not joined")]
    NotJoined,

    /// Collaborator errors
    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    /// Resource errors
    #[error("could not get any available port after {attempts} attempts")]
    NoAvailablePort { attempts: u32 },

    #[error("no video or audio producer found for peer {0}")]
    MissingProducers(String),

    /// Configuration errors
    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigurationParseFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for Results using SfuError
pub type Result<T> = std::result::Result<T, SfuError>;

impl SfuError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        SfuError::Internal(msg.into())
    }

    /// Helper to create media engine errors
    pub fn media_engine(msg: impl Into<String>) -> Self {
        SfuError::MediaEngine(msg.into())
    }

    /// Helper to create recorder errors
    pub fn recorder(msg: impl Into<String>) -> Self {
        SfuError::Recorder(msg.into())
    }

    /// Whether the caller did something the current peer state does not allow.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SfuError::InvalidSignalingMessage(_)
                | SfuError::UnknownMethod(_)
                | SfuError::ProducerTransportExists
                | SfuError::ConsumerTransportExists
                | SfuError::NoProducerTransport
                | SfuError::NoConsumerTransport
                | SfuError::InvalidTransportId(_)
                | SfuError::InvalidPeer(_)
                | SfuError::CannotConsume(_)
                | SfuError::NotJoined
        )
    }

    /// The message placed in an error Response. Collaborator and internal
    /// failures collapse to [`GENERIC_FAILURE`]; their detail stays in the logs.
    pub fn client_message(&self) -> String {
        if self.is_precondition() {
            self.to_string()
        } else {
            GENERIC_FAILURE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SfuError::InvalidPeer("peer-1".to_string());
        assert_eq!(err.to_string(), "invalid peer");

        let err = SfuError::NoAvailablePort { attempts: 10_000 };
        assert_eq!(
            err.to_string(),
            "could not get any available port after 10000 attempts"
        );
    }

    #[test]
    fn test_error_helpers() {
        let err = SfuError::internal("Something went wrong");
        assert!(matches!(err, SfuError::Internal(_)));

        let err = SfuError::media_engine("router gone");
        assert!(matches!(err, SfuError::MediaEngine(_)));
    }

    #[test]
    fn test_precondition_errors_reach_the_client_verbatim() {
        assert_eq!(
            SfuError::ProducerTransportExists.client_message(),
            "There can only be one producer transport for this peer"
        );
        assert_eq!(
            SfuError::InvalidTransportId("t-9".into()).client_message(),
            "invalid transport id"
        );
    }

    #[test]
    fn test_collaborator_errors_are_generic_for_the_client() {
        let err = SfuError::media_engine("worker crashed at 0xdeadbeef");
        assert_eq!(err.client_message(), GENERIC_FAILURE);
        assert!(!err.is_precondition());
    }
}
