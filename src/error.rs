//! Error types and result definitions for the rustmidea crate.
//! Covers cloud API failures, codec and crypto faults, and LAN transport errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a Midea appliance
/// either directly or through the cloud relay.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MideaError {
    /// Generic non-zero response from the cloud API
    #[error("Midea cloud API error {code} {message}")]
    Cloud { code: u32, message: String },

    /// Credentials were rejected by the cloud
    #[error("Authentication {code} {message}")]
    CloudAuthentication { code: u32, message: String },

    /// Server asked the caller to back off
    #[error("Retry later {code} {message}")]
    RetryLater { code: u32, message: String },

    /// Transport failure or exhausted retry budget while calling `endpoint`
    #[error("{message}")]
    CloudRequest { endpoint: String, message: String },

    /// Standard IO error (network, socket setup, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decrypt a payload (wrong key or not block aligned)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Relay encryption requested before an access token was set
    #[error("Missing access token")]
    MissingAccessToken,

    /// Failed to decode hex or textual data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Frame header, length or appliance type byte did not match
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Response shorter than the fixed minimum for its family
    #[error("Response too short: {len} bytes, need at least {min}")]
    ResponseTooShort { len: usize, min: usize },

    /// Frame checksum mismatch
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// CRC8 check failed for the received frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// Field value outside its layout range
    #[error("Tried to set {field} to invalid value: {value}")]
    InvalidValue { field: String, value: String },

    /// LAN key negotiation failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed v3 (8370) message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Request timed out
    #[error("Timeout waiting for appliance")]
    Timeout,

    /// No usable network could be derived from the scan targets
    #[error("No valid networks to send broadcast to")]
    NoNetworks,

    /// Appliance was neither discovered nor known to the cloud
    #[error("Appliance '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for Midea operations.
pub type Result<T> = std::result::Result<T, MideaError>;

impl From<std::io::Error> for MideaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => MideaError::ConnectionFailed,
            std::io::ErrorKind::TimedOut => MideaError::Timeout,
            _ => MideaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MideaError {
    fn from(err: serde_json::Error) -> Self {
        MideaError::Json(err.to_string())
    }
}

impl From<hex::FromHexError> for MideaError {
    fn from(err: hex::FromHexError) -> Self {
        MideaError::DecodeError(err.to_string())
    }
}

impl MideaError {
    /// Maps a non-zero cloud `errorCode` onto the error taxonomy.
    pub fn from_cloud(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ERR_AUTHENTICATION => MideaError::CloudAuthentication { code, message },
            ERR_RETRY_LATER => MideaError::RetryLater { code, message },
            _ => MideaError::Cloud { code, message },
        }
    }

    pub fn too_many_retries(endpoint: &str) -> Self {
        MideaError::CloudRequest {
            endpoint: endpoint.to_string(),
            message: format!("Too many retries while calling {}", endpoint),
        }
    }

    pub fn request_failed(endpoint: &str, cause: impl std::fmt::Display) -> Self {
        MideaError::CloudRequest {
            endpoint: endpoint.to_string(),
            message: format!("Request error {} while calling {}", cause, endpoint),
        }
    }

    /// Cloud error code, when the error came from a cloud response.
    pub fn code(&self) -> Option<u32> {
        match self {
            MideaError::Cloud { code, .. }
            | MideaError::CloudAuthentication { code, .. }
            | MideaError::RetryLater { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for malformed frames and layout violations.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            MideaError::InvalidHeader(_)
                | MideaError::ResponseTooShort { .. }
                | MideaError::ChecksumMismatch
                | MideaError::CrcMismatch
                | MideaError::InvalidValue { .. }
        )
    }

    /// True for cipher, key and hex failures.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            MideaError::DecryptionFailed
                | MideaError::EncryptionFailed
                | MideaError::MissingAccessToken
                | MideaError::DecodeError(_)
        )
    }

    /// Errors after which the LAN path is considered unavailable and the
    /// cloud relay may be tried instead.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MideaError::Io(_)
                | MideaError::ConnectionFailed
                | MideaError::Timeout
                | MideaError::Authentication(_)
        )
    }
}

// Midea cloud API response codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Success",
    ERR_AUTHENTICATION = 3102 => "Account or password rejected",
    ERR_SESSION_INVALID = 3106 => "Session invalid, login again",
    ERR_FULL_RESTART = 3144 => "Session expired, full restart required",
    ERR_RETRY_LATER = 7610 => "Retry later",
}
