//! Error types and handling for the ratchet messenger.
//!
//! Every component reports failures through [`MessengerError`]. Failures are
//! always scoped to one peer, message or queued task; nothing in the library
//! terminates the process.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Signaling, relay and peer transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Ratchet session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Hex decoding errors on wire fields
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption or authentication failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Signaling, relay and peer transport errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Peer transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// The peer record exists but the transport has not connected
    #[error("Peer not connected: {peer_id}")]
    NotConnected { peer_id: String },

    /// The relay or a background task went away
    #[error("Channel closed: {name}")]
    ChannelClosed { name: String },

    /// Relay refused the client
    #[error("Relay authentication failed: {reason}")]
    Authentication { reason: String },
}

/// Ratchet session errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No session or no long-term key for the peer
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    /// Invalid session state for operation
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },

    /// A message key slot was already used
    #[error("Message key reuse on counter {counter}")]
    KeyReuse { counter: u32 },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Invalid message type for current context
    #[error("Invalid message type: {message_type}")]
    InvalidMessageType { message_type: String },

    /// Received file does not match its announced hash
    #[error("Checksum verification failed")]
    ChecksumMismatch,
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::NotConnected { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
                | Self::Session(SessionError::KeyReuse { .. })
                | Self::Protocol(ProtocolError::ChecksumMismatch)
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for MessengerError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        Self::Crypto(CryptoError::InvalidKey {
            reason: err.to_string(),
        })
    }
}
