//! Peer-to-peer wire protocol.
//!
//! Everything sent over a peer transport is a JSON object with a `type`
//! discriminator: `"key"` for the signed ephemeral key that opens a ratchet
//! session and `"message"` for encrypted chat content. File payloads reuse the
//! `"message"` envelope as the label of a dedicated data channel.
//!
//! Binary fields (keys, signatures, ciphertext) are lowercase hex and
//! timestamps are RFC 3339 strings carried verbatim, so signatures computed
//! over the serialized envelope verify byte-for-byte on the other side.

use crate::crypto::{hash, hash_file, now_timestamp};
use crate::utils::{ProtocolError, Result};
use hex::FromHex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Maximum size of a single peer message (1MB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Kind of chat content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Inline UTF-8 text
    Text,
    /// Image streamed over a data channel
    Image,
    /// Arbitrary file streamed over a data channel
    File,
}

impl ContentType {
    /// Wire name, also used as the media sub-directory
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    /// Returns true if the content travels over a data channel
    pub fn is_file(self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Fingerprint of the author
    pub sender: String,
    /// Text, or the file name for file content
    pub content: String,
    /// Kind of content
    pub content_type: ContentType,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// SHA-256 of the message JSON without this field
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// SHA-256 of the file bytes for file content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ChatMessage {
    /// Create a message stamped with the current time and its content id
    pub fn new(
        sender: impl Into<String>,
        content_type: ContentType,
        content: impl Into<String>,
        content_hash: Option<String>,
    ) -> Result<Self> {
        let mut message = Self {
            sender: sender.into(),
            content: content.into(),
            content_type,
            timestamp: now_timestamp(),
            id: String::new(),
            content_hash,
        };
        message.id = hash(&serde_json::to_vec(&message)?);
        Ok(message)
    }

    /// Create a text message
    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Result<Self> {
        Self::new(sender, ContentType::Text, content, None)
    }

    /// Create a file message for `path`. Only the base name travels.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// `ProtocolError::InvalidMessage` if the path has no file name
    pub async fn file(
        sender: impl Into<String>,
        path: &Path,
        content_type: ContentType,
    ) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProtocolError::InvalidMessage {
                reason: format!("no file name in {}", path.display()),
            })?;
        let content_hash = hash_file(path).await?;
        Self::new(sender, content_type, name, Some(content_hash))
    }
}

/// Signed ephemeral public key that opens a ratchet session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMessage {
    /// Hex X25519 public key
    pub public_key: String,
    /// RFC 3339 time of signing
    pub timestamp: String,
    /// Hex Ed25519 signature over `public_key ∥ timestamp`
    pub signature: String,
}

impl KeyMessage {
    /// Bytes covered by the signature
    pub fn signing_bytes(public_key: &str, timestamp: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(public_key.len() + timestamp.len());
        bytes.extend_from_slice(public_key.as_bytes());
        bytes.extend_from_slice(timestamp.as_bytes());
        bytes
    }

    /// Decoded ephemeral public key
    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        <[u8; 32]>::from_hex(&self.public_key).map_err(Into::into)
    }
}

/// Encrypted chat message with ratchet header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    /// Fingerprint of the author
    pub sender: String,
    /// Kind of content
    pub content_type: ContentType,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// Plaintext message id
    pub id: String,
    /// SHA-256 of the file bytes for file content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Hex sending ephemeral public key of the chain this message belongs to
    pub public_key: String,
    /// Final counter of the sender's previous chain
    pub previous_counter: u32,
    /// Position of this message in its chain
    pub counter: u32,
    /// Hex ciphertext of the content
    pub content: String,
    /// Hex Ed25519 signature over the envelope without this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl EncryptedMessage {
    /// Serialize message for signing (without signature field)
    pub fn serialize_for_signing(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).map_err(Into::into)
    }

    /// Decoded ephemeral public key
    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        <[u8; 32]>::from_hex(&self.public_key).map_err(Into::into)
    }

    /// Plaintext message with the given content
    pub fn to_plaintext(&self, content: String) -> ChatMessage {
        ChatMessage {
            sender: self.sender.clone(),
            content,
            content_type: self.content_type,
            timestamp: self.timestamp.clone(),
            id: self.id.clone(),
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Any message exchanged directly between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerMessage {
    /// Ratchet session key
    Key(KeyMessage),
    /// Encrypted content or data channel label
    Message(EncryptedMessage),
}

impl PeerMessage {
    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        if json.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: json.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        Ok(json)
    }

    /// Parse the JSON wire form
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        serde_json::from_slice(bytes).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Wire name of the message type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Message(_) => "message",
        }
    }
}
