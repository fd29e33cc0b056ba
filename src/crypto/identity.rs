//! Identity management and Ed25519 cryptographic operations.
//!
//! Each user owns one long-term Ed25519 key pair. Peers address each other by
//! the key's fingerprint: the lowercase hex SHA-256 of the 32-byte public key.

use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// File name of the public profile inside the keys directory
pub const PROFILE_FILE: &str = "profile.json";

/// File name of the raw secret key inside the keys directory
pub const PRIVATE_KEY_FILE: &str = "private_key";

/// Compute the peer id for a long-term public key
///
/// # Example
///
/// ```rust
/// use ratchet_messenger::crypto::{fingerprint, IdentityKeyPair};
///
/// let keypair = IdentityKeyPair::generate();
/// assert_eq!(fingerprint(&keypair.public_key_bytes()).len(), 64);
/// ```
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Leading eight characters of an id, for logs. Never splits a character.
///
/// ```rust
/// use ratchet_messenger::crypto::short_id;
///
/// assert_eq!(short_id("0123456789abcdef"), "01234567");
/// assert_eq!(short_id("abc"), "abc");
/// ```
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}

/// Ed25519 key pair for cryptographic identity operations
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create an identity key pair from a secret key
    ///
    /// # Arguments
    ///
    /// * `secret_bytes` - 32-byte secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key is invalid
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SECRET_KEY_LENGTH] =
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey {
                    reason: format!(
                        "Invalid secret key length: expected {}, got {}",
                        SECRET_KEY_LENGTH,
                        secret_bytes.len()
                    ),
                })?;

        let signing_key = SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SignatureVerification` if the signature is invalid
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_with(&self.verifying_key, message, signature)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

pub(crate) fn verify_with(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let bytes: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;

    key.verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| CryptoError::SignatureVerification.into())
}

/// Public identity information for a user or contact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Fingerprint of the public key
    pub id: String,
    /// Display name for the user
    pub display_name: String,
    /// Ed25519 public key for signature verification
    #[serde(with = "hex::serde")]
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Identity {
    /// Create a new identity from a key pair and display name
    pub fn new(keypair: &IdentityKeyPair, display_name: String) -> Self {
        Self {
            id: keypair.fingerprint(),
            display_name,
            public_key: keypair.public_key_bytes(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Build a contact identity from raw public key bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the bytes are not a valid Ed25519 point
    pub fn from_public_key(public_key: &[u8], display_name: String) -> Result<Self> {
        let public_key: [u8; PUBLIC_KEY_LENGTH] =
            public_key.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid public key length: expected {}, got {}",
                    PUBLIC_KEY_LENGTH,
                    public_key.len()
                ),
            })?;
        VerifyingKey::from_bytes(&public_key)?;

        Ok(Self {
            id: fingerprint(&public_key),
            display_name,
            public_key,
            created_at: chrono::Utc::now(),
        })
    }

    /// Get the verifying key for this identity
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the public key is malformed
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| {
            CryptoError::InvalidKey {
                reason: "Invalid public key in identity".to_string(),
            }
            .into()
        })
    }

    /// Verify a signature against this identity's public key
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_with(&self.verifying_key()?, message, signature)
    }

    /// First eight characters of the fingerprint
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Convert this identity to a JSON string for serialization
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Create an identity from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.short_id())
    }
}

/// Complete user profile including both public identity and private key material
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// The public identity information
    pub identity: Identity,
    /// The private key pair for this user
    pub keypair: IdentityKeyPair,
}

impl UserProfile {
    /// Create a new user profile with a generated key pair
    pub fn new(display_name: String) -> Self {
        let keypair = IdentityKeyPair::generate();
        let identity = Identity::new(&keypair, display_name);

        Self { identity, keypair }
    }

    /// Create a user profile from existing key material
    ///
    /// # Errors
    ///
    /// Returns error if the keypair and identity don't match
    pub fn from_keypair_and_identity(keypair: IdentityKeyPair, identity: Identity) -> Result<Self> {
        if keypair.public_key_bytes() != identity.public_key {
            return Err(CryptoError::InvalidKey {
                reason: "Keypair and identity public keys don't match".to_string(),
            }
            .into());
        }

        Ok(Self { identity, keypair })
    }

    /// Load a profile previously written by [`UserProfile::save`]
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either file is missing, or `CryptoError::InvalidKey`
    /// if the stored key does not match the stored identity
    pub fn load(keys_dir: &Path) -> Result<Self> {
        let identity = Identity::from_json(&std::fs::read_to_string(keys_dir.join(PROFILE_FILE))?)?;
        let keypair = IdentityKeyPair::from_secret_bytes(&std::fs::read(
            keys_dir.join(PRIVATE_KEY_FILE),
        )?)?;

        Self::from_keypair_and_identity(keypair, identity)
    }

    /// Returns true if a profile has been saved in `keys_dir`
    pub fn exists(keys_dir: &Path) -> bool {
        keys_dir.join(PROFILE_FILE).exists() && keys_dir.join(PRIVATE_KEY_FILE).exists()
    }

    /// Write the public profile and the raw secret key into `keys_dir`
    pub fn save(&self, keys_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(keys_dir)?;
        std::fs::write(
            keys_dir.join(PROFILE_FILE),
            serde_json::to_string_pretty(&self.identity)?,
        )?;
        std::fs::write(keys_dir.join(PRIVATE_KEY_FILE), self.export_private_key())?;
        Ok(())
    }

    /// Sign a message with this user's private key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.keypair.sign(message)
    }

    /// Verify a signature against this user's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        self.identity.verify_signature(message, signature)
    }

    /// Export the public identity (safe to share)
    pub fn public_identity(&self) -> &Identity {
        &self.identity
    }

    /// Export the private key material for backup/storage
    pub fn export_private_key(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.keypair.secret_key_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keypair_from_secret() {
        let original = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(&original.secret_key_bytes()).unwrap();

        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
        assert!(IdentityKeyPair::from_secret_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let keypair = IdentityKeyPair::generate();
        let message = b"Hello, world!";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature).is_ok());
        assert!(keypair.verify(b"Hello, universe!", &signature).is_err());
        assert!(keypair.verify(message, &signature[..10]).is_err());
    }

    #[test]
    fn test_short_id_respects_char_boundaries() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
        assert_eq!(short_id("aéééééééé"), "aééééééé");
        assert_eq!(short_id("日本語のピア識別子です"), "日本語のピア識別");
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let keypair = IdentityKeyPair::generate();
        let id = keypair.fingerprint();

        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(id, fingerprint(&keypair.public_key_bytes()));
        assert_ne!(id, IdentityKeyPair::generate().fingerprint());
    }

    #[test]
    fn test_identity_serialization_uses_hex() {
        let keypair = IdentityKeyPair::generate();
        let identity = Identity::new(&keypair, "Bob".to_string());

        let json = identity.to_json().unwrap();
        assert!(json.contains(&hex::encode(keypair.public_key_bytes())));
        assert_eq!(identity, Identity::from_json(&json).unwrap());
    }

    #[test]
    fn test_identity_from_public_key() {
        let keypair = IdentityKeyPair::generate();
        let contact = Identity::from_public_key(&keypair.public_key_bytes(), "Eve".into()).unwrap();

        assert_eq!(contact.id, keypair.fingerprint());
        let signature = keypair.sign(b"hi");
        assert!(contact.verify_signature(b"hi", &signature).is_ok());
        assert!(Identity::from_public_key(&[1, 2, 3], "short".into()).is_err());
    }

    #[test]
    fn test_user_profile_key_mismatch() {
        let keypair1 = IdentityKeyPair::generate();
        let keypair2 = IdentityKeyPair::generate();
        let identity = Identity::new(&keypair1, "Mismatch".to_string());

        assert!(UserProfile::from_keypair_and_identity(keypair2, identity).is_err());
    }

    #[test]
    fn test_profile_save_and_load() {
        let dir = TempDir::new().unwrap();
        assert!(!UserProfile::exists(dir.path()));

        let profile = UserProfile::new("Charlie".to_string());
        profile.save(dir.path()).unwrap();
        assert!(UserProfile::exists(dir.path()));

        let loaded = UserProfile::load(dir.path()).unwrap();
        assert_eq!(loaded.identity, profile.identity);
        let signature = loaded.sign(b"payload");
        assert!(profile.verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keypair = IdentityKeyPair::generate();
        let debug = format!("{keypair:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(keypair.secret_key_bytes())));
    }
}
