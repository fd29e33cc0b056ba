//! Session table and message encryption.
//!
//! [`SessionCrypto`] owns one [`ChatSession`] per peer and is the only place
//! ratchet state is mutated. Signatures are always checked before any chain
//! is touched, so a forged envelope leaves the session exactly as it was.

use super::ratchet::{ChatSession, MessageKeys};
use super::stream::{ContentCipher, ContentDecipher};
use crate::crypto::{now_timestamp, short_id, AuthRequest, IdentityProvider};
use crate::transport::{ChatMessage, EncryptedMessage, KeyMessage};
use crate::utils::{CryptoError, Result, SessionError};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Output of [`SessionCrypto::encrypt`]
pub struct Encrypted {
    /// Signed wire envelope
    pub message: EncryptedMessage,
    /// Cipher for the file body when the message announces a file
    pub content_cipher: Option<ContentCipher>,
}

/// Output of a successful [`SessionCrypto::decrypt`]
pub struct Decrypted {
    /// Plaintext message
    pub message: ChatMessage,
    /// Decipher for the file body when the message announces a file
    pub content_decipher: Option<ContentDecipher>,
}

/// Per-peer ratchet sessions bound to one local identity
pub struct SessionCrypto {
    identity: Box<dyn IdentityProvider>,
    sessions: HashMap<String, ChatSession>,
    ratchet_threshold: u32,
}

impl SessionCrypto {
    /// Create an empty session table
    ///
    /// # Arguments
    ///
    /// * `identity` - Long-term keys used to sign and verify
    /// * `ratchet_threshold` - Messages per sending chain before a forced DH step
    pub fn new(identity: Box<dyn IdentityProvider>, ratchet_threshold: u32) -> Self {
        Self {
            identity,
            sessions: HashMap::new(),
            ratchet_threshold: ratchet_threshold.max(1),
        }
    }

    /// Local identity
    pub fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    /// Local identity, for importing or removing peer keys
    pub fn identity_mut(&mut self) -> &mut dyn IdentityProvider {
        self.identity.as_mut()
    }

    /// Returns true if a long-term key is known for `peer_id`
    pub fn knows(&self, peer_id: &str) -> bool {
        self.identity.has_peer(peer_id)
    }

    /// Returns true if a session exists for `peer_id`
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// Borrow the session for `peer_id`
    pub fn session(&self, peer_id: &str) -> Option<&ChatSession> {
        self.sessions.get(peer_id)
    }

    /// Drop the session for `peer_id`
    pub fn remove_session(&mut self, peer_id: &str) -> bool {
        self.sessions.remove(peer_id).is_some()
    }

    /// Signed auth request for the relay
    pub fn auth_request(&self) -> AuthRequest {
        AuthRequest::new(self.identity.as_ref())
    }

    /// Start a fresh session for `peer_id` and return the signed ephemeral key
    ///
    /// Any previous session with the peer is replaced.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if no long-term key is known for the peer
    pub fn init_session(&mut self, peer_id: &str) -> Result<KeyMessage> {
        if !self.knows(peer_id) {
            return Err(SessionError::NotFound {
                session_id: peer_id.to_string(),
            }
            .into());
        }

        let session = ChatSession::new();
        let public_key = hex::encode(session.sending_public_key());
        let timestamp = now_timestamp();
        let signature = hex::encode(
            self.identity
                .sign(&KeyMessage::signing_bytes(&public_key, &timestamp)),
        );

        if self.sessions.insert(peer_id.to_string(), session).is_some() {
            info!("Replaced ratchet session with {}", short_id(peer_id));
        }

        Ok(KeyMessage {
            public_key,
            timestamp,
            signature,
        })
    }

    /// Apply the peer's signed ephemeral key.
    ///
    /// Returns `Ok(false)` without touching the session if the signature does
    /// not verify against the peer's long-term key.
    pub fn start_session(&mut self, peer_id: &str, key: &KeyMessage) -> Result<bool> {
        let verified = hex::decode(&key.signature).map_or(false, |signature| {
            self.identity.verify(
                peer_id,
                &KeyMessage::signing_bytes(&key.public_key, &key.timestamp),
                &signature,
            )
        });
        if !verified {
            warn!("Rejected session key from {}: bad signature", short_id(peer_id));
            return Ok(false);
        }

        let public_key = key.public_key_bytes()?;
        let session = self.session_mut(peer_id)?;
        session.start(public_key)?;
        debug!("Session with {} started", short_id(peer_id));
        Ok(true)
    }

    /// Encrypt `message` for `peer_id`
    ///
    /// # Arguments
    ///
    /// * `peer_id` - Recipient fingerprint
    /// * `message` - Plaintext; for files `content` is the file name
    /// * `is_file` - Also return a stream cipher for the file body
    pub fn encrypt(
        &mut self,
        peer_id: &str,
        message: &ChatMessage,
        is_file: bool,
    ) -> Result<Encrypted> {
        let threshold = self.ratchet_threshold;
        let step = self.session_mut(peer_id)?.next_sending_keys(threshold)?;

        let mut envelope = EncryptedMessage {
            sender: message.sender.clone(),
            content_type: message.content_type,
            timestamp: message.timestamp.clone(),
            id: message.id.clone(),
            content_hash: message.content_hash.clone(),
            public_key: hex::encode(step.public_key),
            previous_counter: step.previous_counter,
            counter: step.counter,
            content: hex::encode(seal(&step.keys, message.content.as_bytes())?),
            signature: None,
        };
        let signature = self.identity.sign(&envelope.serialize_for_signing()?);
        envelope.signature = Some(hex::encode(signature));

        let content_cipher = if is_file {
            Some(ContentCipher::new(&step.keys)?)
        } else {
            None
        };

        Ok(Encrypted {
            message: envelope,
            content_cipher,
        })
    }

    /// Decrypt an envelope from `peer_id`.
    ///
    /// Returns `Ok(None)` if the signature does not verify; no chain is
    /// advanced in that case.
    pub fn decrypt(
        &mut self,
        peer_id: &str,
        envelope: &EncryptedMessage,
        is_file: bool,
    ) -> Result<Option<Decrypted>> {
        if !self.verify_envelope(peer_id, envelope) {
            warn!("Dropped message {} from {}: bad signature", envelope.id, short_id(peer_id));
            return Ok(None);
        }

        let public_key = envelope.public_key_bytes()?;
        let ciphertext = hex::decode(&envelope.content)?;
        let (counter, keys) = self
            .session_mut(peer_id)?
            .next_receiving_keys(public_key)?;
        if counter != envelope.counter {
            warn!(
                "Counter mismatch from {}: expected {}, got {}",
                short_id(peer_id),
                counter,
                envelope.counter
            );
        }

        let content = String::from_utf8(open(&keys, &ciphertext)?).map_err(|_| {
            CryptoError::Decryption {
                reason: "Content is not UTF-8".to_string(),
            }
        })?;
        let content_decipher = if is_file {
            Some(ContentDecipher::new(&keys)?)
        } else {
            None
        };

        Ok(Some(Decrypted {
            message: envelope.to_plaintext(content),
            content_decipher,
        }))
    }

    fn verify_envelope(&self, peer_id: &str, envelope: &EncryptedMessage) -> bool {
        let Some(signature) = envelope.signature.as_deref() else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        envelope
            .serialize_for_signing()
            .map_or(false, |bytes| self.identity.verify(peer_id, &bytes, &signature))
    }

    fn session_mut(&mut self, peer_id: &str) -> Result<&mut ChatSession> {
        self.sessions.get_mut(peer_id).ok_or_else(|| {
            SessionError::NotFound {
                session_id: peer_id.to_string(),
            }
            .into()
        })
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("id", &self.identity.id())
            .field("sessions", &self.sessions.len())
            .field("ratchet_threshold", &self.ratchet_threshold)
            .finish()
    }
}

fn seal(keys: &MessageKeys, plaintext: &[u8]) -> Result<Vec<u8>> {
    ChaCha20Poly1305::new((&keys.encrypt_key).into())
        .encrypt(Nonce::from_slice(&keys.iv[..12]), plaintext)
        .map_err(|_| {
            CryptoError::Encryption {
                reason: "Message encryption failed".to_string(),
            }
            .into()
        })
}

fn open(keys: &MessageKeys, ciphertext: &[u8]) -> Result<Vec<u8>> {
    ChaCha20Poly1305::new((&keys.encrypt_key).into())
        .decrypt(Nonce::from_slice(&keys.iv[..12]), ciphertext)
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "Message decryption failed".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keyring, UserProfile};
    use crate::transport::ContentType;
    use proptest::prelude::*;

    /// Two session tables that know each other and have exchanged keys
    fn connected_pair(threshold: u32) -> (SessionCrypto, SessionCrypto, String, String) {
        let alice_profile = UserProfile::new("Alice".into());
        let bob_profile = UserProfile::new("Bob".into());
        let alice_id = alice_profile.identity.id.clone();
        let bob_id = bob_profile.identity.id.clone();

        let mut alice_keys = Keyring::new(alice_profile.clone());
        alice_keys.add_peer(&bob_profile.identity.public_key).unwrap();
        let mut bob_keys = Keyring::new(bob_profile);
        bob_keys.add_peer(&alice_profile.identity.public_key).unwrap();

        let mut alice = SessionCrypto::new(Box::new(alice_keys), threshold);
        let mut bob = SessionCrypto::new(Box::new(bob_keys), threshold);

        let alice_key = alice.init_session(&bob_id).unwrap();
        let bob_key = bob.init_session(&alice_id).unwrap();
        assert!(alice.start_session(&bob_id, &bob_key).unwrap());
        assert!(bob.start_session(&alice_id, &alice_key).unwrap());

        (alice, bob, alice_id, bob_id)
    }

    fn receiving_counter(crypto: &SessionCrypto, peer: &str, envelope: &EncryptedMessage) -> Option<u32> {
        let key = envelope.public_key_bytes().unwrap();
        crypto
            .session(peer)
            .and_then(|s| s.receiving_chain(&key))
            .and_then(|c| c.counter())
    }

    #[test]
    fn test_round_trip_both_directions() {
        let (mut alice, mut bob, alice_id, bob_id) = connected_pair(10);

        let hello = ChatMessage::text(&alice_id, "hello bob").unwrap();
        let sealed = alice.encrypt(&bob_id, &hello, false).unwrap();
        assert!(sealed.content_cipher.is_none());
        let opened = bob.decrypt(&alice_id, &sealed.message, false).unwrap().unwrap();
        assert_eq!(opened.message, hello);

        let reply = ChatMessage::text(&bob_id, "hi alice").unwrap();
        let sealed = bob.encrypt(&alice_id, &reply, false).unwrap();
        let opened = alice.decrypt(&bob_id, &sealed.message, false).unwrap().unwrap();
        assert_eq!(opened.message, reply);
    }

    #[test]
    fn test_ciphertext_hides_content() {
        let (mut alice, _, alice_id, bob_id) = connected_pair(10);
        let message = ChatMessage::text(&alice_id, "plain words").unwrap();
        let sealed = alice.encrypt(&bob_id, &message, false).unwrap();
        assert!(!sealed.message.content.contains(&hex::encode("plain words")));
    }

    #[test]
    fn test_rekey_after_threshold() {
        let (mut alice, mut bob, alice_id, bob_id) = connected_pair(10);

        let mut keys = Vec::new();
        for i in 0..11 {
            let message = ChatMessage::text(&alice_id, format!("message {i}")).unwrap();
            let sealed = alice.encrypt(&bob_id, &message, false).unwrap();
            let opened = bob.decrypt(&alice_id, &sealed.message, false).unwrap().unwrap();
            assert_eq!(opened.message.content, message.content);
            keys.push(sealed.message.public_key);
        }

        assert!(keys[..10].iter().all(|k| k == &keys[0]));
        assert_ne!(keys[10], keys[9]);
    }

    #[test]
    fn test_forged_signature_leaves_chain_untouched() {
        let (mut alice, mut bob, alice_id, bob_id) = connected_pair(10);

        let first = ChatMessage::text(&alice_id, "first").unwrap();
        let sealed = alice.encrypt(&bob_id, &first, false).unwrap().message;
        bob.decrypt(&alice_id, &sealed, false).unwrap().unwrap();
        assert_eq!(receiving_counter(&bob, &alice_id, &sealed), Some(0));

        let second = ChatMessage::text(&alice_id, "second").unwrap();
        let mut forged = alice.encrypt(&bob_id, &second, false).unwrap().message;
        forged.previous_counter += 7;
        assert!(bob.decrypt(&alice_id, &forged, false).unwrap().is_none());
        assert_eq!(receiving_counter(&bob, &alice_id, &sealed), Some(0));

        let mut unsigned = forged.clone();
        unsigned.signature = None;
        assert!(bob.decrypt(&alice_id, &unsigned, false).unwrap().is_none());
        assert_eq!(receiving_counter(&bob, &alice_id, &sealed), Some(0));
    }

    #[test]
    fn test_signature_from_wrong_peer_rejected() {
        let (mut alice, mut bob, alice_id, bob_id) = connected_pair(10);
        let message = ChatMessage::text(&alice_id, "hi").unwrap();
        let sealed = alice.encrypt(&bob_id, &message, false).unwrap().message;

        // Bob does not know a peer under this id, so nothing verifies.
        assert!(bob.decrypt("someone-else", &sealed, false).unwrap().is_none());
    }

    #[test]
    fn test_bad_session_key_signature_is_ignored() {
        let (_, mut bob, alice_id, _) = connected_pair(10);
        let mallory = SessionCrypto::new(Box::new(Keyring::new(UserProfile::new("M".into()))), 10);

        let forged = KeyMessage {
            public_key: hex::encode([5u8; 32]),
            timestamp: now_timestamp(),
            signature: hex::encode(mallory.identity().sign(b"whatever")),
        };
        assert!(!bob.start_session(&alice_id, &forged).unwrap());
        assert!(bob.session(&alice_id).unwrap().is_started());
    }

    #[test]
    fn test_unknown_peer_cannot_start() {
        let mut crypto = SessionCrypto::new(Box::new(Keyring::new(UserProfile::new("A".into()))), 10);
        assert!(crypto.init_session("nobody").is_err());
        assert!(!crypto.has_session("nobody"));
    }

    #[test]
    fn test_file_message_returns_stream_ciphers() {
        let (mut alice, mut bob, alice_id, bob_id) = connected_pair(10);
        let message = ChatMessage::new(&alice_id, ContentType::File, "notes.txt", Some("ab".repeat(32))).unwrap();

        let sealed = alice.encrypt(&bob_id, &message, true).unwrap();
        let mut cipher = sealed.content_cipher.unwrap();
        let mut body = b"file body".to_vec();
        cipher.update(&mut body).unwrap();
        body.extend_from_slice(&cipher.finalize());

        let opened = bob.decrypt(&alice_id, &sealed.message, true).unwrap().unwrap();
        assert_eq!(opened.message.content, "notes.txt");
        let mut decipher = opened.content_decipher.unwrap();
        let plain = decipher.update(&body).unwrap();
        decipher.finalize().unwrap();
        assert_eq!(plain, b"file body");
    }

    #[test]
    fn test_remove_session() {
        let (mut alice, _, _, bob_id) = connected_pair(10);
        assert!(alice.remove_session(&bob_id));
        assert!(!alice.has_session(&bob_id));
        let message = ChatMessage::text("x", "y").unwrap();
        assert!(alice.encrypt(&bob_id, &message, false).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_round_trip(contents in proptest::collection::vec(".{0,64}", 1..15)) {
            let (mut alice, mut bob, alice_id, bob_id) = connected_pair(4);
            for content in contents {
                let message = ChatMessage::text(&alice_id, content).unwrap();
                let sealed = alice.encrypt(&bob_id, &message, false).unwrap();
                let opened = bob.decrypt(&alice_id, &sealed.message, false).unwrap().unwrap();
                prop_assert_eq!(opened.message, message);
            }
        }
    }
}
