//! Per-peer ratchet state.
//!
//! A [`ChatSession`] combines a Diffie-Hellman ratchet over X25519 ephemeral
//! keys with a symmetric HMAC chain per ephemeral key. Every DH step mixes a
//! fresh shared secret into the root key and opens a new [`Chain`]; every
//! message advances its chain one way, so an old message key cannot be
//! recomputed from a later chain key.

use crate::utils::{CryptoError, Result, SessionError};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::debug;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Size of symmetric keys and ephemeral public keys
pub const KEY_SIZE: usize = 32;

/// HKDF output length of a DH ratchet step: root key then chain key
pub const RATCHET_KEYS_LEN: usize = 64;

/// HKDF output length of a message key expansion
pub const MESSAGE_KEY_LEN: usize = 96;

/// Field size inside an expanded message key
pub const MESSAGE_CHUNK_LEN: usize = 32;

/// HMAC input deriving a message key from a chain key
pub const MESSAGE_KEY_SEED: u8 = 0x01;

/// HMAC input advancing a chain key
pub const CHAIN_KEY_SEED: u8 = 0x02;

/// Salt for the first root key of a session
pub const SESSION_SECRET_LABEL: &[u8] = b"RatchetMessengerSecret";

/// HKDF info for every root/chain derivation
pub const RATCHET_INFO: &[u8] = b"RatchetMessengerRatchet";

/// Salt for message key expansion
pub const MESSAGE_KEY_LABEL: &[u8] = b"RatchetMessengerCrypt";

/// Symmetric key
pub type Key = [u8; KEY_SIZE];

/// Key material for exactly one message or file
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    /// Cipher key
    pub encrypt_key: Key,
    /// Stream authentication key
    pub mac_key: Key,
    /// Nonce material
    pub iv: [u8; MESSAGE_CHUNK_LEN],
}

impl MessageKeys {
    fn expand(message_key: &Key) -> Result<Self> {
        let mut okm = [0u8; MESSAGE_KEY_LEN];
        Hkdf::<Sha256>::new(Some(MESSAGE_KEY_LABEL), message_key)
            .expand(&[], &mut okm)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Message key expansion failed".to_string(),
            })?;

        let mut keys = Self {
            encrypt_key: [0u8; KEY_SIZE],
            mac_key: [0u8; KEY_SIZE],
            iv: [0u8; MESSAGE_CHUNK_LEN],
        };
        let mut chunks = okm.chunks_exact(MESSAGE_CHUNK_LEN);
        for field in [&mut keys.encrypt_key, &mut keys.mac_key, &mut keys.iv] {
            if let Some(chunk) = chunks.next() {
                field.copy_from_slice(chunk);
            }
        }
        okm.zeroize();
        Ok(keys)
    }
}

impl fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKeys([REDACTED])")
    }
}

fn hkdf_split(salt: &[u8], ikm: &[u8]) -> Result<(Key, Key)> {
    let mut okm = [0u8; RATCHET_KEYS_LEN];
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(RATCHET_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation {
            reason: "Root and chain key derivation failed".to_string(),
        })?;

    let mut root_key = [0u8; KEY_SIZE];
    let mut chain_key = [0u8; KEY_SIZE];
    root_key.copy_from_slice(&okm[..KEY_SIZE]);
    chain_key.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();
    Ok((root_key, chain_key))
}

fn hmac(key: &Key, seed: u8) -> Result<Key> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        CryptoError::KeyDerivation {
            reason: "Invalid chain key length".to_string(),
        }
    })?;
    mac.update(&[seed]);

    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// One step of the symmetric chain: `(message key, next chain key)`
pub fn kdf_chain(chain_key: &Key) -> Result<(Key, Key)> {
    Ok((
        hmac(chain_key, MESSAGE_KEY_SEED)?,
        hmac(chain_key, CHAIN_KEY_SEED)?,
    ))
}

/// Symmetric chain bound to one ephemeral public key
pub struct Chain {
    counter: Option<u32>,
    key: Key,
    message_keys: HashMap<u32, Key>,
}

impl Chain {
    fn new(key: Key) -> Self {
        Self {
            counter: None,
            key,
            message_keys: HashMap::new(),
        }
    }

    /// Counter of the last derived message key, `None` before the first
    pub fn counter(&self) -> Option<u32> {
        self.counter
    }

    /// Number of message keys derived on this chain
    pub fn messages(&self) -> u32 {
        self.counter.map_or(0, |c| c + 1)
    }

    /// Current chain key
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Message key stored at `counter`
    pub fn message_key(&self, counter: u32) -> Option<&Key> {
        self.message_keys.get(&counter)
    }

    /// Derive the next message key and advance the chain
    pub fn advance(&mut self) -> Result<(u32, MessageKeys)> {
        let counter = match self.counter {
            None => 0,
            Some(c) => c.checked_add(1).ok_or_else(|| SessionError::InvalidState {
                state: "chain counter exhausted".to_string(),
            })?,
        };
        if self.message_keys.contains_key(&counter) {
            return Err(SessionError::KeyReuse { counter }.into());
        }

        let (message_key, next) = kdf_chain(&self.key)?;
        self.key.zeroize();
        self.key = next;
        self.counter = Some(counter);
        self.message_keys.insert(counter, message_key);

        Ok((counter, MessageKeys::expand(&message_key)?))
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.key.zeroize();
        for key in self.message_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("counter", &self.counter)
            .field("key", &"[REDACTED]")
            .field("message_keys", &self.message_keys.len())
            .finish()
    }
}

struct EphemeralKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeys {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Live DH ratchet state
struct Ratchet {
    sending_keys: EphemeralKeys,
    receiving_key: Option<PublicKey>,
    root_key: Option<Key>,
    previous_counter: u32,
}

/// Result of preparing one outgoing message
#[derive(Debug)]
pub struct SendingKeys {
    /// Ephemeral public key of the sending chain
    pub public_key: [u8; KEY_SIZE],
    /// Final counter of the chain replaced by the last ratchet step
    pub previous_counter: u32,
    /// Position of the message in its chain
    pub counter: u32,
    /// Derived key material
    pub keys: MessageKeys,
}

/// Ratchet session with one peer
pub struct ChatSession {
    current: Ratchet,
    sending: HashMap<[u8; KEY_SIZE], Chain>,
    receiving: HashMap<[u8; KEY_SIZE], Chain>,
}

impl ChatSession {
    /// Fresh session with a new ephemeral key pair and no root key yet
    pub fn new() -> Self {
        Self {
            current: Ratchet {
                sending_keys: EphemeralKeys::generate(),
                receiving_key: None,
                root_key: None,
                previous_counter: 0,
            },
            sending: HashMap::new(),
            receiving: HashMap::new(),
        }
    }

    /// Currently active sending ephemeral public key
    pub fn sending_public_key(&self) -> [u8; KEY_SIZE] {
        self.current.sending_keys.public.to_bytes()
    }

    /// Returns true once the peer's ephemeral key has been applied
    pub fn is_started(&self) -> bool {
        self.current.root_key.is_some()
    }

    /// Final counter of the most recently replaced chain
    pub fn previous_counter(&self) -> u32 {
        self.current.previous_counter
    }

    /// Sending chain for an ephemeral public key
    pub fn sending_chain(&self, public_key: &[u8; KEY_SIZE]) -> Option<&Chain> {
        self.sending.get(public_key)
    }

    /// Receiving chain for a peer ephemeral public key
    pub fn receiving_chain(&self, public_key: &[u8; KEY_SIZE]) -> Option<&Chain> {
        self.receiving.get(public_key)
    }

    /// Derive the first root key from the peer's ephemeral key
    pub fn start(&mut self, peer_public_key: [u8; KEY_SIZE]) -> Result<()> {
        let peer = PublicKey::from(peer_public_key);
        let shared = self.current.sending_keys.secret.diffie_hellman(&peer);
        let (root_key, mut unused) = hkdf_split(SESSION_SECRET_LABEL, shared.as_bytes())?;
        unused.zeroize();

        self.current.root_key = Some(root_key);
        self.current.receiving_key = Some(peer);
        debug!("Ratchet session started");
        Ok(())
    }

    /// Derive keys for the next outgoing message.
    ///
    /// A new sending DH step happens when there is no chain for the active
    /// ephemeral key yet, or once that chain has produced `threshold` keys.
    pub fn next_sending_keys(&mut self, threshold: u32) -> Result<SendingKeys> {
        let active = self.sending_public_key();
        let exhausted = self
            .sending
            .get(&active)
            .map_or(true, |chain| chain.messages() >= threshold);
        let public_key = if exhausted {
            self.ratchet_sending()?
        } else {
            active
        };

        let previous_counter = self.current.previous_counter;
        let chain = self
            .sending
            .get_mut(&public_key)
            .ok_or_else(|| SessionError::InvalidState {
                state: "missing sending chain".to_string(),
            })?;
        let (counter, keys) = chain.advance()?;

        Ok(SendingKeys {
            public_key,
            previous_counter,
            counter,
            keys,
        })
    }

    /// Derive keys for the next message received on the chain of `public_key`,
    /// stepping the DH ratchet if this peer key has not been seen.
    pub fn next_receiving_keys(&mut self, public_key: [u8; KEY_SIZE]) -> Result<(u32, MessageKeys)> {
        if !self.receiving.contains_key(&public_key) {
            self.ratchet_receiving(PublicKey::from(public_key))?;
        }

        self.receiving
            .get_mut(&public_key)
            .ok_or_else(|| SessionError::InvalidState {
                state: "missing receiving chain".to_string(),
            })?
            .advance()
    }

    fn root_key(&self) -> Result<Key> {
        self.current.root_key.ok_or_else(|| {
            SessionError::InvalidState {
                state: "session not started".to_string(),
            }
            .into()
        })
    }

    fn ratchet_sending(&mut self) -> Result<[u8; KEY_SIZE]> {
        let root_key = self.root_key()?;
        let peer = self.current.receiving_key.ok_or_else(|| SessionError::InvalidState {
            state: "no peer ephemeral key".to_string(),
        })?;

        if let Some(counter) = self
            .sending
            .get(&self.sending_public_key())
            .and_then(Chain::counter)
        {
            self.current.previous_counter = counter;
        }
        self.current.sending_keys = EphemeralKeys::generate();

        let shared = self.current.sending_keys.secret.diffie_hellman(&peer);
        let (root_key, chain_key) = hkdf_split(&root_key, shared.as_bytes())?;
        self.current.root_key = Some(root_key);

        let public_key = self.sending_public_key();
        install(&mut self.sending, public_key, Chain::new(chain_key));
        debug!("Sending ratchet step, previous counter {}", self.current.previous_counter);
        Ok(public_key)
    }

    fn ratchet_receiving(&mut self, peer: PublicKey) -> Result<()> {
        let root_key = self.root_key()?;

        if let Some(counter) = self
            .current
            .receiving_key
            .and_then(|key| self.receiving.get(key.as_bytes()))
            .and_then(Chain::counter)
        {
            self.current.previous_counter = counter;
        }
        self.current.receiving_key = Some(peer);

        let shared = self.current.sending_keys.secret.diffie_hellman(&peer);
        let (root_key, chain_key) = hkdf_split(&root_key, shared.as_bytes())?;
        self.current.root_key = Some(root_key);

        install(&mut self.receiving, peer.to_bytes(), Chain::new(chain_key));
        debug!("Receiving ratchet step");
        Ok(())
    }
}

fn install(chains: &mut HashMap<[u8; KEY_SIZE], Chain>, key: [u8; KEY_SIZE], chain: Chain) {
    if chains.insert(key, chain).is_some() {
        debug!("Replaced existing chain");
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(root_key) = self.current.root_key.as_mut() {
            root_key.zeroize();
        }
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("sending_key", &hex::encode(self.sending_public_key()))
            .field("root_key", &"[REDACTED]")
            .field("previous_counter", &self.current.previous_counter)
            .field("sending_chains", &self.sending.len())
            .field("receiving_chains", &self.receiving.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two sessions that have exchanged their initial ephemeral keys
    fn started_pair() -> (ChatSession, ChatSession) {
        let mut alice = ChatSession::new();
        let mut bob = ChatSession::new();
        let alice_key = alice.sending_public_key();
        let bob_key = bob.sending_public_key();
        alice.start(bob_key).unwrap();
        bob.start(alice_key).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_sending_requires_started_session() {
        let mut session = ChatSession::new();
        assert!(!session.is_started());
        assert!(session.next_sending_keys(10).is_err());
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let (mut alice, mut bob) = started_pair();

        for _ in 0..3 {
            let sent = alice.next_sending_keys(10).unwrap();
            let (counter, received) = bob.next_receiving_keys(sent.public_key).unwrap();
            assert_eq!(counter, sent.counter);
            assert_eq!(received.encrypt_key, sent.keys.encrypt_key);
            assert_eq!(received.mac_key, sent.keys.mac_key);
            assert_eq!(received.iv, sent.keys.iv);
        }

        let reply = bob.next_sending_keys(10).unwrap();
        let (_, received) = alice.next_receiving_keys(reply.public_key).unwrap();
        assert_eq!(received.encrypt_key, reply.keys.encrypt_key);
    }

    #[test]
    fn test_first_message_steps_the_ratchet() {
        let (mut alice, _) = started_pair();
        let initial = alice.sending_public_key();

        let sent = alice.next_sending_keys(10).unwrap();
        assert_ne!(sent.public_key, initial);
        assert_eq!(sent.counter, 0);
        assert_eq!(sent.previous_counter, 0);
    }

    #[test]
    fn test_threshold_forces_new_public_key() {
        let (mut alice, mut bob) = started_pair();
        let threshold = 10;

        let first = alice.next_sending_keys(threshold).unwrap();
        bob.next_receiving_keys(first.public_key).unwrap();
        for expected in 1..threshold {
            let sent = alice.next_sending_keys(threshold).unwrap();
            assert_eq!(sent.public_key, first.public_key);
            assert_eq!(sent.counter, expected);
            bob.next_receiving_keys(sent.public_key).unwrap();
        }

        let rotated = alice.next_sending_keys(threshold).unwrap();
        assert_ne!(rotated.public_key, first.public_key);
        assert_eq!(rotated.counter, 0);
        assert_eq!(rotated.previous_counter, threshold - 1);

        let (_, keys) = bob.next_receiving_keys(rotated.public_key).unwrap();
        assert_eq!(keys.encrypt_key, rotated.keys.encrypt_key);
    }

    #[test]
    fn test_message_key_not_recomputable_from_later_chain_key() {
        let (mut alice, _) = started_pair();
        let sent = alice.next_sending_keys(10).unwrap();
        alice.next_sending_keys(10).unwrap();

        let chain = alice.sending_chain(&sent.public_key).unwrap();
        let key_at_0 = *chain.message_key(0).unwrap();
        let key_at_1 = *chain.message_key(1).unwrap();
        let later_chain_key = *chain.key();

        let (next_message_key, next_chain_key) = kdf_chain(&later_chain_key).unwrap();
        for candidate in [later_chain_key, next_message_key, next_chain_key] {
            assert_ne!(candidate, key_at_0);
            assert_ne!(candidate, key_at_1);
        }
    }

    #[test]
    fn test_chain_domain_tags_differ() {
        let (message_key, chain_key) = kdf_chain(&[9u8; KEY_SIZE]).unwrap();
        assert_ne!(message_key, chain_key);
        assert_ne!(MESSAGE_KEY_SEED, CHAIN_KEY_SEED);
    }

    #[test]
    fn test_counter_is_monotonic() {
        let mut chain = Chain::new([1u8; KEY_SIZE]);
        assert_eq!(chain.counter(), None);
        assert_eq!(chain.messages(), 0);
        for expected in 0..5 {
            let (counter, _) = chain.advance().unwrap();
            assert_eq!(counter, expected);
        }
        assert_eq!(chain.messages(), 5);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let (alice, _) = started_pair();
        let debug = format!("{alice:?}");
        assert!(debug.contains("REDACTED"));
    }
}
