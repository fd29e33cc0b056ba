//! Long-term key lookup for the local user and their contacts.
//!
//! [`IdentityProvider`] is the seam the ratchet layer signs and verifies
//! through. [`Keyring`] is the bundled implementation: the local
//! [`UserProfile`] plus a table of contact identities keyed by fingerprint,
//! optionally persisted as `contacts.json`.

use super::identity::{fingerprint, short_id, Identity, UserProfile};
use crate::utils::{CryptoError, Result};
use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name of the persisted contact table
pub const CONTACTS_FILE: &str = "contacts.json";

/// Signing, verification and public key lookup for one local identity
pub trait IdentityProvider: Send + Sync {
    /// Fingerprint of the local identity
    fn id(&self) -> &str;

    /// Local long-term public key
    fn public_key(&self) -> [u8; 32];

    /// Sign with the local long-term key
    fn sign(&self, message: &[u8]) -> [u8; 64];

    /// Verify a signature made by `peer_id`. Unknown peers never verify.
    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool;

    /// Long-term public key of a known peer
    fn peer_public_key(&self, peer_id: &str) -> Option<[u8; 32]>;

    /// Returns true if a long-term key is known for `peer_id`
    fn has_peer(&self, peer_id: &str) -> bool {
        self.peer_public_key(peer_id).is_some()
    }

    /// Import a peer's long-term public key, returning its fingerprint
    fn add_peer(&mut self, public_key: &[u8]) -> Result<String>;

    /// Forget a peer's key. Returns false if it was unknown.
    fn remove_peer(&mut self, peer_id: &str) -> bool;
}

/// Signed proof of key ownership sent as the first frame to a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Hex long-term public key
    pub public_key: String,
    /// RFC 3339 issue time
    pub timestamp: String,
    /// Hex signature over `timestamp`
    pub signature: String,
}

impl AuthRequest {
    /// Sign a fresh auth request with the given provider
    pub fn new(identity: &dyn IdentityProvider) -> Self {
        let timestamp = now_timestamp();
        Self {
            public_key: hex::encode(identity.public_key()),
            signature: hex::encode(identity.sign(timestamp.as_bytes())),
            timestamp,
        }
    }

    /// Verify the signature and return the fingerprint of the signer
    ///
    /// # Errors
    ///
    /// Returns a hex, key or signature error if the request does not check out
    pub fn verify(&self) -> Result<String> {
        let public_key = hex::decode(&self.public_key)?;
        let identity = Identity::from_public_key(&public_key, String::new())?;
        identity.verify_signature(self.timestamp.as_bytes(), &hex::decode(&self.signature)?)?;
        Ok(identity.id)
    }
}

/// Current time in the wire format used by every signed timestamp
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Local identity plus contact keys
#[derive(Debug)]
pub struct Keyring {
    profile: UserProfile,
    contacts: HashMap<String, Identity>,
    contacts_path: Option<PathBuf>,
}

impl Keyring {
    /// In-memory keyring with no contacts
    pub fn new(profile: UserProfile) -> Self {
        Self {
            profile,
            contacts: HashMap::new(),
            contacts_path: None,
        }
    }

    /// Keyring whose contacts are loaded from and saved to `keys_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if an existing contacts file cannot be parsed
    pub fn open(profile: UserProfile, keys_dir: &Path) -> Result<Self> {
        let path = keys_dir.join(CONTACTS_FILE);
        let contacts = if path.exists() {
            let list: Vec<Identity> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            list.into_iter().map(|c| (c.id.clone(), c)).collect()
        } else {
            HashMap::new()
        };
        debug!("Loaded {} contacts from {}", contacts.len(), path.display());

        Ok(Self {
            profile,
            contacts,
            contacts_path: Some(path),
        })
    }

    /// The local user profile
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Known contacts, in no particular order
    pub fn contacts(&self) -> impl Iterator<Item = &Identity> {
        self.contacts.values()
    }

    /// Import a contact under a display name
    pub fn add_contact(&mut self, public_key: &[u8], display_name: String) -> Result<String> {
        let contact = Identity::from_public_key(public_key, display_name)?;
        if contact.id == self.profile.identity.id {
            return Err(CryptoError::InvalidKey {
                reason: "cannot add own key as a contact".to_string(),
            }
            .into());
        }

        let id = contact.id.clone();
        if self.contacts.insert(id.clone(), contact).is_none() {
            info!("Added contact {}", short_id(&id));
        }
        self.persist()?;
        Ok(id)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.contacts_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut list: Vec<&Identity> = self.contacts.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        std::fs::write(path, serde_json::to_string_pretty(&list)?)?;
        Ok(())
    }
}

impl IdentityProvider for Keyring {
    fn id(&self) -> &str {
        &self.profile.identity.id
    }

    fn public_key(&self) -> [u8; 32] {
        self.profile.identity.public_key
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.profile.sign(message)
    }

    fn verify(&self, peer_id: &str, message: &[u8], signature: &[u8]) -> bool {
        match self.contacts.get(peer_id) {
            Some(contact) => contact.verify_signature(message, signature).is_ok(),
            None => {
                warn!("No key for peer {peer_id}, rejecting signature");
                false
            }
        }
    }

    fn peer_public_key(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.contacts.get(peer_id).map(|c| c.public_key)
    }

    fn add_peer(&mut self, public_key: &[u8]) -> Result<String> {
        let display_name = short_id(&fingerprint(public_key)).to_string();
        self.add_contact(public_key, display_name)
    }

    fn remove_peer(&mut self, peer_id: &str) -> bool {
        let removed = self.contacts.remove(peer_id).is_some();
        if removed {
            if let Err(e) = self.persist() {
                warn!("Failed to persist contacts: {e}");
            }
        }
        removed
    }
}
