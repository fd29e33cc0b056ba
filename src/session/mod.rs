//! Ratchet sessions and message encryption.
//!
//! This module provides the session layer for secure messaging: the per-peer
//! DH + HMAC-chain ratchet, the session table that signs, encrypts and
//! decrypts envelopes, and the stream cipher used for file bodies.

pub mod crypto;
pub mod ratchet;
pub mod stream;

pub use crypto::*;
pub use ratchet::*;
pub use stream::*;
