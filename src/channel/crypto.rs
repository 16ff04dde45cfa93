//! Channel record encryption
//!
//! Every frame payload is an AES-256-GCM sealed record. The 96-bit nonce is
//! a 4-byte direction tag followed by the 64-bit record sequence number, so
//! a nonce can never repeat under one key and a replayed or reordered
//! record simply fails to open. There is no cleartext mode.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};

/// Which way a record travels; part of the nonce, so the two directions
/// never share nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToGuest,
    GuestToHost,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::HostToGuest => Direction::GuestToHost,
            Direction::GuestToHost => Direction::HostToGuest,
        }
    }

    fn tag(self) -> [u8; 4] {
        match self {
            Direction::HostToGuest => *b"h2g\0",
            Direction::GuestToHost => *b"g2h\0",
        }
    }
}

pub struct ChannelCipher {
    cipher: Aes256Gcm,
}

impl ChannelCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    fn nonce(direction: Direction, sequence: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&direction.tag());
        nonce[4..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    pub fn seal(&self, direction: Direction, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(direction, sequence);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &[] })
            .map_err(|_| Error::Bug("record encryption failed".into()))
    }

    /// Open a record. Failure means a wrong key, a tampered record, or a
    /// sequence mismatch; all of them are authentication failures.
    pub fn open(&self, direction: Direction, sequence: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(direction, sequence);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &[] })
            .map_err(|_| Error::AuthFailed(format!("record {} failed to open", sequence)))
    }
}
