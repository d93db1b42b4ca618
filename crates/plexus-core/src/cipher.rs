//! Frame cipher: AES-256-CFB8 with a per-frame SHA-256 checksum.
//!
//! Each direction of a connection owns one cipher whose keystream runs on
//! across frames, and one send counter starting at zero. A sealed frame is
//!
//!   CFB8(plain || SHA-256(counter_le || plain || key)[..8])
//!
//! so a dropped, replayed or reordered frame fails its checksum.

use std::fmt;
use std::slice;

use aes::Aes256;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::SymmetricKey;

pub const CHECKSUM_LEN: usize = 8;

type Cfb8Enc = cfb8::Encryptor<Aes256>;
type Cfb8Dec = cfb8::Decryptor<Aes256>;

fn checksum(counter: u64, plain: &[u8], key: &SymmetricKey) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(counter.to_le_bytes());
    hasher.update(plain);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

// ── Encrypt ───────────────────────────────────────────────────────────────────

pub struct FrameEncryptor {
    cipher: Cfb8Enc,
    key: SymmetricKey,
    counter: u64,
}

impl FrameEncryptor {
    pub fn new(key: &SymmetricKey) -> Self {
        let iv = key.iv();
        Self {
            cipher: Cfb8Enc::new(
                GenericArray::from_slice(key.as_bytes()),
                GenericArray::from_slice(&iv),
            ),
            key: key.clone(),
            counter: 0,
        }
    }

    /// Append the checksum to `plain` and encrypt the result.
    pub fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
        let sum = checksum(self.counter, plain, &self.key);
        self.counter = self.counter.wrapping_add(1);

        let mut out = Vec::with_capacity(plain.len() + CHECKSUM_LEN);
        out.extend_from_slice(plain);
        out.extend_from_slice(&sum);
        // CFB8 has a one-byte block.
        for byte in out.iter_mut() {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
        }
        out
    }

    pub fn frames_sealed(&self) -> u64 {
        self.counter
    }
}

impl fmt::Debug for FrameEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEncryptor")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

// ── Decrypt ───────────────────────────────────────────────────────────────────

pub struct FrameDecryptor {
    cipher: Cfb8Dec,
    key: SymmetricKey,
    counter: u64,
}

impl FrameDecryptor {
    pub fn new(key: &SymmetricKey) -> Self {
        let iv = key.iv();
        Self {
            cipher: Cfb8Dec::new(
                GenericArray::from_slice(key.as_bytes()),
                GenericArray::from_slice(&iv),
            ),
            key: key.clone(),
            counter: 0,
        }
    }

    /// Decrypt a sealed frame and check its checksum. Returns the plain body.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < CHECKSUM_LEN {
            return Err(CipherError::TooShort(sealed.len()));
        }
        let mut buf = sealed.to_vec();
        for byte in buf.iter_mut() {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
        }

        let body_len = buf.len() - CHECKSUM_LEN;
        let expected = checksum(self.counter, &buf[..body_len], &self.key);
        if buf[body_len..] != expected {
            return Err(CipherError::ChecksumMismatch {
                counter: self.counter,
            });
        }
        self.counter = self.counter.wrapping_add(1);
        buf.truncate(body_len);
        Ok(buf)
    }
}

impl fmt::Debug for FrameDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecryptor")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("encrypted frame of {0} bytes is shorter than its checksum")]
    TooShort(usize),

    #[error("checksum mismatch on frame {counter}")]
    ChecksumMismatch { counter: u64 },

    #[error("received an encrypted frame before encryption was enabled")]
    UnexpectedEncrypted,

    #[error("received a plaintext frame after encryption was enabled")]
    UnexpectedPlaintext,
}
