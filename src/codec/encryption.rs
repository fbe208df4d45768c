use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashSet;
use tracing::{error, trace};

use crate::error::PipelineError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed payload
pub const ENCRYPTION_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const MIN_DISTINCT_KEY_BYTES: usize = 8;
const MAX_REJECTED_PATTERN_LEN: usize = 8;

/// Rejects keys that can not be used for AES-256, or that are obviously not random (a single
///  repeated character, or a short repeated pattern). This is checked when a configuration is
///  loaded so that a weak key never makes it into a running link.
pub fn validate_key(key: &[u8]) -> anyhow::Result<()> {
    if key.len() != KEY_LEN {
        bail!("encryption key must be exactly {} bytes, was {}", KEY_LEN, key.len());
    }

    let distinct = key.iter().collect::<FxHashSet<_>>().len();
    if distinct < MIN_DISTINCT_KEY_BYTES {
        bail!("encryption key has only {} distinct characters - use a random key", distinct);
    }

    for pattern_len in 1..=MAX_REJECTED_PATTERN_LEN {
        if key.iter().enumerate().all(|(i, b)| *b == key[i % pattern_len]) {
            bail!("encryption key is a repeated pattern of length {} - use a random key", pattern_len);
        }
    }

    Ok(())
}

/// AES-256-GCM sealing of packets. The packet layout is
///
/// ```ascii
///  0: nonce (12 bytes), random per packet
/// 12: ciphertext (same length as plaintext)
///  *: tag (16 bytes)
/// ```
///
/// There is no associated data: the entire payload is encrypted.
pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
}

impl Aes256GcmEncryption {
    pub fn new(key: &[u8]) -> anyhow::Result<Aes256GcmEncryption> {
        validate_key(key)?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow!("invalid AES-256 key length"))?;
        Ok(Aes256GcmEncryption { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, PipelineError> {
        // a nonce must never repeat under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = match self.cipher.encrypt(&nonce, plaintext) {
            Ok(ciphertext) => ciphertext,
            Err(_) => {
                error!("error encrypting buffer of {} bytes", plaintext.len());
                return Err(PipelineError::Encryption);
            }
        };

        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(nonce.as_slice());
        packet.extend_from_slice(&ciphertext);
        trace!("sealed {} plaintext bytes into {} byte packet", plaintext.len(), packet.len());
        Ok(packet)
    }

    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, PipelineError> {
        if packet.len() < ENCRYPTION_OVERHEAD {
            return Err(PipelineError::PacketTooShort { len: packet.len() });
        }

        let (nonce, ciphertext) = packet.split_at(NONCE_LEN);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce);

        self.cipher.decrypt(nonce, ciphertext)
            .map_err(|_| PipelineError::Authentication)
    }
}
