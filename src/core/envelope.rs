//! Encrypted Envelope Codec
//!
//! Every API request and response travels as an AES-256-GCM envelope
//! around a MessagePack payload:
//!
//! ```text
//! request  (form field `data`):  base64url( nonce[12] ‖ ciphertext ‖ tag[16] )
//! response (body, hexed on receipt):   hex( nonce[12] ‖ ciphertext ‖ tag[16] )
//! ```
//!
//! The key is always passed in explicitly. Nonces come from the OS CSPRNG,
//! fresh for every call.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Structured message: nested arrays/maps of integers, strings and byte strings.
pub type StructuredValue = rmpv::Value;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// Decoder for request envelopes that tolerates missing padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Envelope codec errors.
///
/// Only `Authentication` and `Decode` are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Input was not valid hex / base64.
    #[error("malformed envelope encoding ({len} bytes): {reason}")]
    Format {
        /// Length of the offending input.
        len: usize,
        /// Decoder message.
        reason: String,
    },
    /// Tag verification failed, or the envelope is too short to hold one.
    #[error("envelope failed authentication ({len} bytes)")]
    Authentication {
        /// Length of the raw envelope.
        len: usize,
    },
    /// Decrypted bytes are not exactly one MessagePack value.
    #[error("decrypted payload is not valid MessagePack ({len} bytes): {reason}")]
    Decode {
        /// Length of the decrypted plaintext.
        len: usize,
        /// Parser message.
        reason: String,
    },
    /// Message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Encode(String),
}

impl EnvelopeError {
    /// Whether the adaptive client may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Decode { .. })
    }
}

/// Pre-shared 256-bit envelope key.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvelopeKey([u8; KEY_LEN]);

impl EnvelopeKey {
    /// Wrap raw key bytes.
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(s: &str) -> Result<Self, EnvelopeError> {
        let bytes = hex::decode(s.trim()).map_err(|e| EnvelopeError::Format {
            len: s.len(),
            reason: e.to_string(),
        })?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| EnvelopeError::Format {
            len: b.len(),
            reason: format!("key must be {} bytes", KEY_LEN),
        })?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.0).into())
    }
}

impl fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeKey(..)")
    }
}

// =============================================================================
// PAYLOAD SERIALIZATION
// =============================================================================

/// Serialize a message to MessagePack.
pub fn encode_message(message: &StructuredValue) -> Result<Vec<u8>, EnvelopeError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, message)
        .map_err(|e| EnvelopeError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Parse exactly one MessagePack value; trailing bytes are an error.
///
/// The reserved marker `0xc1` is rejected wherever it appears.
pub fn decode_message(bytes: &[u8]) -> Result<StructuredValue, EnvelopeError> {
    let mut rd = bytes;
    let value = {
        let mut de = rmp_serde::Deserializer::new(&mut rd);
        StructuredValue::deserialize(&mut de)
    }
    .map_err(|e| EnvelopeError::Decode {
        len: bytes.len(),
        reason: e.to_string(),
    })?;

    if !rd.is_empty() {
        return Err(EnvelopeError::Decode {
            len: bytes.len(),
            reason: format!("{} trailing bytes", rd.len()),
        });
    }

    Ok(value)
}

// =============================================================================
// ENCRYPTION
// =============================================================================

/// Raw envelope length for a plaintext of `plaintext_len` bytes.
pub const fn envelope_len(plaintext_len: usize) -> usize {
    NONCE_LEN + plaintext_len + TAG_LEN
}

/// Encrypt a message into a base64url request envelope with a fresh nonce.
pub fn encrypt(message: &StructuredValue, key: &EnvelopeKey) -> Result<String, EnvelopeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(message, key, nonce)
}

/// Encrypt with a caller-chosen nonce.
///
/// A nonce must never be used twice with the same key. Only meant for
/// known-answer tests; use [`encrypt`] for traffic.
pub fn encrypt_with_nonce(
    message: &StructuredValue,
    key: &EnvelopeKey,
    nonce: [u8; NONCE_LEN],
) -> Result<String, EnvelopeError> {
    let plaintext = encode_message(message)?;
    let sealed = seal_bytes(&plaintext, key, nonce)?;
    Ok(general_purpose::URL_SAFE.encode(sealed))
}

/// `nonce ‖ ciphertext ‖ tag` for an arbitrary plaintext.
pub(crate) fn seal_bytes(
    plaintext: &[u8],
    key: &EnvelopeKey,
    nonce: [u8; NONCE_LEN],
) -> Result<Vec<u8>, EnvelopeError> {
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::Encode("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(envelope_len(plaintext.len()));
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

// =============================================================================
// DECRYPTION
// =============================================================================

/// Decrypt a hex-encoded response envelope.
pub fn decrypt(hex_envelope: &str, key: &EnvelopeKey) -> Result<StructuredValue, EnvelopeError> {
    let bytes = hex::decode(hex_envelope).map_err(|e| EnvelopeError::Format {
        len: hex_envelope.len(),
        reason: e.to_string(),
    })?;
    decrypt_bytes(&bytes, key)
}

/// Decrypt a raw envelope.
pub fn decrypt_bytes(envelope: &[u8], key: &EnvelopeKey) -> Result<StructuredValue, EnvelopeError> {
    if envelope.len() < NONCE_LEN + TAG_LEN {
        return Err(EnvelopeError::Authentication { len: envelope.len() });
    }

    let (nonce, sealed) = envelope.split_at(NONCE_LEN);
    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| EnvelopeError::Authentication { len: envelope.len() })?;

    decode_message(&plaintext)
}

/// Decrypt a base64url request envelope, padded or not.
pub fn open_request(envelope: &str, key: &EnvelopeKey) -> Result<StructuredValue, EnvelopeError> {
    let bytes = URL_SAFE_LENIENT
        .decode(envelope.trim())
        .map_err(|e| EnvelopeError::Format {
            len: envelope.len(),
            reason: e.to_string(),
        })?;
    decrypt_bytes(&bytes, key)
}

// =============================================================================
// TESTS
// =============================================================================
