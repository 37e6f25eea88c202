// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload cipher suites.
//!
//! Two suites exist on the wire. The V1 suite (version tags `1.0`, `A01`,
//! `B01`) is AES-128-CBC with PKCS#7 padding; key and IV are derived with
//! MD5 from the frame timestamp, the device `local_key`, and fixed salt
//! constants. The L01 suite is AES-128-GCM keyed from the `local_key`,
//! the frame header fields, and the two session nonces exchanged in the
//! HELLO handshake; the authentication tag is appended to the ciphertext.
//!
//! Map payloads use a third, simpler construction: AES-128-CBC with the
//! client's session nonce as the key and a zero IV, wrapping a gzipped
//! blob.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use md5::{Digest, Md5};

use crate::error::CodecError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

// Salt constants for the V1 key/IV derivation. These are protocol
// constants shared by every endpoint speaking the suite.
const V1_KEY_SALT_PRE: &[u8] = b"qWKYcdQWrbm9hPqe";
const V1_KEY_SALT_POST: &[u8] = b"9g75mJ1xR2bKoSVe";
const V1_IV_SALT_PRE: &[u8] = b"nF0zAq7TfWxL2cUd";
const V1_IV_SALT_POST: &[u8] = b"Hk4pYsG8jDw6mQrZ";

/// Computes the MD5 digest of the concatenated inputs.
pub(crate) fn md5_concat(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derives the V1 AES key for a frame timestamp and device key.
fn v1_key(local_key: &str, timestamp: u32) -> [u8; 16] {
    let timestamp_ascii = timestamp.to_string();
    md5_concat(&[
        V1_KEY_SALT_PRE,
        timestamp_ascii.as_bytes(),
        local_key.as_bytes(),
        V1_KEY_SALT_POST,
    ])
}

/// Derives the V1 AES IV from the derived key.
fn v1_iv(key: &[u8; 16]) -> [u8; 16] {
    md5_concat(&[V1_IV_SALT_PRE, key, V1_IV_SALT_POST])
}

/// Encrypts a V1-suite payload.
#[must_use]
pub fn encrypt_v1(plaintext: &[u8], local_key: &str, timestamp: u32) -> Vec<u8> {
    let key = v1_key(local_key, timestamp);
    let iv = v1_iv(&key);
    Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts a V1-suite payload.
///
/// # Errors
///
/// Returns [`CodecError::Cipher`] when the padding does not verify,
/// which is what a wrong `local_key` or corrupted payload looks like.
pub fn decrypt_v1(
    ciphertext: &[u8],
    local_key: &str,
    timestamp: u32,
) -> Result<Vec<u8>, CodecError> {
    let key = v1_key(local_key, timestamp);
    let iv = v1_iv(&key);
    Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|err| CodecError::Cipher(format!("CBC unpad failed: {err}")))
}

/// Key material inputs for the L01 GCM suite.
///
/// Every field participates in the derivation, so a frame is only
/// decryptable by the session that negotiated the same nonce pair.
#[derive(Debug, Clone, Copy)]
pub struct L01KeyMaterial<'a> {
    /// The device's shared secret.
    pub local_key: &'a str,
    /// Frame timestamp.
    pub timestamp: u32,
    /// Frame sequence number.
    pub seq: u32,
    /// Frame random value.
    pub random: u32,
    /// Client nonce from the HELLO request.
    pub connect_nonce: u32,
    /// Device nonce from the HELLO response.
    pub ack_nonce: u32,
}

fn l01_key_and_nonce(material: &L01KeyMaterial<'_>) -> ([u8; 16], [u8; 12]) {
    let key = md5_concat(&[
        material.local_key.as_bytes(),
        &material.timestamp.to_be_bytes(),
        &material.seq.to_be_bytes(),
        &material.random.to_be_bytes(),
        &material.connect_nonce.to_be_bytes(),
        &material.ack_nonce.to_be_bytes(),
    ]);
    let iv_material = md5_concat(&[&key, material.local_key.as_bytes()]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&iv_material[..12]);
    (key, nonce)
}

/// Encrypts an L01-suite payload; the GCM tag is appended.
///
/// # Errors
///
/// Returns [`CodecError::Cipher`] if the AEAD rejects the input.
pub fn encrypt_l01(
    plaintext: &[u8],
    material: &L01KeyMaterial<'_>,
) -> Result<Vec<u8>, CodecError> {
    let (key, nonce) = l01_key_and_nonce(material);
    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|err| CodecError::Cipher(format!("GCM key: {err}")))?;
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|err| CodecError::Cipher(format!("GCM encrypt: {err}")))
}

/// Decrypts an L01-suite payload, verifying the appended GCM tag.
///
/// # Errors
///
/// Returns [`CodecError::Cipher`] when the tag does not verify, which is
/// what mismatched session nonces look like.
pub fn decrypt_l01(
    ciphertext: &[u8],
    material: &L01KeyMaterial<'_>,
) -> Result<Vec<u8>, CodecError> {
    let (key, nonce) = l01_key_and_nonce(material);
    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|err| CodecError::Cipher(format!("GCM key: {err}")))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|err| CodecError::Cipher(format!("GCM decrypt: {err}")))
}

/// Encrypts a map blob with a raw 16-byte key and a zero IV.
#[must_use]
pub fn encrypt_cbc_raw(plaintext: &[u8], key: &[u8; 16]) -> Vec<u8> {
    let iv = [0u8; 16];
    Aes128CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts a map blob with a raw 16-byte key and a zero IV.
///
/// # Errors
///
/// Returns [`CodecError::Cipher`] when the padding does not verify.
pub fn decrypt_cbc_raw(ciphertext: &[u8], key: &[u8; 16]) -> Result<Vec<u8>, CodecError> {
    let iv = [0u8; 16];
    Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|err| CodecError::Cipher(format!("CBC unpad failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_KEY: &str = "b8Hj5mFk3QzT7rLp";

    fn material() -> L01KeyMaterial<'static> {
        L01KeyMaterial {
            local_key: LOCAL_KEY,
            timestamp: 1_753_606_905,
            seq: 1,
            random: 304_251,
            connect_nonce: 893_563,
            ack_nonce: 485_592_656,
        }
    }

    #[test]
    fn v1_round_trip() {
        let plaintext = b"{\"dps\":{\"101\":\"{}\"}}";
        let encrypted = encrypt_v1(plaintext, LOCAL_KEY, 1_700_000_000);
        assert_ne!(encrypted, plaintext);
        let decrypted = decrypt_v1(&encrypted, LOCAL_KEY, 1_700_000_000).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn v1_key_depends_on_timestamp_and_local_key() {
        let plaintext = b"payload";
        let encrypted = encrypt_v1(plaintext, LOCAL_KEY, 1_700_000_000);
        assert!(decrypt_v1(&encrypted, LOCAL_KEY, 1_700_000_001).is_err());
        assert!(decrypt_v1(&encrypted, "other_key_16byte", 1_700_000_000).is_err());
    }

    #[test]
    fn l01_round_trip() {
        let payload =
            br#"{"dps":{"101":"{\"id\":1806,\"method\":\"get_prop\"}"},"t":1753606905}"#;
        let material = material();
        let encrypted = encrypt_l01(payload, &material).unwrap();
        // GCM appends a 16-byte tag.
        assert_eq!(encrypted.len(), payload.len() + 16);
        let decrypted = decrypt_l01(&encrypted, &material).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn l01_rejects_mismatched_nonces() {
        let payload = b"payload";
        let encrypted = encrypt_l01(payload, &material()).unwrap();

        let mut wrong = material();
        wrong.ack_nonce = 1;
        assert!(decrypt_l01(&encrypted, &wrong).is_err());

        let mut wrong = material();
        wrong.connect_nonce = 1;
        assert!(decrypt_l01(&encrypted, &wrong).is_err());
    }

    #[test]
    fn l01_key_uses_every_header_field() {
        let base = l01_key_and_nonce(&material()).0;
        for mutate in [
            |m: &mut L01KeyMaterial<'_>| m.timestamp += 1,
            |m: &mut L01KeyMaterial<'_>| m.seq += 1,
            |m: &mut L01KeyMaterial<'_>| m.random += 1,
        ] {
            let mut changed = material();
            mutate(&mut changed);
            assert_ne!(l01_key_and_nonce(&changed).0, base);
        }
    }

    #[test]
    fn cbc_raw_round_trip() {
        let key = *b"0123456789abcdef";
        let plaintext = b"gzipped map bytes";
        let encrypted = encrypt_cbc_raw(plaintext, &key);
        let decrypted = decrypt_cbc_raw(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
