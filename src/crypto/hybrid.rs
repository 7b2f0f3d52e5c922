//! Hybrid encryption of the uploaded package (spec §4.1.1).
//!
//! Wire layout, big-endian where multi-byte:
//!
//! ```text
//! [ IV            | 12 bytes                            ]
//! [ key_length    |  2 bytes  (uint16 BE)                ]
//! [ encrypted_key | key_length bytes (RSA-OAEP-SHA256)   ]
//! [ ciphertext    | len(plaintext) bytes (AES-256-GCM)   ]
//! [ auth_tag      | 16 bytes  (GCM tag)                  ]
//! ```
//!
//! Crypto bytes here are exact and wire-observable from the server; do not
//! "fix" the layout (e.g. widening `key_length`, re-encoding the IV).

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{EncryptionErrorKind, ExperimentError};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

fn key_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Key, message)
}

fn wrap_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::KeyWrap, message)
}

fn seal_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Seal, message)
}

fn io_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Io, message)
}

/// Parse a PEM-encoded RSA public key, accepting either SubjectPublicKeyInfo
/// (`-----BEGIN PUBLIC KEY-----`) or PKCS#1 (`-----BEGIN RSA PUBLIC KEY-----`)
/// framing, since server fleets are inconsistent about which one they emit.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey, ExperimentError> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| key_err(format!("unparseable RSA public key: {e}")))
}

/// Encrypt the file at `path` in place: ciphertext replaces the plaintext
/// atomically (temp file + rename), so a crash mid-write never corrupts the
/// original.
pub async fn hybrid_encrypt_file(path: &Path, public_key_pem: &str) -> Result<(), ExperimentError> {
    let public_key = parse_public_key(public_key_pem)?;
    let plaintext = tokio::fs::read(path).await.map_err(|e| io_err(format!("read plaintext: {e}")))?;

    let ciphertext = hybrid_encrypt_bytes(&plaintext, &public_key)?;

    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), ExperimentError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io_err(format!("create temp file: {e}")))?;
        use std::io::Write as _;
        tmp.write_all(&ciphertext).map_err(|e| io_err(format!("write ciphertext: {e}")))?;
        tmp.flush().map_err(|e| io_err(format!("flush ciphertext: {e}")))?;
        tmp.persist(&target).map_err(|e| io_err(format!("rename ciphertext into place: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| io_err(format!("encrypt task panicked: {e}")))??;
    Ok(())
}

fn hybrid_encrypt_bytes(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, ExperimentError> {
    let mut rng = rand::thread_rng();

    let mut data_key = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(&mut *data_key);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*data_key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| seal_err(format!("AES-GCM seal failed: {e}")))?;
    // aes-gcm appends the 16-byte tag to the ciphertext; split it back out so
    // we can place it after `C` per the wire layout above.
    let split = sealed.len().saturating_sub(TAG_LEN);
    let (c, tag) = sealed.split_at(split);

    let encrypted_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &*data_key)
        .map_err(|e| wrap_err(format!("RSA-OAEP wrap failed: {e}")))?;
    if encrypted_key.len() > u16::MAX as usize {
        return Err(wrap_err("wrapped key exceeds 65535 bytes"));
    }

    let mut out = Vec::with_capacity(IV_LEN + 2 + encrypted_key.len() + c.len() + TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&(encrypted_key.len() as u16).to_be_bytes());
    out.extend_from_slice(&encrypted_key);
    out.extend_from_slice(c);
    out.extend_from_slice(tag);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn keypair() -> (RsaPublicKey, RsaPrivateKey) {
        let mut rng = rand::thread_rng();
        let sk = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pk = RsaPublicKey::from(&sk);
        (pk, sk)
    }

    fn decrypt_for_test(blob: &[u8], sk: &RsaPrivateKey) -> Vec<u8> {
        let iv = &blob[0..IV_LEN];
        let key_len = u16::from_be_bytes([blob[IV_LEN], blob[IV_LEN + 1]]) as usize;
        let ek_start = IV_LEN + 2;
        let ek = &blob[ek_start..ek_start + key_len];
        let rest = &blob[ek_start + key_len..];
        let data_key = sk.decrypt(Oaep::new::<Sha256>(), ek).unwrap();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
        cipher.decrypt(Nonce::from_slice(iv), rest).unwrap()
    }

    #[test]
    fn round_trips() {
        let (pk, sk) = keypair();
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let blob = hybrid_encrypt_bytes(&plaintext, &pk).unwrap();
        assert_eq!(decrypt_for_test(&blob, &sk), plaintext);
    }

    #[test]
    fn layout_field_widths_are_exact() {
        let (pk, _sk) = keypair();
        let blob = hybrid_encrypt_bytes(b"x", &pk).unwrap();
        let key_len = u16::from_be_bytes([blob[IV_LEN], blob[IV_LEN + 1]]) as usize;
        assert_eq!(blob.len(), IV_LEN + 2 + key_len + 1 + TAG_LEN);
    }

    #[test]
    fn rejects_garbage_pem() {
        let err = parse_public_key("not a pem").unwrap_err();
        assert_eq!(err.kind_tag(), "encryption");
    }
}
