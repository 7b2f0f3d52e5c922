//! Password-based decryption of the downloaded result (spec §4.1.2).
//!
//! ```text
//! [ salt        | 16 bytes ]
//! [ IV          | 12 bytes ]
//! [ auth_tag    | 16 bytes ]
//! [ ciphertext  | remainder of file ]
//! ```
//!
//! A legacy AES-256-ECB+PKCS7 fallback (§4.1.2) is attempted only when GCM
//! authentication fails *and* the caller opted in via
//! [`crate::config::ClientOptions::legacy_decrypt_allowed`]. New writes never
//! produce the legacy format — this asymmetry is intentional (§9).

use std::path::Path;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit as BlockKeyInit};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, Nonce};
use scrypt::Params;
use zeroize::Zeroizing;

use crate::error::{EncryptionErrorKind, ExperimentError};

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = SALT_LEN + IV_LEN + TAG_LEN;

fn kdf_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Kdf, message)
}

fn open_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Open, message)
}

fn io_err(message: impl Into<String>) -> ExperimentError {
    ExperimentError::encryption(EncryptionErrorKind::Io, message)
}

fn scrypt_derive(password: &[u8], salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<Zeroizing<[u8; 32]>, ExperimentError> {
    let params = Params::new(log_n, r, p, 32).map_err(|e| kdf_err(format!("invalid scrypt params: {e}")))?;
    let mut out = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(password, salt, &params, &mut *out).map_err(|e| kdf_err(format!("scrypt failed: {e}")))?;
    Ok(out)
}

/// Which wire format a result blob is in. New writes only ever emit `Gcm`;
/// `Legacy` exists purely as a read-path fallback (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFormat {
    Gcm,
    Legacy,
}

/// Decrypt the file at `path` in place using the 32-byte `otp` password.
/// Returns which format actually decoded it.
pub async fn otp_decrypt_file(path: &Path, password: &[u8; 32], legacy_allowed: bool) -> Result<DecryptFormat, ExperimentError> {
    let ciphertext = tokio::fs::read(path).await.map_err(|e| io_err(format!("read ciphertext: {e}")))?;
    if ciphertext.len() < HEADER_LEN {
        return Err(open_err("ciphertext shorter than header"));
    }

    match gcm_decrypt(&ciphertext, password) {
        Ok(plaintext) => {
            write_atomic(path, &plaintext).await?;
            Ok(DecryptFormat::Gcm)
        }
        Err(primary_err) => {
            if !legacy_allowed {
                return Err(primary_err);
            }
            let plaintext = legacy_ecb_decrypt(&ciphertext, password)?;
            write_atomic(path, &plaintext).await?;
            Ok(DecryptFormat::Legacy)
        }
    }
}

fn gcm_decrypt(ciphertext: &[u8], password: &[u8; 32]) -> Result<Vec<u8>, ExperimentError> {
    let salt = &ciphertext[0..SALT_LEN];
    let iv = &ciphertext[SALT_LEN..SALT_LEN + IV_LEN];
    let tag = &ciphertext[SALT_LEN + IV_LEN..HEADER_LEN];
    let body = &ciphertext[HEADER_LEN..];

    let key = scrypt_derive(password, salt, 15, 8, 1)?; // N = 2^15 = 32768

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| open_err("GCM authentication failed"))
}

/// `N=16384` scrypt over a literal 4-byte salt `b"salt"`, whole-file
/// AES-256-ECB with PKCS#7 padding. Historical artifacts only.
fn legacy_ecb_decrypt(ciphertext: &[u8], password: &[u8; 32]) -> Result<Vec<u8>, ExperimentError> {
    let key = scrypt_derive(password, b"salt", 14, 8, 1)?; // N = 2^14 = 16384

    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(open_err("legacy ciphertext is not block-aligned"));
    }
    let cipher = aes::Aes256::new(GenericArray::from_slice(&*key));
    let mut blocks = ciphertext.to_vec();
    for chunk in blocks.chunks_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    let pad = *blocks.last().ok_or_else(|| open_err("legacy ciphertext empty after decrypt"))? as usize;
    if pad == 0 || pad > 16 || pad > blocks.len() {
        return Err(open_err("legacy ciphertext has invalid PKCS#7 padding"));
    }
    if !blocks[blocks.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(open_err("legacy ciphertext has invalid PKCS#7 padding"));
    }
    blocks.truncate(blocks.len() - pad);
    Ok(blocks)
}

async fn write_atomic(path: &Path, plaintext: &[u8]) -> Result<(), ExperimentError> {
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let target = path.to_path_buf();
    let plaintext = plaintext.to_vec();
    tokio::task::spawn_blocking(move || -> Result<(), ExperimentError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io_err(format!("create temp file: {e}")))?;
        use std::io::Write as _;
        tmp.write_all(&plaintext).map_err(|e| io_err(format!("write plaintext: {e}")))?;
        tmp.flush().map_err(|e| io_err(format!("flush plaintext: {e}")))?;
        tmp.persist(&target).map_err(|e| io_err(format!("rename plaintext into place: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| io_err(format!("decrypt task panicked: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;
    use rand::RngCore;

    fn seal_gcm(password: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        let key = scrypt_derive(password, &salt, 15, 8, 1).unwrap();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
        let sealed = cipher.encrypt(Nonce::from_slice(&iv), plaintext).unwrap();
        let split = sealed.len() - TAG_LEN;
        let (c, tag) = sealed.split_at(split);
        let mut out = Vec::new();
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(c);
        out
    }

    #[tokio::test]
    async fn round_trips_through_file() {
        let password = [7u8; 32];
        let plaintext = b"summary/summary.json contents".to_vec();
        let blob = seal_gcm(&password, &plaintext);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.bin");
        tokio::fs::write(&path, &blob).await.unwrap();

        let format = otp_decrypt_file(&path, &password, false).await.unwrap();
        assert_eq!(format, DecryptFormat::Gcm);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn wrong_key_fails_authentication_not_silent_corruption() {
        let password = [7u8; 32];
        let other = [9u8; 32];
        let blob = seal_gcm(&password, b"secret");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.bin");
        tokio::fs::write(&path, &blob).await.unwrap();

        let err = otp_decrypt_file(&path, &other, false).await.unwrap_err();
        assert_eq!(err.kind_tag(), "encryption");
    }

    #[test]
    fn legacy_ecb_round_trips() {
        let password = [3u8; 32];
        let key = scrypt_derive(&password, b"salt", 14, 8, 1).unwrap();
        let cipher = aes::Aes256::new(GenericArray::from_slice(&*key));

        let mut plaintext = b"legacy report body".to_vec();
        let pad = 16 - (plaintext.len() % 16);
        plaintext.extend(std::iter::repeat(pad as u8).take(pad));
        for chunk in plaintext.chunks_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }

        let decrypted = legacy_ecb_decrypt(&plaintext, &password).unwrap();
        assert_eq!(decrypted, b"legacy report body");
    }
}
