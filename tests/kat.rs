//! Known-answer / byte-layout tests for the two wire formats in spec §4.1.
//! These pin the exact field widths and ordering; a passing round trip isn't
//! enough on its own — a malformed-but-round-trippable layout must still
//! fail here.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use scrypt::Params;
use sha2::Sha256;
use simforge::crypto::hybrid_encrypt_file;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 16;

fn keypair() -> (RsaPublicKey, RsaPrivateKey) {
    let mut rng = rand::thread_rng();
    let sk = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let pk = RsaPublicKey::from(&sk);
    (pk, sk)
}

fn pem_of(pk: &RsaPublicKey) -> String {
    use rsa::pkcs8::EncodePublicKey;
    pk.to_public_key_pem(Default::default()).unwrap()
}

/// §4.1.1 layout: `IV[12] || key_len_u16_BE || encrypted_key || ciphertext || tag[16]`.
#[tokio::test]
async fn hybrid_layout_matches_spec_field_widths() {
    let (pk, sk) = keypair();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let plaintext = b"dhrystone_rv64.elf packed archive bytes";
    tokio::fs::write(&path, plaintext).await.unwrap();

    hybrid_encrypt_file(&path, &pem_of(&pk)).await.unwrap();
    let blob = tokio::fs::read(&path).await.unwrap();

    let iv = &blob[0..IV_LEN];
    let key_len = u16::from_be_bytes([blob[IV_LEN], blob[IV_LEN + 1]]) as usize;
    let ek_start = IV_LEN + 2;
    let ek = &blob[ek_start..ek_start + key_len];
    let rest = &blob[ek_start + key_len..];
    assert_eq!(blob.len(), ek_start + key_len + plaintext.len() + TAG_LEN);

    let data_key = sk.decrypt(Oaep::new::<Sha256>(), ek).unwrap();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    let decrypted = cipher.decrypt(Nonce::from_slice(iv), rest).unwrap();
    assert_eq!(decrypted, plaintext);
}

/// §4.1.2 layout: `salt[16] || IV[12] || tag[16] || ciphertext`, scrypt
/// N=2^15, r=8, p=1, dkLen=32, no AAD.
#[test]
fn otp_gcm_layout_matches_spec_field_widths() {
    let password = [0x5au8; 32];
    let salt = [0x11u8; SALT_LEN];
    let iv = [0x22u8; IV_LEN];
    let plaintext = b"{\"Total Cycles\": 253629}".to_vec();

    let params = Params::new(15, 8, 1, 32).unwrap();
    let mut key = [0u8; 32];
    scrypt::scrypt(&password, &salt, &params, &mut key).unwrap();

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let sealed = cipher.encrypt(Nonce::from_slice(&iv), plaintext.as_slice()).unwrap();
    let split = sealed.len() - TAG_LEN;
    let (ciphertext, tag) = sealed.split_at(split);

    let mut blob = Vec::new();
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(tag);
    blob.extend_from_slice(ciphertext);

    assert_eq!(blob.len(), SALT_LEN + IV_LEN + TAG_LEN + plaintext.len());
    assert_eq!(&blob[SALT_LEN + IV_LEN..SALT_LEN + IV_LEN + TAG_LEN], tag);
}

/// §6.3: the `otp` is carried in `config.json` as a `String` whose code
/// points equal the raw byte values, never re-encoded as UTF-8/hex/base64.
#[test]
fn otp_string_encoding_round_trips_every_byte_value() {
    let otp: [u8; 32] = std::array::from_fn(|i| (i * 7) as u8);
    let encoded: String = otp.iter().map(|&b| char::from_u32(b as u32).unwrap()).collect();
    assert_eq!(encoded.chars().count(), 32);
    let decoded: Vec<u8> = encoded.chars().map(|c| c as u32 as u8).collect();
    assert_eq!(decoded, otp.to_vec());
}