//! Property-style round-trip tests (spec §8, properties 4-6).

use std::ffi::OsString;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use rsa::{RsaPrivateKey, RsaPublicKey};
use simforge::crypto::{hybrid_encrypt_file, otp_decrypt_file, DecryptFormat};
use simforge::package::{pack, unpack, Workload};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

fn basenames() -> impl Strategy<Value = Vec<String>> {
    pvec("[a-z][a-z0-9_]{0,9}\\.elf", 1..5).prop_map(|mut names| {
        // de-duplicate while keeping proptest's shrinking stable
        let mut seen = std::collections::HashSet::new();
        names.retain(|n| seen.insert(n.clone()));
        if names.is_empty() {
            names.push("a.elf".to_string());
        }
        names
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property 6: tar round trip — `unpack(pack(cfg, W))` yields `cfg` and
    /// `W` with identical byte contents.
    #[test]
    fn pack_unpack_preserves_bytes(
        names in basenames(),
        config_json in "\\{\"uuid\":\"[a-f0-9]{8}\"\\}",
        payload_seed in any::<u64>(),
    ) {
        rt().block_on(async {
            let src = tempfile::tempdir().unwrap();
            let mut workloads = Vec::new();
            let mut expected = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let contents: Vec<u8> = (0..64).map(|b| ((payload_seed as usize + i * 31 + b) % 256) as u8).collect();
                let path = src.path().join(name);
                tokio::fs::write(&path, &contents).await.unwrap();
                expected.push((name.clone(), contents));
                workloads.push(Workload { path, basename: OsString::from(name) });
            }

            let archive_dir = tempfile::tempdir().unwrap();
            let archive_path = archive_dir.path().join("exp.tar.gz");
            pack(&archive_path, &config_json, &workloads).await.unwrap();

            let dest = tempfile::tempdir().unwrap();
            unpack(&archive_path, dest.path()).await.unwrap();

            let got_config = tokio::fs::read_to_string(dest.path().join("config.json")).await.unwrap();
            prop_assert_eq!(got_config, config_json);
            for (name, contents) in expected {
                let got = tokio::fs::read(dest.path().join(&name)).await.unwrap();
                prop_assert_eq!(got, contents);
            }
            Ok(())
        })?;
    }

    /// Property 5: password-encryption round trip, and authentication
    /// failure (not silent corruption) under any other 32-byte key.
    #[test]
    fn otp_gcm_round_trips_and_rejects_wrong_key(
        plaintext in pvec(any::<u8>(), 0..512),
        password in prop::array::uniform32(any::<u8>()),
        wrong_byte in any::<u8>(),
    ) {
        rt().block_on(async {
            let blob = seal_gcm(&password, &plaintext);
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("result.bin");
            tokio::fs::write(&path, &blob).await.unwrap();

            let format = otp_decrypt_file(&path, &password, false).await.unwrap();
            prop_assert_eq!(format, DecryptFormat::Gcm);
            let got = tokio::fs::read(&path).await.unwrap();
            prop_assert_eq!(got, plaintext.clone());

            let mut other = password;
            other[0] ^= wrong_byte | 1; // guaranteed to differ in at least one bit
            tokio::fs::write(&path, &blob).await.unwrap();
            let err = otp_decrypt_file(&path, &other, false).await.unwrap_err();
            prop_assert_eq!(err.kind_tag(), "encryption");
            Ok(())
        })?;
    }
}

fn seal_gcm(password: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    use rand::RngCore;
    use scrypt::Params;

    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 16];
    rng.fill_bytes(&mut salt);
    let mut iv = [0u8; 12];
    rng.fill_bytes(&mut iv);

    let params = Params::new(15, 8, 1, 32).unwrap();
    let mut key = [0u8; 32];
    scrypt::scrypt(password, &salt, &params, &mut key).unwrap();

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let sealed = cipher.encrypt(Nonce::from_slice(&iv), plaintext).unwrap();
    let split = sealed.len() - 16;
    let (c, tag) = sealed.split_at(split);

    let mut out = Vec::new();
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(c);
    out
}

/// Property 4: hybrid-encryption round trip for arbitrary plaintext against
/// one freshly generated keypair (RSA keygen is too slow to re-run per case).
#[test]
fn hybrid_round_trips_arbitrary_plaintexts() {
    let mut rng = rand::thread_rng();
    let sk = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let pk = RsaPublicKey::from(&sk);
    let pem = {
        use rsa::pkcs8::EncodePublicKey;
        pk.to_public_key_pem(Default::default()).unwrap()
    };

    let cases: &[&[u8]] = &[b"", b"x", b"the quick brown fox", &[0u8; 4096]];
    rt().block_on(async {
        for plaintext in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("payload.bin");
            tokio::fs::write(&path, plaintext).await.unwrap();
            hybrid_encrypt_file(&path, &pem).await.unwrap();
            let blob = tokio::fs::read(&path).await.unwrap();

            let iv = &blob[0..12];
            let key_len = u16::from_be_bytes([blob[12], blob[13]]) as usize;
            let ek = &blob[14..14 + key_len];
            let rest = &blob[14 + key_len..];
            let data_key = sk.decrypt(rsa::Oaep::new::<sha2::Sha256>(), ek).unwrap();
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
            let decrypted = cipher.decrypt(Nonce::from_slice(iv), rest).unwrap();
            assert_eq!(&decrypted, plaintext);
        }
    });
}
