//! Coordinator key handling.
//!
//! The coordinator private key is stored encrypted with AES-256-GCM. The
//! 32-byte key-encryption key lives in a file (hex or raw bytes); the
//! ciphertext is hex of `nonce(12) || ct+tag`. Decrypted material stays in
//! zeroizing buffers and never touches disk.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use maci_common::{Keypair, PrivKey};
use rand::{CryptoRng, RngCore};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{CoordinatorError, CoordinatorResult};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Read the key-encryption key, decrypt `ciphertext_hex` and derive the
/// coordinator keypair.
pub async fn load_private_key(
    key_file: &Path,
    ciphertext_hex: &str,
) -> CoordinatorResult<Keypair> {
    let contents = Zeroizing::new(tokio::fs::read(key_file).await.map_err(|e| {
        CoordinatorError::KeyLoad(format!("{}: {}", key_file.display(), e))
    })?);
    let kek = parse_key_material(&contents)?;
    debug!("Loaded key-encryption key from {}", key_file.display());

    let plaintext = decrypt_private_key(&kek, ciphertext_hex)?;
    let encoded = std::str::from_utf8(&plaintext)
        .map_err(|_| CoordinatorError::KeyDeserialization("plaintext is not utf-8".into()))?;
    let priv_key = PrivKey::deserialize(encoded)
        .map_err(|e| CoordinatorError::KeyDeserialization(e.to_string()))?;

    let keypair = Keypair::from_priv(priv_key);
    info!("Coordinator public key: {}", keypair.pub_key);
    Ok(keypair)
}

fn parse_key_material(contents: &[u8]) -> CoordinatorResult<Zeroizing<[u8; KEY_LEN]>> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if contents.len() == KEY_LEN {
        key.copy_from_slice(contents);
        return Ok(key);
    }

    let text = std::str::from_utf8(contents)
        .map_err(|_| CoordinatorError::KeyLoad("key file is neither raw bytes nor hex".into()))?;
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let decoded = Zeroizing::new(
        hex::decode(digits)
            .map_err(|_| CoordinatorError::KeyLoad("key file is not valid hex".into()))?,
    );
    if decoded.len() != KEY_LEN {
        return Err(CoordinatorError::KeyLoad(format!(
            "key file must hold {} bytes, got {}",
            KEY_LEN,
            decoded.len()
        )));
    }
    key.copy_from_slice(&decoded);
    Ok(key)
}

fn decrypt_private_key(
    kek: &[u8; KEY_LEN],
    ciphertext_hex: &str,
) -> CoordinatorResult<Zeroizing<Vec<u8>>> {
    let trimmed = ciphertext_hex.trim();
    let blob = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .map_err(|_| CoordinatorError::Decryption)?;
    if blob.len() <= NONCE_LEN {
        return Err(CoordinatorError::Decryption);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(kek).map_err(|_| CoordinatorError::Decryption)?;
    let plaintext = cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CoordinatorError::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt a coordinator private key under `kek`, producing the hex blob
/// [`load_private_key`] expects.
pub fn encrypt_private_key<R: RngCore + CryptoRng>(
    kek: &[u8; KEY_LEN],
    priv_key: &PrivKey,
    rng: &mut R,
) -> CoordinatorResult<String> {
    let cipher = Aes256Gcm::new_from_slice(kek)
        .map_err(|_| CoordinatorError::KeyLoad("invalid key-encryption key".into()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let encoded = priv_key.serialize();
    let ciphertext = cipher
        .encrypt((&nonce).into(), encoded.as_bytes())
        .map_err(|_| CoordinatorError::KeyLoad("private key encryption failed".into()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(hex::encode(blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn key_material_accepts_hex_and_raw() {
        let raw = [5u8; KEY_LEN];
        assert_eq!(*parse_key_material(&raw).unwrap(), raw);

        let hex_form = format!("0x{}\n", hex::encode(raw));
        assert_eq!(*parse_key_material(hex_form.as_bytes()).unwrap(), raw);

        assert!(matches!(
            parse_key_material(b"abcd"),
            Err(CoordinatorError::KeyLoad(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let mut rng = StdRng::seed_from_u64(3);
        let kek = [9u8; KEY_LEN];
        let key = PrivKey::random(&mut rng);
        let blob = encrypt_private_key(&kek, &key, &mut rng).unwrap();

        let mut bytes = hex::decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        assert!(matches!(
            decrypt_private_key(&kek, &hex::encode(bytes)),
            Err(CoordinatorError::Decryption)
        ));
        assert!(matches!(
            decrypt_private_key(&[1u8; KEY_LEN], &blob),
            Err(CoordinatorError::Decryption)
        ));
        assert!(matches!(
            decrypt_private_key(&kek, "zz"),
            Err(CoordinatorError::Decryption)
        ));
    }

    #[test]
    fn round_trip_restores_the_same_key() {
        let mut rng = StdRng::seed_from_u64(4);
        let kek = [2u8; KEY_LEN];
        let key = PrivKey::random(&mut rng);
        let blob = encrypt_private_key(&kek, &key, &mut rng).unwrap();
        let plaintext = decrypt_private_key(&kek, &blob).unwrap();
        assert_eq!(plaintext.as_slice(), key.serialize().as_bytes());
    }
}
