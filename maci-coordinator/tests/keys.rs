//! Loading the coordinator key from its encrypted form.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use maci_coordinator::{load_private_key, CoordinatorError};
use maci_test_fixtures::{coordinator_keypair, encrypted_key_file};

#[tokio::test]
async fn test_loads_the_encrypted_coordinator_key() {
    let dir = tempfile::tempdir().unwrap();
    let expected = coordinator_keypair();
    let (path, ciphertext) = encrypted_key_file(dir.path(), &expected).unwrap();

    let keypair = load_private_key(&path, &ciphertext).await.unwrap();
    assert_eq!(keypair.pub_key, expected.pub_key);
}

#[tokio::test]
async fn test_missing_key_file_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_private_key(&dir.path().join("absent.key"), "00")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::KeyLoad(_)));
}

#[tokio::test]
async fn test_wrong_key_file_fails_decryption() {
    let dir = tempfile::tempdir().unwrap();
    let (path, ciphertext) = encrypted_key_file(dir.path(), &coordinator_keypair()).unwrap();
    std::fs::write(&path, hex::encode([0x11u8; 32])).unwrap();

    let err = load_private_key(&path, &ciphertext).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Decryption));
    assert_eq!(err.error_code(), "KEY_DECRYPTION_FAILED");
}

#[tokio::test]
async fn test_malformed_plaintext_is_a_deserialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let kek = [0x42u8; 32];
    let path = dir.path().join("coordinator.key");
    std::fs::write(&path, kek).unwrap();

    let nonce = [3u8; 12];
    let cipher = Aes256Gcm::new_from_slice(&kek).unwrap();
    let ct = cipher
        .encrypt((&nonce).into(), b"macisk.not-a-key".as_slice())
        .unwrap();
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ct);

    let err = load_private_key(&path, &hex::encode(blob)).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::KeyDeserialization(_)));
}
