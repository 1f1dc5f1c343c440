use crate::error::{KpackError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build-embedded passphrase. Doubles as the PBKDF2 salt, so anyone building
/// from source with a different string produces incompatible containers.
const PASSPHRASE: &str = "kpack_credential_vault";

const PBKDF2_ITERATIONS: u32 = 10_000;
const KEY_LEN: usize = 32;

/// 12-byte GCM nonce + 16-byte tag; anything shorter cannot be a sealed blob.
const MIN_COMBINED_LEN: usize = 28;

const KSIGN_MAGIC: &[u8] = b"KSIGN01";

/// Derives the symmetric credential key. Deterministic within a build.
///
/// If the PBKDF2 primitive reports failure we degrade to a single SHA-256 of
/// the passphrase. Weaker, but still deterministic, so existing blobs stay
/// readable. The degraded path is logged, never silent.
pub fn derive_key() -> [u8; 32] {
    let mut key = [0u8; KEY_LEN];
    match pbkdf2::pbkdf2::<Hmac<Sha256>>(
        PASSPHRASE.as_bytes(),
        PASSPHRASE.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut key,
    ) {
        Ok(()) => key,
        Err(e) => {
            log::warn!("PBKDF2 key derivation failed ({e}), falling back to SHA-256 key");
            let digest = Sha256::digest(PASSPHRASE.as_bytes());
            key.copy_from_slice(&digest);
            key
        }
    }
}

/// AES-256-GCM seal with a fresh random nonce.
/// Output layout: nonce || ciphertext || tag ("combined" form).
pub fn encrypt(plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key())
        .map_err(|_| KpackError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| KpackError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// AES-256-GCM open of combined-form input. Fails on short input or tag
/// mismatch; there is no fallback here.
pub fn decrypt(combined: &[u8]) -> Result<Vec<u8>> {
    if combined.len() < MIN_COMBINED_LEN {
        return Err(KpackError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(&derive_key())
        .map_err(|_| KpackError::DecryptionFailed)?;
    let (nonce, ciphertext) = combined.split_at(12);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KpackError::DecryptionFailed)
}

/// Encrypts, or hands the bytes back untouched when sealing fails.
/// Callers must treat the result as "maybe encrypted" and rely on
/// [`is_encrypted`] only as a migration aid.
pub fn safe_encrypt(data: &[u8]) -> Vec<u8> {
    match encrypt(data) {
        Ok(sealed) => sealed,
        Err(_) => {
            log::warn!("credential encryption failed, storing plaintext");
            data.to_vec()
        }
    }
}

/// Decrypts, or hands the bytes back untouched when opening fails.
pub fn safe_decrypt(data: &[u8]) -> Vec<u8> {
    decrypt(data).unwrap_or_else(|_| data.to_vec())
}

/// Heuristic: a blob at least as long as the minimum combined output is
/// assumed sealed. Not a format guarantee; kept for read-compatibility with
/// already-stored blobs.
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= MIN_COMBINED_LEN
}

/// Builds a portable `.ksign` container: the 7-byte ASCII magic followed by
/// the combined AES-GCM output.
pub fn encrypt_ksign_container(plaintext: &[u8]) -> Result<Vec<u8>> {
    let sealed = encrypt(plaintext)?;
    let mut out = Vec::with_capacity(KSIGN_MAGIC.len() + sealed.len());
    out.extend_from_slice(KSIGN_MAGIC);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a `.ksign` container. The magic must match exactly; the remainder
/// must decrypt. Whole-file decrypt-then-parse, never partial.
pub fn decrypt_ksign_container(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < KSIGN_MAGIC.len() || &data[..KSIGN_MAGIC.len()] != KSIGN_MAGIC {
        return Err(KpackError::InvalidContainer);
    }
    decrypt(&data[KSIGN_MAGIC.len()..]).map_err(|_| KpackError::InvalidContainer)
}

/// Decrypted payload of a `.ksign` container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KsignPayload {
    pub name: String,
    #[serde(rename = "p12Data")]
    pub p12_data: String,
    #[serde(rename = "provisionData")]
    pub provision_data: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub date: Option<f64>,
}

impl KsignPayload {
    pub fn from_container(data: &[u8]) -> Result<Self> {
        let plaintext = decrypt_ksign_container(data)?;
        let payload: KsignPayload = serde_json::from_slice(&plaintext)?;
        Ok(payload)
    }

    pub fn to_container(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        encrypt_ksign_container(&json)
    }

    pub fn p12_bytes(&self) -> Result<Vec<u8>> {
        base64::decode(&self.p12_data).map_err(|_| KpackError::MissingField("p12Data"))
    }

    pub fn provision_bytes(&self) -> Result<Vec<u8>> {
        base64::decode(&self.provision_data)
            .map_err(|_| KpackError::MissingField("provisionData"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(derive_key(), derive_key());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let plaintext = b"certificate bytes go here";
        let sealed = encrypt(plaintext).unwrap();
        assert_ne!(&sealed[..], &plaintext[..]);
        assert!(sealed.len() >= plaintext.len() + 28);
        assert_eq!(decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn encrypt_uses_fresh_nonces() {
        let a = encrypt(b"same input").unwrap();
        let b = encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_rejects_tampered_data() {
        let mut sealed = encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(decrypt(&sealed), Err(KpackError::DecryptionFailed)));
    }

    #[test]
    fn decrypt_rejects_short_input() {
        assert!(matches!(decrypt(&[0u8; 27]), Err(KpackError::DecryptionFailed)));
    }

    #[test]
    fn safe_variants_pass_through_on_failure() {
        let garbage = vec![1u8, 2, 3];
        assert_eq!(safe_decrypt(&garbage), garbage);

        let sealed = safe_encrypt(&garbage);
        assert_eq!(safe_decrypt(&sealed), garbage);
    }

    #[test]
    fn is_encrypted_boundary() {
        assert!(!is_encrypted(&vec![0u8; 27]));
        assert!(is_encrypted(&vec![0u8; 28]));
    }

    #[test]
    fn ksign_container_round_trip() {
        let plaintext = br#"{"name":"test"}"#;
        let container = encrypt_ksign_container(plaintext).unwrap();
        assert_eq!(&container[..7], b"KSIGN01");
        assert_eq!(decrypt_ksign_container(&container).unwrap(), plaintext);
    }

    #[test]
    fn ksign_container_rejects_bad_magic() {
        assert!(matches!(
            decrypt_ksign_container(b"NOTKSGN payload"),
            Err(KpackError::InvalidContainer)
        ));
        assert!(matches!(
            decrypt_ksign_container(b"KSIGN"),
            Err(KpackError::InvalidContainer)
        ));
        // valid magic, garbage body
        assert!(matches!(
            decrypt_ksign_container(b"KSIGN01aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            Err(KpackError::InvalidContainer)
        ));
    }

    #[test]
    fn ksign_payload_round_trip() {
        let payload = KsignPayload {
            name: "Dev Cert".to_string(),
            p12_data: base64::encode(b"p12 bytes"),
            provision_data: base64::encode(b"provision bytes"),
            password: Some("hunter2".to_string()),
            date: None,
        };

        let container = payload.to_container().unwrap();
        let parsed = KsignPayload::from_container(&container).unwrap();
        assert_eq!(parsed.name, "Dev Cert");
        assert_eq!(parsed.p12_bytes().unwrap(), b"p12 bytes");
        assert_eq!(parsed.provision_bytes().unwrap(), b"provision bytes");
        assert_eq!(parsed.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn ksign_payload_rejects_bad_base64() {
        let payload: KsignPayload =
            serde_json::from_str(r#"{"name":"x","p12Data":"!!!","provisionData":"AAAA"}"#)
                .unwrap();
        assert!(matches!(
            payload.p12_bytes(),
            Err(KpackError::MissingField("p12Data"))
        ));
        assert!(payload.provision_bytes().is_ok());
    }
}
