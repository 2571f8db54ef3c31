//! crypto.rs — Device signing identity and canonical encoding
//!
//! Every device owns one Ed25519 keypair, generated on first use and
//! persisted as hex in a small JSON file. Envelopes carry the public key so
//! receivers verify without any prior key exchange.
//!
//! Signatures cover a canonical JSON form: object keys sorted, arrays
//! element-wise, no insignificant whitespace. Two encoders that build the
//! same fields in a different order produce identical bytes.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::KeyStoreError;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    secret_key: String,
    public_key: String,
}

pub struct DeviceIdentity {
    signing_key: SigningKey,
    path: Option<PathBuf>,
}

impl DeviceIdentity {
    /// Loads the keypair at `path`, generating and saving one if absent.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let path = path.as_ref();
        if path.exists() {
            let stored: StoredKey = serde_json::from_slice(&fs::read(path)?)?;
            let signing_key = signing_key_from_hex(&stored.secret_key)?;
            if hex::encode(signing_key.verifying_key().as_bytes()) != stored.public_key {
                return Err(KeyStoreError::Corrupt("public key does not match secret key".to_string()));
            }
            return Ok(Self { signing_key, path: Some(path.to_path_buf()) });
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stored = StoredKey {
            secret_key: hex::encode(signing_key.to_bytes()),
            public_key: hex::encode(signing_key.verifying_key().as_bytes()),
        };
        fs::write(path, serde_json::to_vec_pretty(&stored)?)?;
        let identity = Self { signing_key, path: Some(path.to_path_buf()) };
        info!("🔑 Generated device key {} at {}", identity.fingerprint(), path.display());
        Ok(identity)
    }

    /// Ephemeral keypair, never written to disk.
    pub fn in_memory() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng), path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Short SHA-256 fingerprint of the public key, for logs.
    pub fn fingerprint(&self) -> String {
        key_fingerprint(self.signing_key.verifying_key().as_bytes())
    }

    /// Hex-encoded signature over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

fn signing_key_from_hex(secret_hex: &str) -> Result<SigningKey, KeyStoreError> {
    let bytes = hex::decode(secret_hex).map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyStoreError::Corrupt("secret key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Checks a hex signature against a hex public key. Any decoding problem
/// counts as a failed verification.
pub fn verify(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_key_hex) else { return false };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else { return false };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else { return false };

    let Ok(sig_bytes) = hex::decode(signature_hex) else { return false };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else { return false };
    let signature = Signature::from_bytes(&sig_bytes);

    key.verify(message, &signature).is_ok()
}

pub fn key_fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

// ── Canonical JSON ────────────────────────────────────────────────────────────

/// Deterministic encoding of `value` with object keys sorted.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // A plain string always serializes
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
