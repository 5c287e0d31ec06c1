use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::constants::{FINGERPRINT_BYTES, PUBKEY_SIZE, SECRET_KEY_SIZE};
use crate::error::IdentityError;

/// A node's signing identity: an Ed25519 keypair plus a display nickname.
/// The hex public key doubles as the user id on the wire.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    nickname: String,
}

/// Public half of an identity as written next to the private key file.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub nickname: String,
    pub public_key: String,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            nickname: nickname.into(),
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE], nickname: impl Into<String>) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
            nickname: nickname.into(),
        }
    }

    /// Load the identity stored at `path`, or generate and persist a new one.
    ///
    /// `path` holds the public half as JSON; the private key lives in a
    /// sibling `.key` file. A public file without its private key is an
    /// integrity failure and is never papered over with a fresh keypair,
    /// since that would silently change who this node is. A private key
    /// without its public file is repaired by rewriting the public half.
    pub fn load_or_generate(path: &Path, nickname: &str) -> Result<Self, IdentityError> {
        let key_path = private_key_path(path);

        match (path.exists(), key_path.exists()) {
            (false, false) => {
                let identity = Self::generate(nickname);
                identity.save(path)?;
                Ok(identity)
            }
            (true, false) => Err(IdentityError::MissingPrivateKey(
                path.display().to_string(),
            )),
            (false, true) => {
                let identity = read_private_key(&key_path, nickname)?;
                identity.write_public(path)?;
                Ok(identity)
            }
            (true, true) => {
                let raw = fs::read_to_string(path)?;
                let public: PublicIdentity = serde_json::from_str(&raw)
                    .map_err(|e| IdentityError::Corrupt(e.to_string()))?;
                let identity = read_private_key(&key_path, &public.nickname)?;
                if identity.public_key_hex() != public.public_key.to_lowercase() {
                    return Err(IdentityError::Corrupt(
                        "private key does not match the stored public key".into(),
                    ));
                }
                Ok(identity)
            }
        }
    }

    /// Persist both halves of the identity.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private_key(&private_key_path(path), self.signing_key.as_bytes())?;
        self.write_public(path)
    }

    fn write_public(&self, path: &Path) -> Result<(), IdentityError> {
        let public = PublicIdentity {
            nickname: self.nickname.clone(),
            public_key: self.public_key_hex(),
        };
        let json = serde_json::to_string_pretty(&public)
            .map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex public key, used as the user id.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Human-readable (base64url) form of the public key.
    pub fn encoded_public_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }

    /// Short fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("nickname", &self.nickname)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// First eight bytes of BLAKE3(public key), hex encoded.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = blake3::hash(public_key);
    hex::encode(&hash.as_bytes()[..FINGERPRINT_BYTES])
}

/// Verify a raw signature against a raw public key. Any malformed input is
/// simply a failed verification.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBKEY_SIZE]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

fn private_key_path(path: &Path) -> PathBuf {
    path.with_extension("key")
}

fn read_private_key(path: &Path, nickname: &str) -> Result<Identity, IdentityError> {
    let raw = fs::read_to_string(path)?;
    let bytes = hex::decode(raw.trim()).map_err(|e| IdentityError::Corrupt(e.to_string()))?;
    let secret: [u8; SECRET_KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    Ok(Identity::from_secret_bytes(&secret, nickname))
}

fn write_private_key(path: &Path, secret: &[u8; SECRET_KEY_SIZE]) -> Result<(), IdentityError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(hex::encode(secret).as_bytes())?;
    Ok(())
}
