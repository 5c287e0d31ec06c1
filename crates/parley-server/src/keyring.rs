//! Server-held signing keys, one per username.
//!
//! Clients authenticate by name only, so the server signs on their behalf
//! with a keypair it keeps for each name. With a directory configured the
//! keys survive restarts and a user's id (their hex public key) is stable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use parley_shared::error::IdentityError;
use parley_shared::Identity;
use tracing::info;

pub struct Keyring {
    dir: Option<PathBuf>,
    identities: RwLock<HashMap<String, Identity>>,
}

impl Keyring {
    /// Keys persisted under `dir/users/`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Keys that live as long as the process.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// The identity for `username`, loading or creating it on first use.
    pub fn identity_for(&self, username: &str) -> Result<Identity, IdentityError> {
        if let Some(identity) = self.identities.read().get(username) {
            return Ok(identity.clone());
        }

        let mut identities = self.identities.write();
        if let Some(identity) = identities.get(username) {
            return Ok(identity.clone());
        }

        let identity = match &self.dir {
            Some(dir) => Identity::load_or_generate(&identity_path(dir, username), username)?,
            None => Identity::generate(username),
        };
        info!(user = %username, fingerprint = %identity.fingerprint(), "Identity ready");
        identities.insert(username.to_string(), identity.clone());
        Ok(identity)
    }

    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Usernames are hashed into file names so any string is safe on disk.
fn identity_path(dir: &Path, username: &str) -> PathBuf {
    let digest = blake3::hash(username.as_bytes());
    let name = hex::encode(&digest.as_bytes()[..8]);
    dir.join("users").join(format!("{name}.json"))
}
