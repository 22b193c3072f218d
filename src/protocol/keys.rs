//! RSA key store
//!
//! Each principal owns `keys/<name>-private.pem` and `keys/<name>-public.pem`
//! (2048-bit RSA, generated on first start). Peer public keys are read from
//! the same directory by name the first time they are needed and cached.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{Signer, Verifier};
use tracing::{debug, info};

use super::AuthError;
use crate::lock_utils::{read_lock_or_recover, write_lock_or_recover};

/// Principal name the master uses for its own key pair
pub const MASTER_KEY_NAME: &str = "master";

const RSA_BITS: u32 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no public key on file for {0}")]
    NotFound(String),

    #[error("invalid key name {0:?}")]
    InvalidName(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Key pair of the local principal plus a cache of peer public keys
pub struct KeyStore {
    dir: PathBuf,
    name: String,
    private: PKey<Private>,
    peers: RwLock<HashMap<String, PKey<Public>>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Load the key pair for `name` from `dir`, generating it if missing.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, KeyError> {
        check_name(name)?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let private_path = private_key_path(&dir, name);
        let private = if private_path.exists() {
            let pem = fs::read(&private_path).map_err(io_err(&private_path))?;
            PKey::private_key_from_pem(&pem)?
        } else {
            info!("Generating {}-bit RSA key pair for '{}'", RSA_BITS, name);
            let pkey = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;
            write_private(&private_path, &pkey.private_key_to_pem_pkcs8()?)?;
            pkey
        };

        let public_path = public_key_path(&dir, name);
        if !public_path.exists() {
            fs::write(&public_path, private.public_key_to_pem()?).map_err(io_err(&public_path))?;
        }

        Ok(Self {
            dir,
            name: name.to_string(),
            private,
            peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// PEM of the local public key
    pub fn public_key_pem(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.private.public_key_to_pem()?)
    }

    /// Sign `message` with PKCS#1 v1.5 over SHA-256
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Verify `signature` over `message` against the public key of `peer`
    pub fn verify_with(
        &self,
        peer: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), AuthError> {
        let key = self.peer_key(peer).map_err(|e| match e {
            KeyError::NotFound(name) => AuthError::MissingPublicKey(name),
            other => AuthError::Key(other),
        })?;

        let mut verifier = Verifier::new(MessageDigest::sha256(), &key).map_err(KeyError::from)?;
        verifier.update(message).map_err(KeyError::from)?;
        // A malformed signature surfaces as an ErrorStack rather than `false`
        match verifier.verify(signature) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(AuthError::SignatureInvalid),
        }
    }

    /// Check that a public key for `peer` is on file
    pub fn has_peer(&self, peer: &str) -> bool {
        self.peer_key(peer).is_ok()
    }

    /// Decrypt a PKCS#1 v1.5 RSA ciphertext addressed to this principal
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let rsa = self.private.rsa()?;
        let mut out = vec![0u8; rsa.size() as usize];
        let n = rsa.private_decrypt(ciphertext, &mut out, Padding::PKCS1)?;
        out.truncate(n);
        Ok(out)
    }

    /// Encrypt `data` to `peer` with PKCS#1 v1.5 padding
    pub fn encrypt_for(&self, peer: &str, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let rsa = self.peer_key(peer)?.rsa()?;
        let mut out = vec![0u8; rsa.size() as usize];
        let n = rsa.public_encrypt(data, &mut out, Padding::PKCS1)?;
        out.truncate(n);
        Ok(out)
    }

    fn peer_key(&self, peer: &str) -> Result<PKey<Public>, KeyError> {
        if let Some(key) = read_lock_or_recover(&self.peers, "peer keys").get(peer) {
            return Ok(key.clone());
        }

        check_name(peer)?;
        let path = public_key_path(&self.dir, peer);
        let pem = match fs::read(&path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyError::NotFound(peer.to_string()))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        let key = PKey::public_key_from_pem(&pem)?;
        debug!("Loaded public key for '{}'", peer);

        write_lock_or_recover(&self.peers, "peer keys").insert(peer.to_string(), key.clone());
        Ok(key)
    }
}

/// Key names become file names inside the key directory
fn check_name(name: &str) -> Result<(), KeyError> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) || name.contains("..") {
        return Err(KeyError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn private_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}-private.pem", name))
}

pub fn public_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}-public.pem", name))
}

fn write_private(path: &Path, pem: &[u8]) -> Result<(), KeyError> {
    fs::write(path, pem).map_err(io_err(path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).map_err(io_err(path))?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).map_err(io_err(path))?;
    }

    Ok(())
}
