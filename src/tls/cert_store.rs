//! Certificate map and SNI resolution

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::nid::Nid;
use openssl::x509::X509;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::events::CertificateIssued;
use crate::lock_utils::{read_lock_or_recover, write_lock_or_recover};

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificate in chain")]
    EmptyChain,

    #[error("no private key found")]
    MissingKey,

    #[error("certificate names no host")]
    NoNames,

    #[error("invalid certificate file stem {0:?}")]
    InvalidFileStem(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("X.509 error: {0}")]
    X509(#[from] openssl::error::ErrorStack),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CertError + '_ {
    move |source| CertError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Facts read from the leaf of a PEM chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// DNS names (SAN, or the CN when there is no SAN), lower-case
    pub names: Vec<String>,
    pub not_after: DateTime<Utc>,
}

/// Parse the first certificate of `chain_pem`
pub fn parse_leaf(chain_pem: &str) -> Result<LeafInfo, CertError> {
    let cert = X509::from_pem(chain_pem.as_bytes())?;

    let mut names: Vec<String> = cert
        .subject_alt_names()
        .map(|sans| sans.iter().filter_map(|n| n.dnsname().map(host_key)).collect())
        .unwrap_or_default();
    if names.is_empty() {
        if let Some(cn) = cert.subject_name().entries_by_nid(Nid::COMMONNAME).next() {
            names.push(host_key(&cn.data().as_utf8()?.to_string()));
        }
    }

    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(cert.not_after())?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    let not_after = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| CertError::Pem("notAfter out of range".to_string()))?;

    Ok(LeafInfo { names, not_after })
}

/// `san_<first 8 hex of sha256(sorted names joined by ',')>`
pub fn san_file_stem(names: &[String]) -> String {
    let mut sorted: Vec<String> = names.iter().map(|n| host_key(n)).collect();
    sorted.sort();
    let digest = Sha256::digest(sorted.join(",").as_bytes());
    format!("san_{}", &hex::encode(digest)[..8])
}

/// Stems name files inside the certificate directory
fn check_file_stem(stem: &str) -> Result<(), CertError> {
    if stem.is_empty() || stem.contains(['/', '\\', '\0']) || stem.contains("..") {
        return Err(CertError::InvalidFileStem(stem.to_string()));
    }
    Ok(())
}

/// Map key for a host: lower-case, no trailing dot
fn host_key(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

fn certified_key(chain_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>, CertError> {
    let chain: Vec<CertificateDer<'static>> = certs(&mut chain_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::Pem(e.to_string()))?;
    if chain.is_empty() {
        return Err(CertError::EmptyChain);
    }

    let key: PrivateKeyDer<'static> = private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::Pem(e.to_string()))?
        .ok_or(CertError::MissingKey)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

struct Entry {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
    file_stem: String,
}

/// Host name -> certificate, optionally backed by `certs/`
pub struct CertStore {
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("dir", &self.dir)
            .field("certificates", &self.len())
            .finish()
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CertStore {
    /// Memory-only store
    pub fn new() -> Self {
        Self {
            dir: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::new()
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Load every `<stem>.crt` with a sibling `<stem>.key`. Files are read in
    /// name order; a later file wins a name both claim.
    pub fn load_dir(&self) -> Result<usize, CertError> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(dir)(e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("crt"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for crt in paths {
            let Some(stem) = crt.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let key_path = crt.with_extension("key");
            let chain_pem = fs::read_to_string(&crt).map_err(io_err(&crt))?;
            let key_pem = match fs::read_to_string(&key_path) {
                Ok(pem) => pem,
                Err(e) => {
                    warn!("Skipping {}: {}", crt.display(), e);
                    continue;
                }
            };
            match self.install(&chain_pem, &key_pem, &stem) {
                Ok(names) => {
                    debug!("Loaded {} for {:?}", crt.display(), names);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping {}: {}", crt.display(), e),
            }
        }

        info!("Loaded {} certificate(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Serve `chain_pem` for every DNS name in its leaf. Returns those names.
    pub fn install(
        &self,
        chain_pem: &str,
        key_pem: &str,
        file_stem: &str,
    ) -> Result<Vec<String>, CertError> {
        let leaf = parse_leaf(chain_pem)?;
        if leaf.names.is_empty() {
            return Err(CertError::NoNames);
        }
        let key = certified_key(chain_pem, key_pem)?;

        let mut entries = write_lock_or_recover(&self.entries, "certificate map");
        for name in &leaf.names {
            entries.insert(
                name.clone(),
                Entry {
                    key: Arc::clone(&key),
                    not_after: leaf.not_after,
                    file_stem: file_stem.to_string(),
                },
            );
        }
        Ok(leaf.names)
    }

    /// Persist and serve an issued certificate, dropping the files it replaces
    pub async fn store(&self, issued: &CertificateIssued) -> Result<Vec<String>, CertError> {
        for stem in std::iter::once(&issued.file_stem).chain(&issued.replaces) {
            check_file_stem(stem)?;
        }

        if let Some(dir) = &self.dir {
            tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
            let crt = dir.join(format!("{}.crt", issued.file_stem));
            let key = dir.join(format!("{}.key", issued.file_stem));
            tokio::fs::write(&crt, &issued.chain_pem).await.map_err(io_err(&crt))?;
            tokio::fs::write(&key, &issued.key_pem).await.map_err(io_err(&key))?;
        }

        let names = self.install(&issued.chain_pem, &issued.key_pem, &issued.file_stem)?;

        if let Some(dir) = &self.dir {
            for stem in issued.replaces.iter().filter(|s| **s != issued.file_stem) {
                for ext in ["crt", "key"] {
                    let path = dir.join(format!("{}.{}", stem, ext));
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!("Removed superseded {}", path.display()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                    }
                }
            }
        }

        info!("Installed certificate {} for {} name(s)", issued.file_stem, names.len());
        Ok(names)
    }

    /// Case-insensitive exact match
    pub fn resolve(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        read_lock_or_recover(&self.entries, "certificate map")
            .get(&host_key(server_name))
            .map(|e| Arc::clone(&e.key))
    }

    pub fn contains(&self, name: &str) -> bool {
        read_lock_or_recover(&self.entries, "certificate map").contains_key(&host_key(name))
    }

    pub fn not_after(&self, name: &str) -> Option<DateTime<Utc>> {
        read_lock_or_recover(&self.entries, "certificate map")
            .get(&host_key(name))
            .map(|e| e.not_after)
    }

    pub fn file_stem(&self, name: &str) -> Option<String> {
        read_lock_or_recover(&self.entries, "certificate map")
            .get(&host_key(name))
            .map(|e| e.file_stem.clone())
    }

    pub fn len(&self) -> usize {
        read_lock_or_recover(&self.entries, "certificate map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names whose certificate expires at or before `deadline`, sorted
    pub fn expiring_before(&self, deadline: DateTime<Utc>) -> Vec<String> {
        let mut names: Vec<String> = read_lock_or_recover(&self.entries, "certificate map")
            .iter()
            .filter(|(_, e)| e.not_after <= deadline)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// rustls certificate callback over a [`CertStore`]
#[derive(Debug)]
pub struct SniResolver {
    store: Arc<CertStore>,
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let found = self.store.resolve(name);
        if found.is_none() {
            debug!("No certificate for SNI {}", name);
        }
        found
    }
}

/// Server config that picks certificates by SNI from `store`
pub fn server_config(store: Arc<CertStore>) -> Result<Arc<ServerConfig>, CertError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(store)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
