//! ACME DNS-01 Certificate Automation
//!
//! Certificates are requested from an ACME CA (RFC 8555, Let's Encrypt by
//! default) and validated through DNS-01: the key-authorization digest is
//! published as a TXT record at `_acme-challenge.<domain>` in the node's own
//! record store, which replicates it to every peer that may answer the CA's
//! lookup.
//!
//! ## Flow
//! ```text
//! new order -> publish TXT per authorization -> accept -> wait ready
//!           -> remove TXT -> RSA-2048 key + CSR -> finalize -> chain PEM
//! ```
//!
//! The issued pair is written to `certs/`, installed in the [`CertStore`]
//! and announced on the `ssl` bus so peers install it too.
//!
//! A renewal task rescans the certificate map every 48 hours and reissues
//! everything expiring within 90 days as SAN certificates of up to 100 names,
//! pausing between batches to stay under the CA's order rate limit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509ReqBuilder};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dns::{fqdn, DnsRecord, DnsRecordValue};
use crate::events::{
    CertificateIssued, Event, EventBuses, RecordAdded, ADD_RECORD, CERTIFICATE_ISSUED, DNS_BUS,
    SSL_BUS,
};
use crate::replication::RecordService;
use crate::tls::{san_file_stem, CertError, CertStore};

/// Let's Encrypt production ACME directory URL
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging ACME directory URL (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Label prefix of DNS-01 TXT records
pub const CHALLENGE_LABEL: &str = "_acme-challenge";

const CHALLENGE_TXT_TTL: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("order is {0}")]
    OrderStatus(String),

    #[error("authorization for {domain} is {status}")]
    AuthorizationStatus { domain: String, status: String },

    #[error("no dns-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("gave up waiting for {0}")]
    Timeout(&'static str),

    #[error("challenge record: {0}")]
    Records(String),

    #[error("no names to certify")]
    NoNames,

    #[error("account file {path}: {source}")]
    Account {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("account file is malformed: {0}")]
    AccountFormat(#[from] serde_json::Error),

    #[error("key generation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Cert(#[from] CertError),
}

/// ACME settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    pub enabled: bool,
    pub directory_url: String,
    /// Contact e-mail registered with the account
    pub contact: Option<String>,
    /// Account envelope, created on first use
    pub account_file: PathBuf,
    pub renew_interval_secs: u64,
    /// Renew certificates expiring within this many days
    pub renew_before_days: i64,
    pub batch_size: usize,
    pub batch_delay_secs: u64,
    pub poll_delay_secs: u64,
    pub max_poll_attempts: usize,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            contact: None,
            account_file: PathBuf::from("ssl_client_key.json"),
            renew_interval_secs: 48 * 60 * 60,
            renew_before_days: 90,
            batch_size: 100,
            batch_delay_secs: 36,
            poll_delay_secs: 5,
            max_poll_attempts: 30,
        }
    }
}

/// One DNS-01 challenge to satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    /// Identifier being authorized, without any wildcard label
    pub domain: String,
    /// TXT record value
    pub value: String,
}

impl DnsChallenge {
    /// `_acme-challenge.<domain>.`
    pub fn record_name(&self) -> String {
        fqdn(&format!("{}.{}", CHALLENGE_LABEL, self.domain))
    }
}

/// An open certificate order
#[async_trait]
pub trait AcmeOrder: Send {
    /// DNS-01 challenges of the authorizations still pending
    async fn pending_challenges(&mut self) -> Result<Vec<DnsChallenge>, AcmeError>;

    /// Tell the CA every pending challenge is ready to be checked
    async fn accept_all(&mut self) -> Result<(), AcmeError>;

    /// Wait until the CA has validated every authorization
    async fn wait_ready(&mut self) -> Result<(), AcmeError>;

    /// Submit the CSR and return the issued chain as PEM
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError>;
}

/// A CA able to open orders
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError>;
}

/// Where DNS-01 TXT records are published
#[async_trait]
pub trait ChallengeRecords: Send + Sync {
    /// Publish `value` at `name`, returning a handle for removal
    async fn publish_txt(&self, name: &str, value: &str) -> Result<String, AcmeError>;

    async fn remove_txt(&self, id: &str) -> Result<(), AcmeError>;
}

#[async_trait]
impl ChallengeRecords for RecordService {
    async fn publish_txt(&self, name: &str, value: &str) -> Result<String, AcmeError> {
        let name = fqdn(name);
        let zone = {
            let reader = self.store().reader().await;
            reader.find_zone(&name).map(str::to_string)
        };
        // Outside any hosted zone the record gets a zone of its own parent
        let zone = zone.unwrap_or_else(|| {
            name.split_once('.')
                .map(|(_, parent)| parent.to_string())
                .unwrap_or_else(|| name.clone())
        });

        let record = self
            .create_record(&zone, DnsRecord::txt(&name, value, CHALLENGE_TXT_TTL))
            .await
            .map_err(|e| AcmeError::Records(e.to_string()))?;
        Ok(record.metadata.id)
    }

    async fn remove_txt(&self, id: &str) -> Result<(), AcmeError> {
        self.delete_record(id)
            .await
            .map(|_| ())
            .map_err(|e| AcmeError::Records(e.to_string()))
    }
}

/// Envelope persisted in the account file
#[derive(Serialize, Deserialize)]
struct AccountFile {
    key: AccountCredentials,
    directory_url: String,
}

/// [`AcmeDirectory`] backed by a real CA through `instant-acme`. The account
/// is registered lazily on the first order.
pub struct AcmeAccount {
    directory_url: String,
    contact: Option<String>,
    account_file: PathBuf,
    poll_delay: Duration,
    max_poll_attempts: usize,
    account: OnceCell<Account>,
}

impl AcmeAccount {
    pub fn new(config: &AcmeConfig) -> Self {
        Self {
            directory_url: config.directory_url.clone(),
            contact: config.contact.clone(),
            account_file: config.account_file.clone(),
            poll_delay: Duration::from_secs(config.poll_delay_secs),
            max_poll_attempts: config.max_poll_attempts,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account.get_or_try_init(|| self.load_or_register()).await
    }

    async fn load_or_register(&self) -> Result<Account, AcmeError> {
        let path = &self.account_file;
        match fs::read_to_string(path).await {
            Ok(json) => {
                let stored: AccountFile = serde_json::from_str(&json)?;
                if stored.directory_url != self.directory_url {
                    warn!(
                        "Account in {} was registered at {}, not {}",
                        path.display(),
                        stored.directory_url,
                        self.directory_url
                    );
                }
                let account = Account::builder()?.from_credentials(stored.key).await?;
                info!("Loaded ACME account from {}", path.display());
                return Ok(account);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(AcmeError::Account {
                    path: path.clone(),
                    source,
                })
            }
        }

        info!("Registering ACME account at {}", self.directory_url);
        let contact = self.contact.as_ref().map(|c| format!("mailto:{}", c));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;

        let envelope = AccountFile {
            key: credentials,
            directory_url: self.directory_url.clone(),
        };
        write_private(path, serde_json::to_string_pretty(&envelope)?.as_bytes()).await?;
        info!("ACME account saved to {}", path.display());
        Ok(account)
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), AcmeError> {
    let io_err = |source| AcmeError::Account {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    fs::write(path, contents).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }
    Ok(())
}

#[async_trait]
impl AcmeDirectory for AcmeAccount {
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn AcmeOrder>, AcmeError> {
        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();
        let mut order = self.account().await?.new_order(&NewOrder::new(&identifiers)).await?;

        let state = order.refresh().await?;
        if !matches!(state.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Err(AcmeError::OrderStatus(format!("{:?}", state.status)));
        }

        Ok(Box::new(InstantOrder {
            order,
            poll_delay: self.poll_delay,
            max_poll_attempts: self.max_poll_attempts,
        }))
    }
}

struct InstantOrder {
    order: instant_acme::Order,
    poll_delay: Duration,
    max_poll_attempts: usize,
}

fn challenge_domain(identifier: &str) -> String {
    identifier.trim_start_matches("*.").to_string()
}

#[async_trait]
impl AcmeOrder for InstantOrder {
    async fn pending_challenges(&mut self) -> Result<Vec<DnsChallenge>, AcmeError> {
        let mut challenges = Vec::new();
        let mut authorizations = self.order.authorizations();
        while let Some(auth) = authorizations.next().await {
            let mut auth = auth?;
            let domain = challenge_domain(&auth.identifier().to_string());
            if matches!(auth.status, AuthorizationStatus::Valid) {
                debug!("Authorization already valid for {}", domain);
                continue;
            }
            if !matches!(auth.status, AuthorizationStatus::Pending) {
                return Err(AcmeError::AuthorizationStatus {
                    domain,
                    status: format!("{:?}", auth.status),
                });
            }
            let challenge = auth
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDnsChallenge(domain.clone()))?;
            let value = challenge.key_authorization().dns_value();
            challenges.push(DnsChallenge { domain, value });
        }
        Ok(challenges)
    }

    async fn accept_all(&mut self) -> Result<(), AcmeError> {
        let mut authorizations = self.order.authorizations();
        while let Some(auth) = authorizations.next().await {
            let mut auth = auth?;
            if !matches!(auth.status, AuthorizationStatus::Pending) {
                continue;
            }
            let domain = auth.identifier().to_string();
            let mut challenge = auth
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDnsChallenge(domain.clone()))?;
            challenge.set_ready().await?;
            debug!("Challenge for {} set ready", domain);
        }
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<(), AcmeError> {
        for attempt in 1..=self.max_poll_attempts {
            tokio::time::sleep(self.poll_delay).await;
            let state = self.order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Pending | OrderStatus::Processing => {
                    debug!("Order not ready yet (attempt {})", attempt);
                }
                OrderStatus::Invalid => return Err(AcmeError::OrderStatus("invalid".to_string())),
            }
        }
        Err(AcmeError::Timeout("order authorization"))
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError> {
        self.order.finalize_csr(csr_der).await?;
        for attempt in 1..=self.max_poll_attempts {
            match self.order.certificate().await? {
                Some(chain) => return Ok(chain),
                None => debug!("Certificate not issued yet (attempt {})", attempt),
            }
            tokio::time::sleep(self.poll_delay).await;
        }
        Err(AcmeError::Timeout("certificate"))
    }
}

/// Fresh RSA-2048 key and a CSR naming `names` (first one as CN).
/// Returns the DER CSR and the PKCS#8 PEM key.
pub fn generate_csr(names: &[String]) -> Result<(Vec<u8>, String), AcmeError> {
    let primary = names.first().ok_or(AcmeError::NoNames)?;
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut subject = X509NameBuilder::new()?;
    subject.append_entry_by_nid(Nid::COMMONNAME, primary)?;
    let subject = subject.build();

    let mut req = X509ReqBuilder::new()?;
    req.set_subject_name(&subject)?;
    req.set_pubkey(&key)?;
    let mut san = SubjectAlternativeName::new();
    for name in names {
        san.dns(name);
    }
    let san = san.build(&req.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(san)?;
    req.add_extensions(&extensions)?;
    req.sign(&key, MessageDigest::sha256())?;

    let csr = req.build().to_der()?;
    let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8()?)
        .map_err(|e| AcmeError::Records(format!("key PEM is not UTF-8: {}", e)))?;
    Ok((csr, key_pem))
}

/// An issued chain and its private key
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub names: Vec<String>,
    pub chain_pem: String,
    pub key_pem: String,
}

fn normalize_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().trim_end_matches('.').to_lowercase();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Issues, installs, announces and renews certificates
pub struct CertificateManager {
    config: AcmeConfig,
    directory: Arc<dyn AcmeDirectory>,
    records: Arc<dyn ChallengeRecords>,
    certs: Arc<CertStore>,
    buses: EventBuses,
    local_key: String,
}

impl CertificateManager {
    pub fn new(
        config: AcmeConfig,
        directory: Arc<dyn AcmeDirectory>,
        records: Arc<dyn ChallengeRecords>,
        certs: Arc<CertStore>,
        buses: EventBuses,
        local_key: impl Into<String>,
    ) -> Self {
        Self {
            config,
            directory,
            records,
            certs,
            buses,
            local_key: local_key.into(),
        }
    }

    pub fn certs(&self) -> &Arc<CertStore> {
        &self.certs
    }

    /// Obtain a certificate for `names` without installing it
    pub async fn issue(&self, names: &[String]) -> Result<IssuedCertificate, AcmeError> {
        let names = normalize_names(names);
        if names.is_empty() {
            return Err(AcmeError::NoNames);
        }
        info!("Requesting certificate for {:?}", names);

        let mut order = self.directory.new_order(&names).await?;
        let challenges = order.pending_challenges().await?;

        let mut published = Vec::with_capacity(challenges.len());
        let validated = async {
            for challenge in &challenges {
                let id = self
                    .records
                    .publish_txt(&challenge.record_name(), &challenge.value)
                    .await?;
                debug!("Published {} for {}", challenge.record_name(), challenge.domain);
                published.push(id);
            }
            order.accept_all().await?;
            order.wait_ready().await
        }
        .await;

        for id in &published {
            if let Err(e) = self.records.remove_txt(id).await {
                warn!("Failed to remove challenge record {}: {}", id, e);
            }
        }
        validated?;

        let (csr, key_pem) = generate_csr(&names)?;
        let chain_pem = order.finalize(&csr).await?;
        info!("Certificate issued for {:?}", names);

        Ok(IssuedCertificate {
            names,
            chain_pem,
            key_pem,
        })
    }

    /// Issue, persist as `<file_stem>.crt|.key`, install and announce.
    /// Returns the names now served.
    pub async fn provision(
        &self,
        names: &[String],
        file_stem: String,
        replaces: Vec<String>,
    ) -> Result<Vec<String>, AcmeError> {
        let issued = self.issue(names).await?;
        let event = CertificateIssued {
            names: issued.names,
            chain_pem: issued.chain_pem,
            key_pem: issued.key_pem,
            file_stem,
            replaces,
        };
        let installed = self.certs.store(&event).await?;

        match Event::new(CERTIFICATE_ISSUED, &self.local_key, &event) {
            Ok(event) => {
                self.buses.bus(SSL_BUS).publish(event).await;
            }
            Err(e) => warn!("Certificate for {:?} not announced: {}", installed, e),
        }
        Ok(installed)
    }

    /// Certificate for one domain stored as `certs/<domain>.crt`
    pub async fn provision_domain(&self, domain: &str) -> Result<Vec<String>, AcmeError> {
        let name = domain.trim().trim_end_matches('.').to_lowercase();
        self.provision(&[name.clone()], name, Vec::new()).await
    }

    /// Issue for `domain` on a detached task
    pub fn spawn_issue(self: &Arc<Self>, domain: String) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.provision_domain(&domain).await {
                error!("Certificate issuance for {} failed: {}", domain, e);
            }
        })
    }

    /// Issue for every protected A/AAAA name this node announces that has
    /// no certificate yet
    pub fn follow_protected(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.buses.bus(DNS_BUS).subscribe(ADD_RECORD);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut requested = HashSet::new();
            while let Some(event) = rx.recv().await {
                if event.fired_by != manager.local_key {
                    continue;
                }
                let record = match event.decode::<RecordAdded>() {
                    Ok(added) => added.record,
                    Err(e) => {
                        warn!("Undecodable record event: {}", e);
                        continue;
                    }
                };
                let routable =
                    matches!(record.value, DnsRecordValue::A(_) | DnsRecordValue::AAAA(_));
                if !record.metadata.protected || !routable {
                    continue;
                }
                let name = record.name.trim_end_matches('.').to_lowercase();
                if manager.certs.contains(&name) || !requested.insert(name.clone()) {
                    continue;
                }
                manager.spawn_issue(name);
            }
        })
    }

    /// One renewal pass. Returns the number of names reissued.
    pub async fn renew_expiring(&self) -> usize {
        let deadline = Utc::now() + chrono::Duration::days(self.config.renew_before_days);
        let mut expiring = self.certs.expiring_before(deadline);
        if expiring.is_empty() {
            debug!("No certificates due for renewal");
            return 0;
        }
        expiring.sort();
        info!("{} name(s) due for renewal", expiring.len());

        let mut renewed = 0;
        for (index, batch) in expiring.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.batch_delay_secs)).await;
            }

            let stem = san_file_stem(batch);
            let mut replaces: Vec<String> = batch
                .iter()
                .filter_map(|name| self.certs.file_stem(name))
                .filter(|s| *s != stem)
                .collect();
            replaces.sort();
            replaces.dedup();

            match self.provision(batch, stem.clone(), replaces).await {
                Ok(names) => {
                    info!("Renewed {} name(s) as {}", names.len(), stem);
                    renewed += names.len();
                }
                Err(e) => warn!("Renewal batch {} failed: {}", stem, e),
            }
        }
        renewed
    }

    /// Run a renewal pass now and then every `renew_interval_secs`
    pub fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.renew_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                manager.renew_expiring().await;
            }
        })
    }
}
