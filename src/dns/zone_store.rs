//! In-Memory Zone Storage
//!
//! Zones are tries keyed by DNS label, walked right-to-left from the zone
//! apex, so locating a name costs one map lookup per label. Beside the trie
//! the store keeps flat indexes: by record id, by owner name (the query fast
//! path), by domain id and name, and by owning user. All of them change
//! together under a single write lock; a query holds the read lock for its
//! whole duration through [`ZoneReader`].
//!
//! Mutations of one domain are additionally serialized by a per-domain mutex
//! that also guards the domain's zone file, so the file and the indexes never
//! disagree about order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use super::dns_types::{fqdn, DnsError, DnsRecord, DnsRecordType, DnsRecordValue, DomainData};
use super::zone_file::ZoneFiles;
use crate::lock_utils::lock_or_recover;
use crate::snowflake::Snowflake;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Ids of the records owned by exactly this name
    records: Vec<String>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.children.is_empty()
    }

    fn node(&self, labels: &[String]) -> Option<&TrieNode> {
        let mut node = self;
        for label in labels {
            node = node.children.get(label)?;
        }
        Some(node)
    }

    fn node_mut_or_insert(&mut self, labels: &[String]) -> &mut TrieNode {
        let mut node = self;
        for label in labels {
            node = node.children.entry(label.clone()).or_default();
        }
        node
    }

    /// Remove `id` from the node at `labels`, pruning nodes left empty on the
    /// way back up. The node itself is never removed by this call.
    fn remove(&mut self, labels: &[String], id: &str) -> bool {
        match labels.split_first() {
            None => {
                let before = self.records.len();
                self.records.retain(|r| r != id);
                before != self.records.len()
            }
            Some((label, rest)) => {
                let Some(child) = self.children.get_mut(label) else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.children.remove(label);
                }
                removed
            }
        }
    }
}

/// A live record with the zone that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub domain: String,
    pub record: DnsRecord,
}

#[derive(Debug, Default)]
struct Indexes {
    /// Zone apex FQDN -> trie root
    zones: HashMap<String, TrieNode>,
    by_id: HashMap<String, IndexedRecord>,
    domains_by_id: HashMap<String, DomainData>,
    domains_by_name: HashMap<String, DomainData>,
    /// Owner -> domain ids
    user_domains: HashMap<String, Vec<String>>,
    /// Domain id -> record ids
    domain_records: HashMap<String, Vec<String>>,
    /// Owner name -> records
    by_name: HashMap<String, Vec<DnsRecord>>,
}

impl Indexes {
    fn insert(&mut self, zone: &str, labels: &[String], record: DnsRecord) {
        let id = record.metadata.id.clone();

        self.zones
            .entry(zone.to_string())
            .or_default()
            .node_mut_or_insert(labels)
            .records
            .push(id.clone());

        if let Some(domain) = self.domains_by_name.get(zone) {
            self.domain_records
                .entry(domain.id.clone())
                .or_default()
                .push(id.clone());
        }

        self.by_name
            .entry(record.name.clone())
            .or_default()
            .push(record.clone());

        self.by_id.insert(
            id,
            IndexedRecord {
                domain: zone.to_string(),
                record,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<IndexedRecord> {
        let indexed = self.by_id.remove(id)?;
        let zone = &indexed.domain;

        if let Some(records) = self.by_name.get_mut(&indexed.record.name) {
            records.retain(|r| r.metadata.id != id);
            if records.is_empty() {
                self.by_name.remove(&indexed.record.name);
            }
        }

        if let Ok(labels) = relative_labels(&indexed.record.name, zone) {
            if let Some(root) = self.zones.get_mut(zone) {
                root.remove(&labels, id);
                if root.is_empty() && !self.domains_by_name.contains_key(zone) {
                    self.zones.remove(zone);
                }
            }
        }

        if let Some(domain) = self.domains_by_name.get(zone) {
            if let Some(ids) = self.domain_records.get_mut(&domain.id) {
                ids.retain(|r| r != id);
            }
        }

        Some(indexed)
    }

    fn add_domain(&mut self, data: DomainData) {
        self.zones.entry(data.domain.clone()).or_default();
        let ids = self.user_domains.entry(data.owner.clone()).or_default();
        if !ids.contains(&data.id) {
            ids.push(data.id.clone());
        }
        self.domains_by_name.insert(data.domain.clone(), data.clone());
        self.domains_by_id.insert(data.id.clone(), data);
    }

    fn find_zone(&self, name: &str) -> Option<&str> {
        let mut candidate = name;
        loop {
            if let Some((zone, _)) = self.zones.get_key_value(candidate) {
                return Some(zone.as_str());
            }
            match candidate.find('.') {
                Some(pos) if pos + 1 < candidate.len() => candidate = &candidate[pos + 1..],
                _ => return self.zones.get_key_value(".").map(|(z, _)| z.as_str()),
            }
        }
    }
}

/// Labels of `name` below `zone`, outermost first
fn relative_labels(name: &str, zone: &str) -> Result<Vec<String>, DnsError> {
    if name == zone {
        return Ok(Vec::new());
    }
    let prefix = if zone == "." {
        name.strip_suffix('.')
    } else {
        name.strip_suffix(zone).and_then(|p| p.strip_suffix('.'))
    };
    match prefix {
        Some(p) if !p.is_empty() => Ok(p.rsplit('.').map(str::to_string).collect()),
        _ => Err(DnsError::InvalidDomain(format!("{} is not inside zone {}", name, zone))),
    }
}

/// Read view over the store, held for the duration of one query
pub struct ZoneReader<'a> {
    indexes: RwLockReadGuard<'a, Indexes>,
}

impl ZoneReader<'_> {
    /// Records owned by `name` (a lower-case FQDN)
    pub fn records_at(&self, name: &str) -> &[DnsRecord] {
        self.indexes
            .by_name
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Closest enclosing zone of `name`
    pub fn find_zone(&self, name: &str) -> Option<&str> {
        self.indexes.find_zone(name)
    }

    /// Whether `name` exists in its zone, either owning records or as an
    /// empty non-terminal
    pub fn name_exists(&self, name: &str) -> bool {
        let Some(zone) = self.indexes.find_zone(name) else {
            return false;
        };
        let Ok(labels) = relative_labels(name, zone) else {
            return false;
        };
        self.indexes
            .zones
            .get(zone)
            .and_then(|root| root.node(&labels))
            .is_some()
    }

    /// SOA record at the apex of `zone`
    pub fn soa(&self, zone: &str) -> Option<&DnsRecord> {
        self.records_at(zone)
            .iter()
            .find(|r| r.record_type() == DnsRecordType::SOA)
    }
}

/// Thread-safe zone storage
pub struct ZoneStore {
    indexes: RwLock<Indexes>,
    files: Option<ZoneFiles>,
    domain_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    domains_file: AsyncMutex<()>,
    ids: Arc<Snowflake>,
}

impl ZoneStore {
    /// In-memory store
    pub fn new(ids: Arc<Snowflake>) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            files: None,
            domain_locks: Mutex::new(HashMap::new()),
            domains_file: AsyncMutex::new(()),
            ids,
        }
    }

    /// Store persisted to zone files under `files`
    pub fn with_files(ids: Arc<Snowflake>, files: ZoneFiles) -> Self {
        Self {
            files: Some(files),
            ..Self::new(ids)
        }
    }

    pub async fn reader(&self) -> ZoneReader<'_> {
        ZoneReader {
            indexes: self.indexes.read().await,
        }
    }

    fn domain_lock(&self, zone: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock_or_recover(&self.domain_locks, "zone file locks");
        Arc::clone(locks.entry(zone.to_string()).or_default())
    }

    /// Insert (or replace, when the id is already live) a record in the zone
    /// of `domain`. Allocates an id if the record has none.
    pub async fn insert_record(
        &self,
        domain: &str,
        mut record: DnsRecord,
    ) -> Result<DnsRecord, DnsError> {
        let zone = fqdn(domain);
        record.name = fqdn(&record.name);
        record.value.validate()?;
        let labels = relative_labels(&record.name, &zone)?;
        if record.metadata.id.is_empty() {
            record.metadata.id = self.ids.next_string();
        }

        let lock = self.domain_lock(&zone);
        let _file_guard = lock.lock().await;

        let previous = self
            .indexes
            .read()
            .await
            .by_id
            .get(&record.metadata.id)
            .map(|i| i.domain.clone());

        if let Some(files) = &self.files {
            if let Some(previous_zone) = &previous {
                files.remove(previous_zone, &record.metadata.id).await?;
            }
            files.append(&zone, &record).await?;
        }

        let mut indexes = self.indexes.write().await;
        if previous.is_some() {
            indexes.remove(&record.metadata.id);
        }
        indexes.insert(&zone, &labels, record.clone());
        debug!("Inserted {} ({}) into {}", record.name, record.metadata.id, zone);
        Ok(record)
    }

    /// Remove a record everywhere. Fails with `RecordNotFound` for an unknown id.
    pub async fn delete_record(&self, id: &str) -> Result<IndexedRecord, DnsError> {
        let zone = self
            .indexes
            .read()
            .await
            .by_id
            .get(id)
            .map(|i| i.domain.clone())
            .ok_or_else(|| DnsError::RecordNotFound(id.to_string()))?;

        let lock = self.domain_lock(&zone);
        let _file_guard = lock.lock().await;

        if let Some(files) = &self.files {
            files.remove(&zone, id).await?;
        }

        let removed = self
            .indexes
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DnsError::RecordNotFound(id.to_string()))?;
        debug!("Deleted {} ({}) from {}", removed.record.name, id, zone);
        Ok(removed)
    }

    /// Register a domain and create its SOA and NS records.
    ///
    /// Returns the domain and the records created for it.
    pub async fn create_domain(
        &self,
        domain: &str,
        owner: &str,
        nameservers: &[String],
    ) -> Result<(DomainData, Vec<DnsRecord>), DnsError> {
        let domain = fqdn(domain);
        if domain == "." {
            return Err(DnsError::InvalidDomain(domain));
        }

        let data = DomainData {
            id: self.ids.next_string(),
            domain: domain.clone(),
            owner: owner.to_string(),
        };

        {
            let mut indexes = self.indexes.write().await;
            if indexes.domains_by_name.contains_key(&domain) {
                return Err(DnsError::DomainExists(domain));
            }
            indexes.add_domain(data.clone());

            // Records replicated before the domain existed here now belong to it
            let existing: Vec<String> = indexes
                .by_id
                .iter()
                .filter(|(_, i)| i.domain == domain)
                .map(|(id, _)| id.clone())
                .collect();
            if !existing.is_empty() {
                indexes.domain_records.insert(data.id.clone(), existing);
            }
        }
        self.persist_domains().await?;

        let mut created = Vec::new();
        for record in default_records(&domain, nameservers) {
            created.push(self.insert_record(&domain, record).await?);
        }

        info!("Created domain {} for owner {}", domain, owner);
        Ok((data, created))
    }

    async fn persist_domains(&self) -> Result<(), DnsError> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let _guard = self.domains_file.lock().await;
        let mut domains: Vec<DomainData> = self
            .indexes
            .read()
            .await
            .domains_by_id
            .values()
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        files.save_domains(&domains).await
    }

    /// Rebuild the indexes from the zone directory. Returns the number of
    /// records loaded.
    pub async fn load(&self) -> Result<usize, DnsError> {
        let Some(files) = &self.files else {
            return Ok(0);
        };

        let domains = files.load_domains().await?;
        let records = files.load_all().await?;

        let mut indexes = self.indexes.write().await;
        for domain in domains {
            indexes.add_domain(domain);
        }

        let mut loaded = 0;
        for (zone, record) in records {
            let labels = match relative_labels(&record.name, &zone) {
                Ok(labels) => labels,
                Err(e) => {
                    tracing::warn!("Skipping record {}: {}", record.metadata.id, e);
                    continue;
                }
            };
            // A later line for the same id supersedes an earlier one
            indexes.remove(&record.metadata.id);
            indexes.insert(&zone, &labels, record);
            loaded += 1;
        }

        info!(
            "Loaded {} records in {} zones from {}",
            indexes.by_id.len(),
            indexes.zones.len(),
            files.dir().display()
        );
        Ok(loaded)
    }

    pub async fn get_record(&self, id: &str) -> Option<IndexedRecord> {
        self.indexes.read().await.by_id.get(id).cloned()
    }

    pub async fn records_by_name(&self, name: &str) -> Vec<DnsRecord> {
        self.reader().await.records_at(&fqdn(name)).to_vec()
    }

    pub async fn domain_by_name(&self, name: &str) -> Option<DomainData> {
        self.indexes.read().await.domains_by_name.get(&fqdn(name)).cloned()
    }

    pub async fn domain_by_id(&self, id: &str) -> Option<DomainData> {
        self.indexes.read().await.domains_by_id.get(id).cloned()
    }

    pub async fn domains_for_user(&self, owner: &str) -> Vec<DomainData> {
        let indexes = self.indexes.read().await;
        indexes
            .user_domains
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| indexes.domains_by_id.get(id).cloned())
            .collect()
    }

    pub async fn records_for_domain(&self, domain_id: &str) -> Vec<DnsRecord> {
        let indexes = self.indexes.read().await;
        indexes
            .domain_records
            .get(domain_id)
            .into_iter()
            .flatten()
            .filter_map(|id| indexes.by_id.get(id).map(|i| i.record.clone()))
            .collect()
    }

    pub async fn record_count(&self) -> usize {
        self.indexes.read().await.by_id.len()
    }

    pub async fn zone_count(&self) -> usize {
        self.indexes.read().await.zones.len()
    }

    /// Every live record, ordered by id
    pub async fn snapshot(&self) -> Vec<IndexedRecord> {
        let mut records: Vec<IndexedRecord> =
            self.indexes.read().await.by_id.values().cloned().collect();
        records.sort_by(|a, b| a.record.metadata.id.cmp(&b.record.metadata.id));
        records
    }
}

fn default_records(domain: &str, nameservers: &[String]) -> Vec<DnsRecord> {
    let primary = nameservers
        .first()
        .map(|ns| fqdn(ns))
        .unwrap_or_else(|| format!("ns1.{}", domain));

    let mut records = vec![DnsRecord::new(
        domain,
        3600,
        DnsRecordValue::SOA {
            mname: primary,
            rname: format!("hostmaster.{}", domain),
            serial: generate_serial(),
            refresh: 3600,
            retry: 600,
            expire: 604800,
            minimum: 300,
        },
    )];
    records.extend(nameservers.iter().map(|ns| DnsRecord::ns(domain, ns, 86400)));
    records
}

/// `YYYYMMDDnn`
fn generate_serial() -> u32 {
    let base: u32 = Utc::now().format("%Y%m%d").to_string().parse().unwrap_or(20250103);
    base * 100 + rand::thread_rng().gen_range(0..99)
}
