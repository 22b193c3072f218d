//! Zone File Persistence
//!
//! One text file per domain, `<dir>/<domain>.zone`, one record per line:
//!
//! ```text
//! www.test. 300 IN A 10.0.0.1 ; {"id":"7281...","protected":false,...}
//! ```
//!
//! Inserts append. Deletes stream the old file into a temporary sibling,
//! dropping the line with the matching id, and rename it over the original.
//! The domain list lives next to the zones in `domains.json`.
//!
//! Callers serialize writes to one domain's file through the store's
//! per-domain mutex.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use super::dns_types::{DnsError, DnsRecord, DomainData};

const ZONE_EXTENSION: &str = "zone";
const DOMAINS_FILE: &str = "domains.json";

/// Directory of zone files
#[derive(Debug, Clone)]
pub struct ZoneFiles {
    dir: PathBuf,
}

impl ZoneFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `domain` (given as FQDN)
    pub fn path_for(&self, domain: &str) -> PathBuf {
        let stem = domain.trim_end_matches('.');
        self.dir.join(format!("{}.{}", stem, ZONE_EXTENSION))
    }

    /// Append one record line
    pub async fn append(&self, domain: &str, record: &DnsRecord) -> Result<(), DnsError> {
        fs::create_dir_all(&self.dir).await?;
        let line = record.to_zone_line()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(domain))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the zone file without the line carrying `id`.
    ///
    /// Returns whether a line was dropped.
    pub async fn remove(&self, domain: &str, id: &str) -> Result<bool, DnsError> {
        let path = self.path_for(domain);
        let source = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let tmp_path = path.with_extension(format!("{}.tmp", ZONE_EXTENSION));
        let mut out = BufWriter::new(File::create(&tmp_path).await?);
        let mut lines = BufReader::new(source).lines();
        let mut dropped = false;

        while let Some(line) = lines.next_line().await? {
            let matches = match DnsRecord::from_zone_line(&line) {
                Ok(Some(record)) => record.metadata.id == id,
                Ok(None) => false,
                Err(e) => {
                    warn!("Keeping unparseable line in {}: {}", path.display(), e);
                    false
                }
            };
            if matches {
                dropped = true;
                continue;
            }
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }

        out.flush().await?;
        drop(out);
        fs::rename(&tmp_path, &path).await?;
        debug!("Rewrote {} (dropped id {}: {})", path.display(), id, dropped);
        Ok(dropped)
    }

    /// Read every zone file as `(domain, record)` pairs, in file order.
    /// Lines that fail to parse are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<(String, DnsRecord)>, DnsError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ZONE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let domain = format!("{}.", stem);
            let mut lines = BufReader::new(File::open(&path).await?).lines();
            let mut line_no = 0usize;
            while let Some(line) = lines.next_line().await? {
                line_no += 1;
                match DnsRecord::from_zone_line(&line) {
                    Ok(Some(record)) => out.push((domain.clone(), record)),
                    Ok(None) => {}
                    Err(e) => warn!("{}:{}: skipping record: {}", path.display(), line_no, e),
                }
            }
        }

        Ok(out)
    }

    pub async fn save_domains(&self, domains: &[DomainData]) -> Result<(), DnsError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(DOMAINS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", DOMAINS_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(domains)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load_domains(&self) -> Result<Vec<DomainData>, DnsError> {
        match fs::read(self.dir.join(DOMAINS_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
