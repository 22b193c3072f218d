//! DNS Record Type Definitions
//!
//! Records as the edge stores them: a typed resource record plus the
//! replication metadata (`id`, `protected`, ...). Records render to and parse
//! from the standard presentation format used in zone files.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::txt::RDataParser;
use serde::{Deserialize, Serialize};

/// Longest character-string a TXT or CAA value may carry on the wire
pub const MAX_CHARACTER_STRING: usize = 255;

/// Longest RDATA text handed to the presentation parser
const MAX_RDATA_TEXT: usize = 4000;

/// DNS record types the edge serves
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
    AAAA,
    CNAME,
    MX,
    NS,
    SOA,
    SRV,
    TXT,
    CAA,
    PTR,
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DnsRecordType::A => "A",
            DnsRecordType::AAAA => "AAAA",
            DnsRecordType::CNAME => "CNAME",
            DnsRecordType::MX => "MX",
            DnsRecordType::NS => "NS",
            DnsRecordType::SOA => "SOA",
            DnsRecordType::SRV => "SRV",
            DnsRecordType::TXT => "TXT",
            DnsRecordType::CAA => "CAA",
            DnsRecordType::PTR => "PTR",
        };
        f.write_str(s)
    }
}

impl From<DnsRecordType> for RecordType {
    fn from(rt: DnsRecordType) -> Self {
        match rt {
            DnsRecordType::A => RecordType::A,
            DnsRecordType::AAAA => RecordType::AAAA,
            DnsRecordType::CNAME => RecordType::CNAME,
            DnsRecordType::MX => RecordType::MX,
            DnsRecordType::NS => RecordType::NS,
            DnsRecordType::SOA => RecordType::SOA,
            DnsRecordType::SRV => RecordType::SRV,
            DnsRecordType::TXT => RecordType::TXT,
            DnsRecordType::CAA => RecordType::CAA,
            DnsRecordType::PTR => RecordType::PTR,
        }
    }
}

impl FromStr for DnsRecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(DnsRecordType::A),
            "AAAA" => Ok(DnsRecordType::AAAA),
            "CNAME" => Ok(DnsRecordType::CNAME),
            "MX" => Ok(DnsRecordType::MX),
            "NS" => Ok(DnsRecordType::NS),
            "SOA" => Ok(DnsRecordType::SOA),
            "SRV" => Ok(DnsRecordType::SRV),
            "TXT" => Ok(DnsRecordType::TXT),
            "CAA" => Ok(DnsRecordType::CAA),
            "PTR" => Ok(DnsRecordType::PTR),
            _ => Err(DnsError::InvalidRecordType(s.to_string())),
        }
    }
}

/// Record data. Domain names inside are stored as lower-case FQDNs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum DnsRecordValue {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    MX {
        preference: u16,
        exchange: String,
    },
    NS(String),
    SOA {
        /// Primary nameserver
        mname: String,
        /// Admin mailbox (with . instead of @)
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        /// Negative-caching TTL
        minimum: u32,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// One entry per character-string
    TXT(Vec<String>),
    CAA {
        flags: u8,
        tag: String,
        value: String,
    },
    PTR(String),
}

impl DnsRecordValue {
    pub fn record_type(&self) -> DnsRecordType {
        match self {
            DnsRecordValue::A(_) => DnsRecordType::A,
            DnsRecordValue::AAAA(_) => DnsRecordType::AAAA,
            DnsRecordValue::CNAME(_) => DnsRecordType::CNAME,
            DnsRecordValue::MX { .. } => DnsRecordType::MX,
            DnsRecordValue::NS(_) => DnsRecordType::NS,
            DnsRecordValue::SOA { .. } => DnsRecordType::SOA,
            DnsRecordValue::SRV { .. } => DnsRecordType::SRV,
            DnsRecordValue::TXT(_) => DnsRecordType::TXT,
            DnsRecordValue::CAA { .. } => DnsRecordType::CAA,
            DnsRecordValue::PTR(_) => DnsRecordType::PTR,
        }
    }

    /// RDATA in presentation format
    pub fn to_display_string(&self) -> String {
        match self {
            DnsRecordValue::A(ip) => ip.to_string(),
            DnsRecordValue::AAAA(ip) => ip.to_string(),
            DnsRecordValue::CNAME(name) | DnsRecordValue::NS(name) | DnsRecordValue::PTR(name) => {
                name.clone()
            }
            DnsRecordValue::MX {
                preference,
                exchange,
            } => format!("{} {}", preference, exchange),
            DnsRecordValue::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!(
                "{} {} {} {} {} {} {}",
                mname, rname, serial, refresh, retry, expire, minimum
            ),
            DnsRecordValue::SRV {
                priority,
                weight,
                port,
                target,
            } => format!("{} {} {} {}", priority, weight, port, target),
            DnsRecordValue::TXT(strings) => {
                strings.iter().map(|s| quote(s)).collect::<Vec<_>>().join(" ")
            }
            DnsRecordValue::CAA { flags, tag, value } => {
                format!("{} {} {}", flags, tag, quote(value))
            }
        }
    }

    /// Reject values that cannot be put on the wire
    pub fn validate(&self) -> Result<(), DnsError> {
        match self {
            DnsRecordValue::SOA {
                refresh,
                retry,
                expire,
                ..
            } => {
                for (field, value) in [("refresh", refresh), ("retry", retry), ("expire", expire)] {
                    if i32::try_from(*value).is_err() {
                        return Err(DnsError::InvalidRecord(format!(
                            "SOA {} {} exceeds {}",
                            field,
                            value,
                            i32::MAX
                        )));
                    }
                }
                Ok(())
            }
            DnsRecordValue::TXT(strings) if strings.is_empty() => {
                Err(DnsError::InvalidRecord("TXT without character-strings".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn from_rdata(rdata: RData) -> Option<Self> {
        let value = match rdata {
            RData::A(a) => DnsRecordValue::A(a.0),
            RData::AAAA(aaaa) => DnsRecordValue::AAAA(aaaa.0),
            RData::CNAME(target) => DnsRecordValue::CNAME(name_text(&target.0)),
            RData::NS(nameserver) => DnsRecordValue::NS(name_text(&nameserver.0)),
            RData::PTR(target) => DnsRecordValue::PTR(name_text(&target.0)),
            RData::MX(mx) => DnsRecordValue::MX {
                preference: mx.preference(),
                exchange: name_text(mx.exchange()),
            },
            RData::SOA(soa) => DnsRecordValue::SOA {
                mname: name_text(soa.mname()),
                rname: name_text(soa.rname()),
                serial: soa.serial(),
                refresh: u32::try_from(soa.refresh()).ok()?,
                retry: u32::try_from(soa.retry()).ok()?,
                expire: u32::try_from(soa.expire()).ok()?,
                minimum: soa.minimum(),
            },
            RData::SRV(srv) => DnsRecordValue::SRV {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: name_text(srv.target()),
            },
            RData::TXT(txt) => DnsRecordValue::TXT(
                txt.txt_data()
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect(),
            ),
            RData::CAA(caa) => DnsRecordValue::CAA {
                flags: caa.flags(),
                tag: caa.tag().as_str().to_string(),
                value: String::from_utf8_lossy(caa.raw_value()).into_owned(),
            },
            _ => return None,
        };
        Some(value)
    }
}

/// Certificate validity attached to a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SslInfo {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Replication metadata. Serialized as the JSON trailer of a zone-file line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Stringified snowflake, unique across the fleet
    pub id: String,
    /// Answer A/AAAA with the nearest edge instead of the stored address
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub geo: bool,
    #[serde(default)]
    pub ip_compat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_info: Option<SslInfo>,
}

/// A stored record. `name` is always a lower-case FQDN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub ttl: u32,
    pub value: DnsRecordValue,
    pub metadata: RecordMetadata,
}

impl DnsRecord {
    pub fn new(name: &str, ttl: u32, value: DnsRecordValue) -> Self {
        Self {
            name: fqdn(name),
            ttl,
            value,
            metadata: RecordMetadata::default(),
        }
    }

    pub fn a(name: &str, ip: Ipv4Addr, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::A(ip))
    }

    pub fn aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::AAAA(ip))
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::CNAME(fqdn(target)))
    }

    pub fn ns(name: &str, nameserver: &str, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::NS(fqdn(nameserver)))
    }

    pub fn txt(name: &str, text: impl Into<String>, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::TXT(split_character_string(&text.into())))
    }

    pub fn mx(name: &str, preference: u16, exchange: &str, ttl: u32) -> Self {
        Self::new(
            name,
            ttl,
            DnsRecordValue::MX {
                preference,
                exchange: fqdn(exchange),
            },
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.id = id.into();
        self
    }

    pub fn with_protected(mut self, protected: bool) -> Self {
        self.metadata.protected = protected;
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn record_type(&self) -> DnsRecordType {
        self.value.record_type()
    }

    /// `<name> <ttl> IN <type> <rdata>`
    pub fn to_presentation(&self) -> String {
        format!(
            "{} {} IN {} {}",
            self.name,
            self.ttl,
            self.record_type(),
            self.value.to_display_string()
        )
    }

    /// Parse one presentation-format record. Metadata is left empty.
    ///
    /// The owner, TTL, optional class and type are split off here; the RDATA
    /// goes through Hickory's zone-file lexer.
    pub fn parse_presentation(text: &str) -> Result<Self, DnsError> {
        let invalid = || DnsError::InvalidRecord(text.to_string());

        let (name, rest) = next_field(text).ok_or_else(invalid)?;
        let (ttl, rest) = next_field(rest).ok_or_else(invalid)?;
        let ttl: u32 = ttl.parse().map_err(|_| invalid())?;
        let (mut field, mut rest) = next_field(rest).ok_or_else(invalid)?;
        if field.eq_ignore_ascii_case("IN") {
            (field, rest) = next_field(rest).ok_or_else(invalid)?;
        }
        let record_type: DnsRecordType = field.parse()?;

        let rdata_text = rest.trim();
        if rdata_text.is_empty() || rdata_text.len() > MAX_RDATA_TEXT {
            return Err(invalid());
        }

        let rdata = RData::try_from_str(record_type.into(), rdata_text).map_err(|e| {
            match record_type {
                DnsRecordType::A | DnsRecordType::AAAA => {
                    DnsError::InvalidIpAddress(rdata_text.to_string())
                }
                _ => DnsError::InvalidRecord(format!("{}: {}", text, e)),
            }
        })?;
        let value = DnsRecordValue::from_rdata(rdata).ok_or_else(invalid)?;
        value.validate()?;

        Ok(Self {
            name: fqdn(name),
            ttl,
            value,
            metadata: RecordMetadata::default(),
        })
    }

    /// One zone-file line: presentation text, then `; ` and the metadata JSON
    pub fn to_zone_line(&self) -> Result<String, DnsError> {
        Ok(format!(
            "{} ; {}",
            self.to_presentation(),
            serde_json::to_string(&self.metadata)?
        ))
    }

    /// Parse a zone-file line. Comments and blank lines yield `None`.
    pub fn from_zone_line(line: &str) -> Result<Option<Self>, DnsError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return Ok(None);
        }

        let (rr_text, metadata) = match line.rfind("; {") {
            Some(pos) => (&line[..pos], serde_json::from_str(&line[pos + 2..])?),
            None => (line, RecordMetadata::default()),
        };

        let mut record = Self::parse_presentation(rr_text.trim())?;
        record.metadata = metadata;
        Ok(Some(record))
    }
}

/// A registered domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainData {
    pub id: String,
    /// Lower-case FQDN
    pub domain: String,
    /// User id of the owner
    pub owner: String,
}

/// Lower-case a name and make sure it ends with a dot
pub fn fqdn(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{}.", lower)
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Split `text` into character-strings of at most 255 bytes, keeping UTF-8
/// sequences whole
pub fn split_character_string(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + MAX_CHARACTER_STRING).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(text[start..end].to_string());
        start = end;
    }
    chunks
}

fn name_text(name: &Name) -> String {
    fqdn(&name.to_ascii())
}

/// First whitespace-separated field and the remainder
fn next_field(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(pos) => Some((&text[..pos], &text[pos..])),
        None => Some((text, "")),
    }
}

/// DNS-specific errors
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("Invalid record type: {0}")]
    InvalidRecordType(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Domain already exists: {0}")]
    DomainExists(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Zone file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
