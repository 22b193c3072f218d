//! Wired DNS Infrastructure
//!
//! Authoritative DNS for the edge fleet. Every node holds the full record set
//! in memory and answers queries for protected hostnames with the address of
//! the edge node nearest to the client.
//!
//! ## Architecture
//!
//! ```text
//! Client → DNS Query → DnsServer ─→ ZoneStore (label trie + indexes)
//!                          │
//!                          └─→ GeoResolver (protected A/AAAA only)
//!
//! RecordService → ZoneStore → zones/<domain>.zone
//!        │
//!        └─→ dns bus → master → peer nodes
//! ```
//!
//! ## Components
//!
//! - `dns_types`: record types, metadata and zone-line format
//! - `dns_config`: listener addresses, TCP limits, default nameservers
//! - `zone_store`: in-memory trie with per-domain write ordering
//! - `zone_file`: append/rewrite persistence of zones and domains
//! - `geo_resolver`: nearest attached listener by great-circle distance
//! - `dns_server`: UDP/TCP server using Hickory's wire codec

pub mod dns_config;
pub mod dns_server;
pub mod dns_types;
pub mod geo_resolver;
pub mod zone_file;
pub mod zone_store;

pub use dns_config::*;
pub use dns_server::*;
pub use dns_types::*;
pub use geo_resolver::*;
pub use zone_file::*;
pub use zone_store::*;
