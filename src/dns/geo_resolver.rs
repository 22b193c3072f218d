//! Geographic DNS Resolver
//!
//! Picks, for a protected A/AAAA answer, the listener address of the attached
//! node that is closest to the client. The client is located through a
//! [`GeoLookup`] (MaxMind in production); candidates are every attached
//! node's listeners of the requested address family, kept in the order the
//! nodes were attached so distance ties go to the earliest one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::nodes::{Location, NodeInfo};

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GeoError {
    #[error("no {0} listener attached")]
    NoCandidate(AddressFamily),

    #[error("GeoIP database not found: {0}")]
    DatabaseNotFound(String),

    #[error("GeoIP database error: {0}")]
    Database(String),

    #[error("GeoIP lookup error: {0}")]
    Lookup(String),
}

/// Address family requested by the query type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_))
        )
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// What a lookup knows about an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub ip: IpAddr,
    pub location: Location,
    pub country: Option<String>,
    pub asn: Option<u32>,
}

/// IP to location source
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

/// Great-circle distance in kilometres
pub fn haversine_distance(a: Location, b: Location) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone)]
struct Listener {
    node_key: String,
    ip: IpAddr,
    location: Location,
}

/// Nearest-listener selection over the attached nodes
pub struct GeoResolver {
    lookup: Option<Arc<dyn GeoLookup>>,
    default_location: Location,
    listeners: RwLock<Vec<Listener>>,
}

impl Default for GeoResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoResolver {
    pub fn new() -> Self {
        Self {
            lookup: None,
            default_location: Location::default(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn GeoLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Location assumed for clients the lookup cannot place
    pub fn with_default_location(mut self, location: Location) -> Self {
        self.default_location = location;
        self
    }

    /// Resolve a client address to coordinates
    pub fn locate(&self, client_ip: IpAddr) -> Location {
        if let Some(lookup) = &self.lookup {
            match lookup.lookup(client_ip) {
                Ok(info) => return info.location,
                Err(e) => debug!("GeoIP lookup failed for {}: {}", client_ip, e),
            }
        }
        self.default_location
    }

    /// Add (or replace) a node's listeners at the end of the candidate list
    pub async fn attach_node(&self, node: &NodeInfo) {
        let mut listeners = self.listeners.write().await;
        listeners.retain(|l| l.node_key != node.key);
        listeners.extend(node.listeners.iter().map(|ip| Listener {
            node_key: node.key.clone(),
            ip: *ip,
            location: node.location,
        }));
    }

    pub async fn detach_node(&self, key: &str) {
        self.listeners.write().await.retain(|l| l.node_key != key);
    }

    /// Replace all candidates with the listeners of `nodes`, in order
    pub async fn reset(&self, nodes: &[NodeInfo]) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();
        for node in nodes {
            listeners.extend(node.listeners.iter().map(|ip| Listener {
                node_key: node.key.clone(),
                ip: *ip,
                location: node.location,
            }));
        }
    }

    /// Candidate addresses in iteration order
    pub async fn listeners(&self) -> Vec<(String, IpAddr)> {
        self.listeners
            .read()
            .await
            .iter()
            .map(|l| (l.node_key.clone(), l.ip))
            .collect()
    }

    /// Listener closest to `client_ip`
    pub async fn nearest(
        &self,
        client_ip: IpAddr,
        family: AddressFamily,
    ) -> Result<IpAddr, GeoError> {
        let location = self.locate(client_ip);
        self.nearest_to(location, family).await
    }

    /// Listener closest to `location`; the first one wins a tie
    pub async fn nearest_to(
        &self,
        location: Location,
        family: AddressFamily,
    ) -> Result<IpAddr, GeoError> {
        let listeners = self.listeners.read().await;
        let mut best: Option<(&Listener, f64)> = None;
        for listener in listeners.iter().filter(|l| family.matches(&l.ip)) {
            let distance = haversine_distance(location, listener.location);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((listener, distance)),
            }
        }

        best.map(|(l, _)| l.ip).ok_or(GeoError::NoCandidate(family))
    }
}

/// Fixed table of address locations, used when no database is configured
#[derive(Debug, Default)]
pub struct StaticLookup {
    entries: HashMap<IpAddr, Location>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, location: Location) -> Self {
        self.entries.insert(ip, location);
        self
    }
}

impl GeoLookup for StaticLookup {
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        self.entries
            .get(&ip)
            .map(|location| GeoInfo {
                ip,
                location: *location,
                country: None,
                asn: None,
            })
            .ok_or_else(|| GeoError::Lookup(format!("{} not in table", ip)))
    }
}

/// MaxMind GeoLite2/GeoIP2 databases
pub struct MaxMindLookup {
    #[cfg(feature = "geoip")]
    city: maxminddb::Reader<Vec<u8>>,
    #[cfg(feature = "geoip")]
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

impl MaxMindLookup {
    /// Open the location database and, optionally, the ASN database.
    /// Unreadable databases are fatal at start-up.
    pub fn open(city_db: &Path, asn_db: Option<&Path>) -> Result<Self, GeoError> {
        for path in std::iter::once(city_db).chain(asn_db) {
            if !path.exists() {
                return Err(GeoError::DatabaseNotFound(path.display().to_string()));
            }
        }

        #[cfg(feature = "geoip")]
        {
            let city = maxminddb::Reader::open_readfile(city_db)
                .map_err(|e| GeoError::Database(e.to_string()))?;
            let asn = asn_db
                .map(maxminddb::Reader::open_readfile)
                .transpose()
                .map_err(|e| GeoError::Database(e.to_string()))?;
            info!("GeoIP database loaded from {}", city_db.display());
            Ok(Self { city, asn })
        }

        #[cfg(not(feature = "geoip"))]
        {
            let _ = asn_db;
            info!("Ignoring {}: built without the geoip feature", city_db.display());
            Err(GeoError::Database("built without the geoip feature".to_string()))
        }
    }
}

/// The parts of a GeoIP2/GeoLite2 City entry the resolver reads
#[cfg(feature = "geoip")]
#[derive(Deserialize)]
struct CityRecord {
    location: Option<LocationRecord>,
    country: Option<CountryRecord>,
}

#[cfg(feature = "geoip")]
#[derive(Deserialize)]
struct LocationRecord {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[cfg(feature = "geoip")]
#[derive(Deserialize)]
struct CountryRecord {
    iso_code: Option<String>,
}

#[cfg(feature = "geoip")]
#[derive(Deserialize)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
}

impl GeoLookup for MaxMindLookup {
    #[cfg(feature = "geoip")]
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        let city: CityRecord = self
            .city
            .lookup(ip)
            .and_then(|result| result.decode())
            .map_err(|e| GeoError::Lookup(e.to_string()))?
            .ok_or_else(|| GeoError::Lookup(format!("{} not in database", ip)))?;
        let location = city
            .location
            .map(|l| Location::new(l.latitude.unwrap_or(0.0), l.longitude.unwrap_or(0.0)))
            .unwrap_or_default();
        let country = city.country.and_then(|c| c.iso_code);

        let asn = self.asn.as_ref().and_then(|reader| {
            reader
                .lookup(ip)
                .and_then(|result| result.decode::<AsnRecord>())
                .ok()
                .flatten()
                .and_then(|a| a.autonomous_system_number)
        });

        Ok(GeoInfo {
            ip,
            location,
            country,
            asn,
        })
    }

    #[cfg(not(feature = "geoip"))]
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        Err(GeoError::Lookup(format!("no database for {}", ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str, ips: &[&str], lat: f64, lon: f64) -> NodeInfo {
        NodeInfo::new(key)
            .with_listeners(ips.iter().map(|ip| ip.parse().unwrap()).collect())
            .with_location(Location::new(lat, lon))
    }

    async fn three_continents() -> GeoResolver {
        let resolver = GeoResolver::new();
        resolver.attach_node(&node("equator", &["192.0.2.1"], 0.0, 0.0)).await;
        resolver.attach_node(&node("new-york", &["192.0.2.2"], 40.0, -74.0)).await;
        resolver.attach_node(&node("munich", &["192.0.2.3"], 48.0, 11.0)).await;
        resolver
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to London is roughly 5570 km
        let d = haversine_distance(
            Location::new(40.7128, -74.0060),
            Location::new(51.5074, -0.1278),
        );
        assert!((d - 5570.0).abs() < 30.0, "got {}", d);
        assert_eq!(haversine_distance(Location::new(1.0, 2.0), Location::new(1.0, 2.0)), 0.0);
    }

    #[tokio::test]
    async fn test_nearest_listener_by_coordinates() {
        let resolver = three_continents().await;
        let pick = |lat, lon| resolver.nearest_to(Location::new(lat, lon), AddressFamily::V4);

        assert_eq!(pick(52.0, 13.0).await.unwrap(), "192.0.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(pick(40.7, -74.0).await.unwrap(), "192.0.2.2".parse::<IpAddr>().unwrap());
        assert_eq!(pick(0.0, 0.0).await.unwrap(), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_family_filter_and_no_candidate() {
        let resolver = three_continents().await;
        assert_eq!(
            resolver.nearest_to(Location::new(0.0, 0.0), AddressFamily::V6).await,
            Err(GeoError::NoCandidate(AddressFamily::V6))
        );

        resolver.attach_node(&node("v6-only", &["2001:db8::1"], 60.0, 10.0)).await;
        assert_eq!(
            resolver.nearest_to(Location::new(0.0, 0.0), AddressFamily::V6).await.unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_attached() {
        let resolver = GeoResolver::new();
        resolver.attach_node(&node("first", &["192.0.2.1"], 10.0, 10.0)).await;
        resolver.attach_node(&node("second", &["192.0.2.2"], 10.0, 10.0)).await;
        assert_eq!(
            resolver.nearest_to(Location::new(0.0, 0.0), AddressFamily::V4).await.unwrap(),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_detach_and_reattach() {
        let resolver = three_continents().await;
        resolver.detach_node("munich").await;
        assert_eq!(
            resolver.nearest_to(Location::new(52.0, 13.0), AddressFamily::V4).await.unwrap(),
            "192.0.2.2".parse::<IpAddr>().unwrap()
        );

        // Re-attach with a new address replaces rather than duplicates
        resolver.attach_node(&node("new-york", &["192.0.2.20"], 40.0, -74.0)).await;
        let keys: Vec<String> = resolver.listeners().await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["equator", "new-york"]);
    }

    #[tokio::test]
    async fn test_client_located_through_lookup() {
        let client: IpAddr = "203.0.113.7".parse().unwrap();
        let lookup = StaticLookup::new().with(client, Location::new(52.0, 13.0));
        let resolver = GeoResolver::new().with_lookup(Arc::new(lookup));
        resolver.attach_node(&node("new-york", &["192.0.2.2"], 40.0, -74.0)).await;
        resolver.attach_node(&node("munich", &["192.0.2.3"], 48.0, 11.0)).await;

        assert_eq!(
            resolver.nearest(client, AddressFamily::V4).await.unwrap(),
            "192.0.2.3".parse::<IpAddr>().unwrap()
        );
        // Unknown clients fall back to the default location (0, 0)
        assert_eq!(resolver.locate("198.51.100.1".parse().unwrap()), Location::default());
    }

    #[test]
    fn test_missing_database_is_reported() {
        let err = MaxMindLookup::open(Path::new("/nonexistent/GeoLite2-City.mmdb"), None)
            .err()
            .unwrap();
        assert!(matches!(err, GeoError::DatabaseNotFound(_)));
    }
}
