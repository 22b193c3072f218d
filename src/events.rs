//! Named Event Buses
//!
//! A bus fans events out to subscribers keyed by numeric event type. Each
//! subscriber owns a bounded channel drained by its own task; `publish`
//! awaits every send, so a slow subscriber back-pressures the publisher and
//! nothing is dropped. Subscribers registered after a publication do not see
//! it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dns::DnsRecord;
use crate::lock_utils::lock_or_recover;

/// Record, domain and service events
pub const DNS_BUS: &str = "dns";
/// Certificate events
pub const SSL_BUS: &str = "ssl";
/// Inbound `EventTransmission` packets before they are routed to their bus
pub const EVENT_TRANSMISSION_BUS: &str = "event_transmission_packet";

/// Buses whose events cross the master/node session
pub const REPLICATED_BUSES: [&str; 2] = [DNS_BUS, SSL_BUS];

pub const ADD_RECORD: u32 = 1;
pub const REMOVE_RECORD: u32 = 2;
pub const DNS_SERVICE_INITIALIZED: u32 = 3;
pub const CERTIFICATE_ISSUED: u32 = 4;
pub const EVENT_TRANSMISSION: u32 = 13;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event payload encode failed: {0}")]
    Encode(String),

    #[error("event payload decode failed: {0}")]
    Decode(String),
}

/// One bus event. `data` is a CBOR document whose shape depends on
/// `event_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: u32,
    /// Unix milliseconds
    pub fired_at: i64,
    /// Key of the node that originated the event
    pub fired_by: String,
    pub data: Vec<u8>,
}

impl Event {
    pub fn new<T: Serialize>(
        event_type: u32,
        fired_by: &str,
        payload: &T,
    ) -> Result<Self, EventError> {
        let mut data = Vec::new();
        ciborium::into_writer(payload, &mut data).map_err(|e| EventError::Encode(e.to_string()))?;
        Ok(Self {
            event_type,
            fired_at: now_millis(),
            fired_by: fired_by.to_string(),
            data,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        ciborium::from_reader(&self.data[..]).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Payload of `ADD_RECORD`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAdded {
    /// Owning domain FQDN
    pub domain: String,
    pub record: DnsRecord,
}

/// Payload of `REMOVE_RECORD`. `record` is the removed record so listeners
/// can tell which name and type went away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRemoved {
    pub id: String,
    pub domain: String,
    pub record: Option<DnsRecord>,
}

/// Payload of `DNS_SERVICE_INITIALIZED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInitialized {
    pub udp_addr: String,
    pub tcp_addr: String,
}

/// Payload of `CERTIFICATE_ISSUED`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateIssued {
    pub names: Vec<String>,
    pub chain_pem: String,
    pub key_pem: String,
    /// File stem under `certs/` (`<fqdn>` or `san_<hash>`)
    pub file_stem: String,
    /// Per-domain stems the new certificate supersedes
    pub replaces: Vec<String>,
}

#[derive(Default)]
struct Subscribers {
    by_type: HashMap<u32, Vec<mpsc::Sender<Event>>>,
    all: Vec<mpsc::Sender<Event>>,
}

/// A named pub/sub channel
pub struct EventBus {
    name: String,
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive every event of `event_type` published from now on
    pub fn subscribe(&self, event_type: u32) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        lock_or_recover(&self.subscribers, "bus subscribers")
            .by_type
            .entry(event_type)
            .or_default()
            .push(tx);
        rx
    }

    /// Receive every event published from now on, whatever its type
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        lock_or_recover(&self.subscribers, "bus subscribers").all.push(tx);
        rx
    }

    /// Run `handler` on a dedicated task for every event of `event_type`
    pub fn on<F, Fut>(&self, event_type: u32, handler: F) -> JoinHandle<()>
    where
        F: Fn(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe(event_type);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event).await;
            }
        })
    }

    /// Deliver `event` to every matching subscriber, in subscription order.
    ///
    /// Returns the number of subscribers reached. Subscribers whose receiver
    /// was dropped are pruned.
    pub async fn publish(&self, event: Event) -> usize {
        let targets: Vec<mpsc::Sender<Event>> = {
            let subs = lock_or_recover(&self.subscribers, "bus subscribers");
            subs.by_type
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut closed = false;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                closed = true;
            }
        }

        if closed {
            let mut subs = lock_or_recover(&self.subscribers, "bus subscribers");
            for senders in subs.by_type.values_mut() {
                senders.retain(|tx| !tx.is_closed());
            }
            subs.all.retain(|tx| !tx.is_closed());
            warn!("Pruned closed subscribers on bus '{}'", self.name);
        }

        debug!(
            "Published event type {} on '{}' to {} subscriber(s)",
            event.event_type, self.name, delivered
        );
        delivered
    }
}

/// Process-wide set of named buses, created on first use
#[derive(Clone, Default)]
pub struct EventBuses {
    buses: Arc<Mutex<HashMap<String, Arc<EventBus>>>>,
}

impl EventBuses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self, name: &str) -> Arc<EventBus> {
        let mut buses = lock_or_recover(&self.buses, "event buses");
        Arc::clone(
            buses
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(EventBus::new(name))),
        )
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_typed_delivery() {
        let bus = EventBus::new(DNS_BUS);
        let mut adds = bus.subscribe(ADD_RECORD);
        let mut removes = bus.subscribe(REMOVE_RECORD);

        let event = Event::new(ADD_RECORD, "edge-a", &"payload").unwrap();
        assert_eq!(bus.publish(event.clone()).await, 1);

        assert_eq!(adds.recv().await.unwrap(), event);
        assert!(removes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publication_order_preserved() {
        let bus = EventBus::new(DNS_BUS);
        let mut rx = bus.subscribe_all();

        for i in 0..10u32 {
            bus.publish(Event::new(ADD_RECORD, "edge-a", &i).unwrap()).await;
        }
        for i in 0..10u32 {
            let value: u32 = rx.recv().await.unwrap().decode().unwrap();
            assert_eq!(value, i);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_prior_events() {
        let bus = EventBus::new(SSL_BUS);
        bus.publish(Event::new(CERTIFICATE_ISSUED, "edge-a", &1u8).unwrap()).await;
        let mut rx = bus.subscribe(CERTIFICATE_ISSUED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_back_pressures() {
        let bus = Arc::new(EventBus::new(DNS_BUS));
        let mut rx = bus.subscribe(ADD_RECORD);

        let publisher = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                for i in 0..(SUBSCRIBER_CAPACITY as u32 + 10) {
                    bus.publish(Event::new(ADD_RECORD, "edge-a", &i).unwrap()).await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        let mut received = 0;
        while received < SUBSCRIBER_CAPACITY + 10 {
            rx.recv().await.unwrap();
            received += 1;
        }
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_task() {
        let bus = EventBus::new(DNS_BUS);
        let (tx, mut seen) = mpsc::channel(4);
        bus.on(DNS_SERVICE_INITIALIZED, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.fired_by).await;
            }
        });

        bus.publish(Event::new(DNS_SERVICE_INITIALIZED, "edge-b", &()).unwrap()).await;
        assert_eq!(seen.recv().await.unwrap(), "edge-b");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new(DNS_BUS);
        drop(bus.subscribe(ADD_RECORD));
        assert_eq!(bus.publish(Event::new(ADD_RECORD, "edge-a", &()).unwrap()).await, 0);
        assert_eq!(bus.publish(Event::new(ADD_RECORD, "edge-a", &()).unwrap()).await, 0);
    }

    #[test]
    fn test_registry_returns_same_bus() {
        let buses = EventBuses::new();
        assert!(Arc::ptr_eq(&buses.bus(DNS_BUS), &buses.bus(DNS_BUS)));
        assert!(!Arc::ptr_eq(&buses.bus(DNS_BUS), &buses.bus(SSL_BUS)));
    }
}
