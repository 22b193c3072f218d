//! Event replication across the master session
//!
//! Locally originated events on the replicated buses are wrapped into
//! `EventTransmission` packets and sent to the master, which fans them out.
//! Inbound transmissions arrive on the `event_transmission_packet` bus and
//! are republished on the bus they name. Every handler skips events whose
//! `fired_by` is the local key, so a node never re-applies its own change.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dns::{DnsError, DnsRecord, DomainData, IndexedRecord, ZoneStore};
use crate::events::{
    CertificateIssued, Event, EventBuses, RecordAdded, RecordRemoved, ADD_RECORD,
    CERTIFICATE_ISSUED, DNS_BUS, EVENT_TRANSMISSION_BUS, REMOVE_RECORD, REPLICATED_BUSES, SSL_BUS,
};
use crate::protocol::packets::{encode_payload, EventTransmission, PacketId};
use crate::protocol::session::MasterLink;
use crate::tls::CertStore;

/// Moves events between the local buses and the master session
pub struct Replicator {
    local_key: String,
    buses: EventBuses,
    link: MasterLink,
}

impl Replicator {
    pub fn new(local_key: impl Into<String>, buses: EventBuses, link: MasterLink) -> Self {
        Self {
            local_key: local_key.into(),
            buses,
            link,
        }
    }

    /// Start one forwarder per replicated bus and the inbound router
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(REPLICATED_BUSES.len() + 1);

        for bus_name in REPLICATED_BUSES {
            let mut rx = self.buses.bus(bus_name).subscribe_all();
            let replicator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    replicator.forward(bus_name, event).await;
                }
            }));
        }

        let mut rx = self.buses.bus(EVENT_TRANSMISSION_BUS).subscribe_all();
        let replicator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event.decode::<EventTransmission>() {
                    Ok(transmission) => {
                        replicator.deliver(transmission).await;
                    }
                    Err(e) => warn!("Undecodable event transmission: {}", e),
                }
            }
        }));

        info!("Replicating buses {:?} as '{}'", REPLICATED_BUSES, self.local_key);
        tasks
    }

    /// Send a locally fired event to the master. Returns whether it was sent.
    pub async fn forward(&self, bus_name: &str, event: Event) -> bool {
        if event.fired_by != self.local_key {
            return false;
        }

        let event_type = event.event_type;
        let packet = match encode_payload(
            PacketId::EventTransmission,
            &EventTransmission {
                event_bus_name: bus_name.to_string(),
                event,
            },
        ) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to encode event for '{}': {}", bus_name, e);
                return false;
            }
        };

        match self.link.send(&packet).await {
            Ok(()) => {
                debug!("Forwarded event type {} on '{}' to master", event_type, bus_name);
                true
            }
            Err(e) => {
                warn!(
                    "Event type {} on '{}' not replicated: {}",
                    event_type, bus_name, e
                );
                false
            }
        }
    }

    /// Republish an inbound transmission on its named bus. Returns whether it
    /// was published.
    pub async fn deliver(&self, transmission: EventTransmission) -> bool {
        let EventTransmission { event_bus_name, event } = transmission;
        if event.fired_by == self.local_key {
            debug!("Skipping own event type {} on '{}'", event.event_type, event_bus_name);
            return false;
        }
        if event_bus_name == EVENT_TRANSMISSION_BUS {
            warn!("Dropping transmission addressed to '{}'", event_bus_name);
            return false;
        }

        debug!(
            "Applying event type {} on '{}' from '{}'",
            event.event_type, event_bus_name, event.fired_by
        );
        self.buses.bus(&event_bus_name).publish(event).await;
        true
    }
}

/// Record-store mutations that announce themselves on the `dns` bus, and
/// the handler that applies the ones announced by other nodes
pub struct RecordService {
    store: Arc<ZoneStore>,
    buses: EventBuses,
    local_key: String,
    nameservers: Vec<String>,
}

impl RecordService {
    pub fn new(store: Arc<ZoneStore>, buses: EventBuses, local_key: impl Into<String>) -> Self {
        Self {
            store,
            buses,
            local_key: local_key.into(),
            nameservers: Vec::new(),
        }
    }

    /// Nameservers written as NS records into new domains
    pub fn with_nameservers(mut self, nameservers: Vec<String>) -> Self {
        self.nameservers = nameservers;
        self
    }

    pub fn store(&self) -> &Arc<ZoneStore> {
        &self.store
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    async fn announce<T: serde::Serialize>(&self, event_type: u32, payload: &T) {
        match Event::new(event_type, &self.local_key, payload) {
            Ok(event) => {
                self.buses.bus(DNS_BUS).publish(event).await;
            }
            Err(e) => warn!("Failed to build event type {}: {}", event_type, e),
        }
    }

    /// Insert or replace a record and announce it
    pub async fn create_record(
        &self,
        domain: &str,
        record: DnsRecord,
    ) -> Result<DnsRecord, DnsError> {
        let record = self.store.insert_record(domain, record).await?;
        self.announce(
            ADD_RECORD,
            &RecordAdded {
                domain: crate::dns::fqdn(domain),
                record: record.clone(),
            },
        )
        .await;
        Ok(record)
    }

    /// Delete a record by id and announce it
    pub async fn delete_record(&self, id: &str) -> Result<IndexedRecord, DnsError> {
        let removed = self.store.delete_record(id).await?;
        self.announce(
            REMOVE_RECORD,
            &RecordRemoved {
                id: id.to_string(),
                domain: removed.domain.clone(),
                record: Some(removed.record.clone()),
            },
        )
        .await;
        Ok(removed)
    }

    /// Register a domain; its default SOA and NS records are announced
    pub async fn create_domain(
        &self,
        domain: &str,
        owner: &str,
    ) -> Result<(DomainData, Vec<DnsRecord>), DnsError> {
        let (data, records) = self.store.create_domain(domain, owner, &self.nameservers).await?;
        for record in &records {
            self.announce(
                ADD_RECORD,
                &RecordAdded {
                    domain: data.domain.clone(),
                    record: record.clone(),
                },
            )
            .await;
        }
        Ok((data, records))
    }

    /// Apply a `dns` bus event fired by another node
    pub async fn apply(&self, event: &Event) -> Result<(), DnsError> {
        if event.fired_by == self.local_key {
            return Ok(());
        }

        match event.event_type {
            ADD_RECORD => {
                let added: RecordAdded = event
                    .decode()
                    .map_err(|e| DnsError::ServerError(e.to_string()))?;
                let record = self.store.insert_record(&added.domain, added.record).await?;
                debug!(
                    "Replicated {} ({}) from '{}'",
                    record.name, record.metadata.id, event.fired_by
                );
            }
            REMOVE_RECORD => {
                let removed: RecordRemoved = event
                    .decode()
                    .map_err(|e| DnsError::ServerError(e.to_string()))?;
                match self.store.delete_record(&removed.id).await {
                    Ok(_) => {
                        debug!("Replicated removal of {} from '{}'", removed.id, event.fired_by)
                    }
                    Err(DnsError::RecordNotFound(_)) => {
                        debug!("Replicated removal of unknown record {}", removed.id)
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply remote `dns` bus events for the life of the returned task
    pub fn follow(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.buses.bus(DNS_BUS).subscribe_all();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = service.apply(&event).await {
                    warn!(
                        "Failed to apply event type {} from '{}': {}",
                        event.event_type, event.fired_by, e
                    );
                }
            }
        })
    }
}

/// Install certificates issued elsewhere for the life of the returned task
pub fn follow_certificates(
    buses: &EventBuses,
    local_key: impl Into<String>,
    certs: Arc<CertStore>,
) -> JoinHandle<()> {
    let local_key = local_key.into();
    let mut rx = buses.bus(SSL_BUS).subscribe(CERTIFICATE_ISSUED);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event.fired_by == local_key {
                continue;
            }
            let issued: CertificateIssued = match event.decode() {
                Ok(issued) => issued,
                Err(e) => {
                    warn!("Undecodable certificate event: {}", e);
                    continue;
                }
            };
            match certs.store(&issued).await {
                Ok(names) => {
                    info!("Installed certificate for {:?} from '{}'", names, event.fired_by)
                }
                Err(e) => warn!("Failed to install certificate from '{}': {}", event.fired_by, e),
            }
        }
    })
}
