//! Wired DNS Server
//!
//! Authoritative UDP/TCP server on top of Hickory's wire codec. Answers come
//! from the in-memory zone trie; protected A/AAAA answers are rewritten to
//! the attached edge node closest to the client.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use hickory_proto::serialize::txt::RDataParser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::dns_config::DnsConfig;
use super::dns_types::{
    fqdn, split_character_string, DnsError, DnsRecord, DnsRecordType, DnsRecordValue,
};
use super::geo_resolver::{AddressFamily, GeoError, GeoResolver};
use super::zone_store::{ZoneReader, ZoneStore};
use crate::events::{Event, EventBuses, ServiceInitialized, DNS_BUS, DNS_SERVICE_INITIALIZED};

/// Maximum UDP DNS message size without EDNS
const MAX_UDP_SIZE: usize = 512;

/// Largest UDP payload we advertise or honour
const MAX_EDNS_SIZE: usize = 4096;

/// Maximum TCP DNS message size
const MAX_TCP_SIZE: usize = 65535;

/// Wired DNS Server
pub struct DnsServer {
    config: DnsConfig,
    store: Arc<ZoneStore>,
    geo: Arc<GeoResolver>,
    tcp_semaphore: Arc<Semaphore>,
    /// Bus set and local node key used to announce readiness
    events: Option<(EventBuses, String)>,
}

impl DnsServer {
    pub fn new(
        config: DnsConfig,
        store: Arc<ZoneStore>,
        geo: Arc<GeoResolver>,
    ) -> Result<Self, DnsError> {
        config.validate()?;
        let tcp_semaphore = Arc::new(Semaphore::new(config.tcp_limits.max_connections));

        Ok(Self {
            config,
            store,
            geo,
            tcp_semaphore,
            events: None,
        })
    }

    /// Publish `DNS_SERVICE_INITIALIZED` on the `dns` bus once listening
    pub fn with_events(mut self, buses: EventBuses, local_key: impl Into<String>) -> Self {
        self.events = Some((buses, local_key.into()));
        self
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// Bind the configured addresses and serve until an I/O error
    pub async fn run(self: Arc<Self>) -> Result<(), DnsError> {
        let udp = UdpSocket::bind(self.config.udp_addr).await.map_err(|e| {
            DnsError::ServerError(format!("Failed to bind UDP {}: {}", self.config.udp_addr, e))
        })?;
        let tcp = TcpListener::bind(self.config.tcp_addr).await.map_err(|e| {
            DnsError::ServerError(format!("Failed to bind TCP {}: {}", self.config.tcp_addr, e))
        })?;

        self.serve(udp, tcp).await
    }

    /// Serve on already-bound sockets
    pub async fn serve(self: Arc<Self>, udp: UdpSocket, tcp: TcpListener) -> Result<(), DnsError> {
        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;
        info!("DNS server listening on UDP {} and TCP {}", udp_addr, tcp_addr);

        if let Some((buses, local_key)) = &self.events {
            let payload = ServiceInitialized {
                udp_addr: udp_addr.to_string(),
                tcp_addr: tcp_addr.to_string(),
            };
            match Event::new(DNS_SERVICE_INITIALIZED, local_key, &payload) {
                Ok(event) => {
                    buses.bus(DNS_BUS).publish(event).await;
                }
                Err(e) => warn!("Failed to encode DNS service event: {}", e),
            }
        }

        tokio::select! {
            result = Arc::clone(&self).run_udp_server(udp) => {
                error!("UDP server stopped: {:?}", result);
                result
            }
            result = Arc::clone(&self).run_tcp_server(tcp) => {
                error!("TCP server stopped: {:?}", result);
                result
            }
        }
    }

    async fn run_udp_server(self: Arc<Self>, socket: UdpSocket) -> Result<(), DnsError> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_EDNS_SIZE];

        loop {
            let (len, addr) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| DnsError::ServerError(format!("UDP recv error: {}", e)))?;

            let query_bytes = buf[..len].to_vec();
            let socket = Arc::clone(&socket);
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                if let Err(e) = server.handle_udp_query(&socket, addr, &query_bytes).await {
                    debug!("UDP query error from {}: {}", addr, e);
                }
            });
        }
    }

    async fn handle_udp_query(
        &self,
        socket: &UdpSocket,
        addr: SocketAddr,
        query_bytes: &[u8],
    ) -> Result<(), DnsError> {
        let query = Message::from_vec(query_bytes)
            .map_err(|e| DnsError::ServerError(format!("Failed to parse query: {}", e)))?;
        if query.message_type() != MessageType::Query {
            return Ok(());
        }

        let response = self.build_response(&query, addr.ip()).await;
        let mut response_bytes = encode(&response)?;

        let limit = udp_payload_limit(&query);
        if response_bytes.len() > limit {
            debug!(
                "Truncating {} byte response to {} (limit {})",
                response_bytes.len(),
                addr,
                limit
            );
            response_bytes = encode(&truncated(&response))?;
        }

        socket
            .send_to(&response_bytes, addr)
            .await
            .map_err(|e| DnsError::ServerError(format!("Failed to send response: {}", e)))?;
        Ok(())
    }

    async fn run_tcp_server(self: Arc<Self>, listener: TcpListener) -> Result<(), DnsError> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| DnsError::ServerError(format!("TCP accept error: {}", e)))?;

            let permit = match Arc::clone(&self.tcp_semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("TCP connection limit reached, rejecting {}", addr);
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp_connection(stream, addr).await {
                    debug!("TCP connection error from {}: {}", addr, e);
                }
                drop(permit);
            });
        }
    }

    /// Serve length-prefixed queries until the peer closes or idles out
    async fn handle_tcp_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), DnsError> {
        let idle = Duration::from_secs(self.config.tcp_limits.idle_timeout_secs);

        loop {
            let mut len_buf = [0u8; 2];
            match timeout(idle, stream.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }

            let msg_len = u16::from_be_bytes(len_buf) as usize;
            let mut msg_buf = vec![0u8; msg_len];
            match timeout(idle, stream.read_exact(&mut msg_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }

            let query = match Message::from_vec(&msg_buf) {
                Ok(q) => q,
                Err(e) => {
                    debug!("Failed to parse TCP query from {}: {}", addr, e);
                    continue;
                }
            };

            let response = self.build_response(&query, addr.ip()).await;
            let response_bytes = encode(&response)?;
            if response_bytes.len() > MAX_TCP_SIZE {
                warn!("Dropping oversized TCP response to {}", addr);
                break;
            }

            let len_prefix = (response_bytes.len() as u16).to_be_bytes();
            stream.write_all(&len_prefix).await?;
            stream.write_all(&response_bytes).await?;
        }

        Ok(())
    }

    /// Answer `query` as seen from the transport address `src`
    pub async fn build_response(&self, query: &Message, src: IpAddr) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(query.op_code());
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(false);
        response.set_checking_disabled(query.checking_disabled());
        response.set_authoritative(true);

        for question in query.queries() {
            response.add_query(question.clone());
        }

        if query.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
            return response;
        }

        let subnet = client_subnet(query);
        let client_ip = subnet.as_ref().map(|s| s.addr()).unwrap_or(src);

        let reader = self.store.reader().await;
        let mut code = ResponseCode::NoError;
        for question in query.queries() {
            let answered = self.answer_question(&reader, question, client_ip, &mut response).await;
            if severity(answered) > severity(code) {
                code = answered;
            }
        }
        drop(reader);
        response.set_response_code(code);

        if query.extensions().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(MAX_EDNS_SIZE as u16);
            if let Some(subnet) = subnet {
                edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
                    subnet.addr(),
                    subnet.source_prefix(),
                    subnet.source_prefix(),
                )));
            }
            response.set_edns(edns);
        }

        response
    }

    async fn answer_question(
        &self,
        reader: &ZoneReader<'_>,
        question: &Query,
        client_ip: IpAddr,
        response: &mut Message,
    ) -> ResponseCode {
        let qname = fqdn(&question.name().to_ascii());
        let qtype = question.query_type();

        let Some(zone) = reader.find_zone(&qname) else {
            debug!("Refusing query for {} (no zone)", qname);
            return ResponseCode::Refused;
        };

        let mut answers = Vec::new();
        let mut additionals = Vec::new();

        for record in reader.records_at(&qname) {
            if type_matches(qtype, record) {
                self.push_answer(record, question.name(), client_ip, &mut answers, &mut additionals)
                    .await;
            }
        }

        if qtype != RecordType::CNAME && qtype != RecordType::ANY {
            let mut visited = HashSet::from([qname.clone()]);
            let mut current = qname.clone();
            let mut owner = question.name().clone();

            for _ in 0..self.config.max_cname_depth {
                let Some(link) = reader
                    .records_at(&current)
                    .iter()
                    .find(|r| r.record_type() == DnsRecordType::CNAME)
                else {
                    break;
                };
                let DnsRecordValue::CNAME(target) = &link.value else {
                    break;
                };
                if let Some(rr) = to_hickory_record(link, owner.clone()) {
                    answers.push(rr);
                }

                if !visited.insert(target.clone()) {
                    debug!("CNAME loop at {}", target);
                    break;
                }
                let Ok(target_name) = Name::from_ascii(target) else {
                    break;
                };
                for record in reader.records_at(target) {
                    if type_matches(qtype, record) {
                        self.push_answer(
                            record,
                            &target_name,
                            client_ip,
                            &mut answers,
                            &mut additionals,
                        )
                        .await;
                    }
                }
                current = target.clone();
                owner = target_name;
            }
        }

        let code = if !answers.is_empty() {
            ResponseCode::NoError
        } else {
            let exists = reader.name_exists(&qname);
            if let Some(soa) = reader.soa(zone) {
                if let DnsRecordValue::SOA { minimum, .. } = &soa.value {
                    let ttl = if exists { soa.ttl.min(*minimum) } else { *minimum };
                    if let Ok(apex) = Name::from_ascii(&soa.name) {
                        if let Some(mut rr) = to_hickory_record(soa, apex) {
                            rr.set_ttl(ttl);
                            response.add_name_server(rr);
                        }
                    }
                }
            }
            if exists {
                ResponseCode::NoError
            } else {
                ResponseCode::NXDomain
            }
        };

        for rr in answers {
            response.add_answer(rr);
        }
        for rr in additionals {
            response.add_additional(rr);
        }
        code
    }

    /// Emit `record` under `owner`, rewriting protected addresses to the
    /// nearest edge listener
    async fn push_answer(
        &self,
        record: &DnsRecord,
        owner: &Name,
        client_ip: IpAddr,
        answers: &mut Vec<Record>,
        additionals: &mut Vec<Record>,
    ) {
        let family = match (&record.value, record.metadata.protected) {
            (DnsRecordValue::A(_), true) => AddressFamily::V4,
            (DnsRecordValue::AAAA(_), true) => AddressFamily::V6,
            _ => {
                if let Some(rr) = to_hickory_record(record, owner.clone()) {
                    answers.push(rr);
                }
                return;
            }
        };

        match self.geo.nearest(client_ip, family).await {
            Ok(IpAddr::V4(ip)) => {
                answers.push(Record::from_rdata(owner.clone(), record.ttl, RData::A(rdata::A(ip))));
            }
            Ok(IpAddr::V6(ip)) => {
                let rdata = RData::AAAA(rdata::AAAA(ip));
                answers.push(Record::from_rdata(owner.clone(), record.ttl, rdata));
            }
            Err(e) => {
                debug!("No geo answer for {} ({}): {}", record.name, client_ip, e);
                additionals.push(diagnostic_record(owner, &e));
            }
        }
    }
}

fn type_matches(qtype: RecordType, record: &DnsRecord) -> bool {
    match convert_record_type(qtype) {
        Some(wanted) => record.record_type() == wanted,
        None => qtype == RecordType::ANY,
    }
}

fn convert_record_type(rt: RecordType) -> Option<DnsRecordType> {
    match rt {
        RecordType::A => Some(DnsRecordType::A),
        RecordType::AAAA => Some(DnsRecordType::AAAA),
        RecordType::CNAME => Some(DnsRecordType::CNAME),
        RecordType::MX => Some(DnsRecordType::MX),
        RecordType::TXT => Some(DnsRecordType::TXT),
        RecordType::NS => Some(DnsRecordType::NS),
        RecordType::SOA => Some(DnsRecordType::SOA),
        RecordType::CAA => Some(DnsRecordType::CAA),
        RecordType::SRV => Some(DnsRecordType::SRV),
        RecordType::PTR => Some(DnsRecordType::PTR),
        _ => None,
    }
}

fn client_subnet(query: &Message) -> Option<ClientSubnet> {
    match query.extensions().as_ref()?.options().get(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => Some(subnet.clone()),
        _ => None,
    }
}

/// Rank of an answer code when several questions share one response
fn severity(code: ResponseCode) -> u8 {
    match code {
        ResponseCode::NoError => 0,
        ResponseCode::NXDomain => 1,
        _ => 2,
    }
}

fn diagnostic_record(owner: &Name, error: &GeoError) -> Record {
    let text = format!("wired: {}", error);
    Record::from_rdata(owner.clone(), 0, RData::TXT(rdata::TXT::new(split_character_string(&text))))
}

fn udp_payload_limit(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map(|edns| (edns.max_payload() as usize).clamp(MAX_UDP_SIZE, MAX_EDNS_SIZE))
        .unwrap_or(MAX_UDP_SIZE)
}

/// Answerless copy of `response` with TC set
fn truncated(response: &Message) -> Message {
    let mut out = Message::new();
    out.set_id(response.id());
    out.set_message_type(MessageType::Response);
    out.set_op_code(response.op_code());
    out.set_authoritative(response.authoritative());
    out.set_recursion_desired(response.recursion_desired());
    out.set_response_code(response.response_code());
    out.set_truncated(true);
    for query in response.queries() {
        out.add_query(query.clone());
    }
    if let Some(edns) = response.extensions() {
        out.set_edns(edns.clone());
    }
    out
}

fn encode(message: &Message) -> Result<Vec<u8>, DnsError> {
    message
        .to_vec()
        .map_err(|e| DnsError::ServerError(format!("Failed to serialize response: {}", e)))
}

/// Convert a stored record to a Hickory record owned by `name`
fn to_hickory_record(record: &DnsRecord, name: Name) -> Option<Record> {
    let rdata = match &record.value {
        DnsRecordValue::A(ip) => RData::A(rdata::A(*ip)),
        DnsRecordValue::AAAA(ip) => RData::AAAA(rdata::AAAA(*ip)),
        DnsRecordValue::CNAME(target) => RData::CNAME(rdata::CNAME(Name::from_ascii(target).ok()?)),
        DnsRecordValue::MX { preference, exchange } => {
            RData::MX(rdata::MX::new(*preference, Name::from_ascii(exchange).ok()?))
        }
        DnsRecordValue::NS(nameserver) => RData::NS(rdata::NS(Name::from_ascii(nameserver).ok()?)),
        DnsRecordValue::PTR(target) => RData::PTR(rdata::PTR(Name::from_ascii(target).ok()?)),
        DnsRecordValue::TXT(strings) => RData::TXT(rdata::TXT::new(
            strings.iter().flat_map(|s| split_character_string(s)).collect(),
        )),
        DnsRecordValue::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => RData::SOA(rdata::SOA::new(
            Name::from_ascii(mname).ok()?,
            Name::from_ascii(rname).ok()?,
            *serial,
            i32::try_from(*refresh).ok()?,
            i32::try_from(*retry).ok()?,
            i32::try_from(*expire).ok()?,
            *minimum,
        )),
        DnsRecordValue::SRV {
            priority,
            weight,
            port,
            target,
        } => RData::SRV(rdata::SRV::new(
            *priority,
            *weight,
            *port,
            Name::from_ascii(target).ok()?,
        )),
        DnsRecordValue::CAA { .. } => {
            match RData::try_from_str(RecordType::CAA, &record.value.to_display_string()) {
                Ok(rdata @ RData::CAA(_)) => rdata,
                _ => return None,
            }
        }
    };

    Some(Record::from_rdata(name, record.ttl, rdata))
}
