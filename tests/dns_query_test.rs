use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use wired_node::dns::{DnsConfig, DnsRecord, DnsRecordValue, DnsServer, GeoResolver, ZoneStore};
use wired_node::events::{EventBuses, ServiceInitialized, DNS_BUS, DNS_SERVICE_INITIALIZED};
use wired_node::nodes::{Location, NodeInfo};
use wired_node::snowflake::Snowflake;

struct TestServer {
    udp: SocketAddr,
    tcp: SocketAddr,
    store: Arc<ZoneStore>,
}

async fn start_server(geo: GeoResolver) -> TestServer {
    let store = Arc::new(ZoneStore::new(Arc::new(Snowflake::new(1).unwrap())));
    let soa = DnsRecord::new(
        "example.test.",
        3600,
        DnsRecordValue::SOA {
            mname: "ns1.wired.network.".to_string(),
            rname: "hostmaster.example.test.".to_string(),
            serial: 1,
            refresh: 3600,
            retry: 600,
            expire: 604800,
            minimum: 300,
        },
    );
    store.insert_record("example.test.", soa).await.unwrap();

    let buses = EventBuses::new();
    let mut ready = buses.bus(DNS_BUS).subscribe(DNS_SERVICE_INITIALIZED);

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp_addr = udp.local_addr().unwrap();
    let tcp_addr = tcp.local_addr().unwrap();

    let server = Arc::new(
        DnsServer::new(DnsConfig::default(), Arc::clone(&store), Arc::new(geo))
            .unwrap()
            .with_events(buses.clone(), "edge-a"),
    );
    tokio::spawn(async move {
        let _ = server.serve(udp, tcp).await;
    });

    let event = tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.fired_by, "edge-a");
    let started: ServiceInitialized = event.decode().unwrap();
    assert_eq!(started.udp_addr, udp_addr.to_string());

    TestServer {
        udp: udp_addr,
        tcp: tcp_addr,
        store,
    }
}

fn query(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut query = Message::new();
    query.set_id(id);
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
    query
}

async fn ask_udp(server: SocketAddr, message: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&message.to_vec().unwrap(), server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

async fn ask_tcp(stream: &mut TcpStream, message: &Message) -> Message {
    let bytes = message.to_vec().unwrap();
    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.unwrap();
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await.unwrap();
    Message::from_vec(&buf).unwrap()
}

#[tokio::test]
async fn test_udp_answer_and_nxdomain() {
    let server = start_server(GeoResolver::new()).await;
    server
        .store
        .insert_record(
            "example.test.",
            DnsRecord::a("www.example.test.", Ipv4Addr::new(10, 1, 2, 3), 120),
        )
        .await
        .unwrap();

    let response = ask_udp(server.udp, &query(7, "www.example.test.", RecordType::A)).await;
    assert_eq!(response.id(), 7);
    assert_eq!(response.message_type(), MessageType::Response);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.authoritative());
    assert!(!response.recursion_available());
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].ttl(), 120);
    assert_eq!(response.answers()[0].data(), &RData::A(rdata::A(Ipv4Addr::new(10, 1, 2, 3))));

    let response = ask_udp(server.udp, &query(8, "missing.example.test.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(response.name_servers()[0].record_type(), RecordType::SOA);

    let response = ask_udp(server.udp, &query(9, "elsewhere.invalid.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn test_large_answer_truncated_over_udp_and_complete_over_tcp() {
    let server = start_server(GeoResolver::new()).await;
    for i in 0..20 {
        server
            .store
            .insert_record(
                "example.test.",
                DnsRecord::txt(
                    "big.example.test.",
                    format!("v=spf1 include:relay-{:02}.example.test ~all", i),
                    300,
                ),
            )
            .await
            .unwrap();
    }

    let udp = ask_udp(server.udp, &query(21, "big.example.test.", RecordType::TXT)).await;
    assert!(udp.truncated());
    assert!(udp.answers().is_empty());
    assert_eq!(udp.queries().len(), 1);

    let mut stream = TcpStream::connect(server.tcp).await.unwrap();
    let tcp = ask_tcp(&mut stream, &query(22, "big.example.test.", RecordType::TXT)).await;
    assert!(!tcp.truncated());
    assert_eq!(tcp.answers().len(), 20);

    // The connection stays open for further queries
    let again = ask_tcp(&mut stream, &query(23, "example.test.", RecordType::SOA)).await;
    assert_eq!(again.id(), 23);
    assert_eq!(again.answers().len(), 1);
}

#[tokio::test]
async fn test_protected_host_answers_nearest_edge() {
    let geo = GeoResolver::new().with_default_location(Location::new(51.5, -0.1));
    geo.attach_node(
        &NodeInfo::new("edge-us")
            .with_listeners(vec!["192.0.2.10".parse().unwrap()])
            .with_location(Location::new(40.7, -74.0)),
    )
    .await;
    geo.attach_node(
        &NodeInfo::new("edge-eu")
            .with_listeners(vec!["198.51.100.20".parse().unwrap()])
            .with_location(Location::new(50.1, 8.7)),
    )
    .await;

    let server = start_server(geo).await;
    server
        .store
        .insert_record(
            "example.test.",
            DnsRecord::a("app.example.test.", Ipv4Addr::new(10, 9, 9, 9), 60).with_protected(true),
        )
        .await
        .unwrap();

    let response = ask_udp(server.udp, &query(31, "app.example.test.", RecordType::A)).await;
    assert_eq!(response.answers().len(), 1);
    let expected: IpAddr = "198.51.100.20".parse().unwrap();
    match response.answers()[0].data() {
        RData::A(a) => assert_eq!(IpAddr::V4(a.0), expected),
        other => panic!("unexpected answer {:?}", other),
    }
}
