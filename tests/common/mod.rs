//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use wired_node::dns::GeoResolver;
use wired_node::events::EventBuses;
use wired_node::nodes::NodeInfo;
use wired_node::protocol::keys::MASTER_KEY_NAME;
use wired_node::protocol::{KeyStore, Master, MasterConfig, NodeClient, NodeClientConfig};

/// Self-signed certificate for `names` (first one as CN) and its PKCS#8 key
pub fn self_signed(names: &[&str], days: u32) -> (String, String) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, names[0]).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = Asn1Integer::from_bn(&BigNum::from_u32(1).unwrap()).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(days).unwrap()).unwrap();
    let mut san = SubjectAlternativeName::new();
    for n in names {
        san.dns(n);
    }
    let san = san.build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let chain = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();
    let key = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (chain, key)
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub struct RunningMaster {
    pub master: Arc<Master>,
    pub addr: SocketAddr,
    pub buses: EventBuses,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

/// Master on an ephemeral port with its key in `keys_dir`
pub async fn start_master(keys_dir: &Path) -> RunningMaster {
    let keys = Arc::new(KeyStore::open(keys_dir, MASTER_KEY_NAME).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let buses = EventBuses::new();
    let master = Arc::new(Master::new(MasterConfig::default(), keys, buses.clone()));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let running = Arc::clone(&master);
    let task = tokio::spawn(async move {
        running.run(listener, shutdown_rx).await.unwrap();
    });

    RunningMaster {
        master,
        addr,
        buses,
        shutdown,
        task,
    }
}

pub struct RunningNode {
    pub client: Arc<NodeClient>,
    pub buses: EventBuses,
    pub geo: Arc<GeoResolver>,
    pub task: JoinHandle<()>,
}

/// Node client for `info` connected to `master`; returns once authenticated
pub async fn start_node(keys_dir: &Path, master: SocketAddr, info: NodeInfo) -> RunningNode {
    let keys = Arc::new(KeyStore::open(keys_dir, &info.key).unwrap());
    let buses = EventBuses::new();
    let geo = Arc::new(GeoResolver::new());

    let mut config = NodeClientConfig::new(master.to_string(), info);
    config.reconnect_delay = Duration::from_millis(100);
    let client = Arc::new(NodeClient::new(config, keys, Arc::clone(&geo), buses.clone()));

    let running = Arc::clone(&client);
    let task = tokio::spawn(async move {
        let _ = running.run().await;
    });

    tokio::time::timeout(Duration::from_secs(10), client.link().wait_connected())
        .await
        .expect("node did not authenticate");

    RunningNode {
        client,
        buses,
        geo,
        task,
    }
}
