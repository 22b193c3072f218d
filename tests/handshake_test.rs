mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::net::TcpListener;

use common::{eventually, start_master, start_node};
use wired_node::config::NodeSection;
use wired_node::dns::{AddressFamily, GeoResolver};
use wired_node::events::EventBuses;
use wired_node::nodes::{Location, NodeInfo};
use wired_node::protocol::keys::MASTER_KEY_NAME;
use wired_node::protocol::packets::{
    decode_payload, ChallengeFinish, ChallengeResult, ChallengeStart, Login, PacketId,
};
use wired_node::protocol::session::split;
use wired_node::protocol::{AuthError, KeyStore, NodeClient, NodeClientConfig, ProtocolError};

#[tokio::test]
async fn test_node_attaches_to_master() {
    let dir = tempdir().unwrap();
    let master = start_master(dir.path()).await;

    let node = start_node(dir.path(), master.addr, NodeInfo::new("edge-a")).await;

    assert!(master.master.nodes().contains("edge-a").await);
    assert_eq!(master.master.pending_challenges().await, 0);
    // The snapshot includes the newcomer itself
    assert!(node.client.nodes().contains("edge-a").await);

    master.shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), master.task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_login_carries_binary_hash() {
    let dir = tempdir().unwrap();
    let master = start_master(dir.path()).await;

    let section = NodeSection {
        key: "edge-h".to_string(),
        ..NodeSection::default()
    };
    let _node = start_node(dir.path(), master.addr, section.node_info()).await;

    let seen = master.master.nodes().get("edge-h").await.unwrap();
    assert_eq!(seen.hash.len(), 64);
    assert!(seen.hash.chars().all(|c| c.is_ascii_hexdigit()));

    master.shutdown.send_replace(true);
}

#[tokio::test]
async fn test_peers_see_attach_and_detach() {
    let dir = tempdir().unwrap();
    let master = start_master(dir.path()).await;

    let a_info = NodeInfo::new("edge-a")
        .with_listeners(vec!["192.0.2.10".parse().unwrap()])
        .with_location(Location::new(40.0, -74.0));
    let a = start_node(dir.path(), master.addr, a_info).await;

    let b_info = NodeInfo::new("edge-b")
        .with_listeners(vec!["198.51.100.20".parse().unwrap()])
        .with_location(Location::new(48.0, 11.0));
    let b = start_node(dir.path(), master.addr, b_info).await;

    // edge-b learned about edge-a from the snapshot, edge-a from the broadcast
    assert!(b.client.nodes().contains("edge-a").await);
    let learned = || async { a.client.nodes().contains("edge-b").await };
    assert!(eventually(Duration::from_secs(2), learned).await);
    let nearest = b
        .geo
        .nearest_to(Location::new(40.7, -74.0), AddressFamily::V4)
        .await
        .unwrap();
    assert_eq!(nearest, "192.0.2.10".parse::<std::net::IpAddr>().unwrap());

    // Drop edge-a's socket
    a.task.abort();
    a.client.link().clear().await;

    let forgotten = || async { !b.client.nodes().contains("edge-a").await };
    assert!(eventually(Duration::from_secs(5), forgotten).await);
    assert!(!master.master.nodes().contains("edge-a").await);
    let nearest = b
        .geo
        .nearest_to(Location::new(40.7, -74.0), AddressFamily::V4)
        .await
        .unwrap();
    assert_eq!(nearest, "198.51.100.20".parse::<std::net::IpAddr>().unwrap());
}

#[tokio::test]
async fn test_forged_master_signature_is_fatal() {
    let dir = tempdir().unwrap();
    let master_keys = KeyStore::open(dir.path(), MASTER_KEY_NAME).unwrap();
    let node_keys = Arc::new(KeyStore::open(dir.path(), "edge-a").unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A master that answers the mutual challenge with garbage
    let impostor = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut rx, tx) = split(stream);

        let shared = rx.recv().await.unwrap();
        assert_eq!(shared.id, PacketId::SharedSecret.as_u32());
        let secret = master_keys.decrypt(&shared.data).unwrap();
        rx.enable_cipher(&secret).unwrap();
        tx.enable_cipher(&secret).await.unwrap();

        let login: Login = decode_payload(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(login.key, "edge-a");
        tx.send_payload(
            PacketId::ChallengeStart,
            &ChallengeStart {
                challenge: "edge-a-1-abcdefgh".to_string(),
            },
        )
        .await
        .unwrap();

        let result: ChallengeResult = decode_payload(&rx.recv().await.unwrap()).unwrap();
        tx.send_payload(
            PacketId::ChallengeFinish,
            &ChallengeFinish {
                challenge: result.mutual_challenge,
                result: vec![0u8; 256],
                nodes: Vec::new(),
            },
        )
        .await
        .unwrap();
        // Hold the socket open until the node gives up
        let _ = rx.recv().await;
    });

    let client = NodeClient::new(
        NodeClientConfig::new(addr.to_string(), NodeInfo::new("edge-a")),
        node_keys,
        Arc::new(GeoResolver::new()),
        EventBuses::new(),
    );

    let err = tokio::time::timeout(Duration::from_secs(10), client.run())
        .await
        .expect("node kept running")
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Auth(AuthError::SignatureInvalid)));
    assert!(err.is_fatal());
    assert!(!client.link().is_connected());
    impostor.await.unwrap();
}

#[tokio::test]
async fn test_unknown_node_key_is_rejected() {
    let keys_dir = tempdir().unwrap();
    let master = start_master(keys_dir.path()).await;

    // The node's public key lives elsewhere, so the master cannot verify it
    let node_dir = tempdir().unwrap();
    std::fs::copy(
        wired_node::protocol::keys::public_key_path(keys_dir.path(), MASTER_KEY_NAME),
        wired_node::protocol::keys::public_key_path(node_dir.path(), MASTER_KEY_NAME),
    )
    .unwrap();
    let client = NodeClient::new(
        NodeClientConfig::new(master.addr.to_string(), NodeInfo::new("edge-x")),
        Arc::new(KeyStore::open(node_dir.path(), "edge-x").unwrap()),
        Arc::new(GeoResolver::new()),
        EventBuses::new(),
    );

    let result = tokio::time::timeout(Duration::from_secs(10), client.connect_once())
        .await
        .expect("master kept the session open");
    assert!(result.is_err());
    assert!(!master.master.nodes().contains("edge-x").await);
}
