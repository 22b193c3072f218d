//! Wired Node Entry Point
//!
//! One binary runs either the master (`--master`) or an edge node. An edge
//! node serves authoritative DNS on port 53, terminates TLS on 443 (80
//! redirects), keeps a session to the master and replicates record and
//! certificate changes through it.
//!
//! ## Usage
//!
//! ```bash
//! # Master
//! MASTER=true NODE_KEY=master wired --config /etc/wired/master.toml
//!
//! # Edge node
//! NODE_KEY=edge-a GATEWAY=master.wired.network:2000 SNOWFLAKE_MACHINE_ID=3 wired
//! ```
//!
//! Environment variables override the TOML file, which overrides defaults.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wired_node::acme::{AcmeAccount, CertificateManager};
use wired_node::config::Config;
use wired_node::dns::{DnsServer, GeoResolver, MaxMindLookup, ZoneFiles, ZoneStore};
use wired_node::error_pages::ErrorPages;
use wired_node::events::EventBuses;
use wired_node::protocol::keys::MASTER_KEY_NAME;
use wired_node::protocol::{KeyStore, Master, NodeClient, NodeClientConfig};
use wired_node::proxy::{ProxyRouter, ReverseProxy};
use wired_node::replication::{follow_certificates, RecordService, Replicator};
use wired_node::snowflake::Snowflake;
use wired_node::tls::{server_config, CertStore};

/// Wired edge node
#[derive(Parser, Debug)]
#[command(name = "wired")]
#[command(version)]
#[command(about = "Wired edge node and master", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long, env = "WIRED_CONFIG")]
    config: Option<PathBuf>,

    /// Key name of this process
    #[arg(long, env = "NODE_KEY")]
    node_key: Option<String>,

    /// Master address (`host:port`)
    #[arg(long, env = "GATEWAY")]
    gateway: Option<String>,

    /// Run as the master
    #[arg(long, env = "MASTER")]
    master: bool,

    #[arg(long, env = "SNOWFLAKE_MACHINE_ID")]
    snowflake_machine_id: Option<u16>,

    #[arg(long, env = "MAXMIND_COUNTRY_DB_PATH")]
    maxmind_country_db_path: Option<PathBuf>,

    #[arg(long, env = "MAXMIND_ASN_DB_PATH")]
    maxmind_asn_db_path: Option<PathBuf>,

    /// Directory holding `error.html`
    #[arg(long, env = "PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    /// Dashboard settings, accepted for compatibility
    #[arg(long, env = "CLIENT_NAME", hide = true)]
    client_name: Option<String>,
    #[arg(long, env = "DISCORD_CLIENT_ID", hide = true)]
    discord_client_id: Option<String>,
    #[arg(long, env = "DISCORD_CLIENT_SECRET", hide = true)]
    discord_client_secret: Option<String>,
    #[arg(long, env = "DISCORD_REDIRECT_URI", hide = true)]
    discord_redirect_uri: Option<String>,
    #[arg(long, env = "WHITELISTED_IDS", hide = true)]
    whitelisted_ids: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(key) = &self.node_key {
            config.node.key = key.clone();
        }
        if let Some(gateway) = &self.gateway {
            config.node.gateway = gateway.clone();
        }
        if self.master {
            config.master.enabled = true;
        }
        if let Some(id) = self.snowflake_machine_id {
            config.node.machine_id = id;
        }
        if let Some(path) = &self.maxmind_country_db_path {
            config.geoip.city_db = Some(path.clone());
        }
        if let Some(path) = &self.maxmind_asn_db_path {
            config.geoip.asn_db = Some(path.clone());
        }
        if let Some(dir) = &self.public_dir {
            config.paths.public = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting Wired v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let dashboard = [
        &args.client_name,
        &args.discord_client_id,
        &args.discord_client_secret,
        &args.discord_redirect_uri,
        &args.whitelisted_ids,
    ];
    if dashboard.iter().any(|setting| setting.is_some()) {
        info!("Dashboard settings present; the dashboard is served elsewhere");
    }

    let result = if config.master.enabled {
        run_master(config).await
    } else {
        run_node(config).await
    };

    if let Err(e) = result {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_master(config: Config) -> anyhow::Result<()> {
    let keys = Arc::new(
        KeyStore::open(&config.paths.keys, MASTER_KEY_NAME)
            .with_context(|| format!("opening master key in {}", config.paths.keys.display()))?,
    );
    let master_config = config.master.master_config();
    let listener = TcpListener::bind(master_config.listen_addr)
        .await
        .with_context(|| format!("binding {}", master_config.listen_addr))?;
    let master = Arc::new(Master::new(master_config, keys, EventBuses::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown_tx.send_replace(true);
        }
    });

    master.run(listener, shutdown_rx).await?;
    info!("Master stopped");
    Ok(())
}

async fn run_node(config: Config) -> anyhow::Result<()> {
    let key = config.node.key.clone();
    let keys = Arc::new(
        KeyStore::open(&config.paths.keys, &key)
            .with_context(|| format!("opening key '{}' in {}", key, config.paths.keys.display()))?,
    );
    let ids = Arc::new(Snowflake::new(config.node.machine_id)?);
    let buses = EventBuses::new();

    // Record store
    let files = ZoneFiles::new(&config.paths.zones);
    let store = Arc::new(ZoneStore::with_files(Arc::clone(&ids), files));
    let loaded = store.load().await.context("loading zones")?;
    info!("{} record(s) loaded", loaded);

    // Certificates and error pages
    let certs = Arc::new(CertStore::with_dir(&config.paths.certs));
    if let Err(e) = certs.load_dir() {
        warn!("Certificates not loaded: {}", e);
    }
    let pages = ErrorPages::load(config.paths.public.as_deref()).context("loading error template")?;
    let pages = Arc::new(pages);

    // Geo resolver
    let mut geo = GeoResolver::new();
    if let Some(city) = &config.geoip.city_db {
        let lookup = MaxMindLookup::open(city, config.geoip.asn_db.as_deref())
            .with_context(|| format!("opening MaxMind database {}", city.display()))?;
        geo = geo.with_lookup(Arc::new(lookup));
    }
    if let Some(location) = config.geoip.default_location {
        geo = geo.with_default_location(location);
    }
    let geo = Arc::new(geo);

    // Control plane and replication
    let client = Arc::new(NodeClient::new(
        NodeClientConfig::new(config.node.gateway.clone(), config.node.node_info()),
        keys,
        Arc::clone(&geo),
        buses.clone(),
    ));
    let replicator = Arc::new(Replicator::new(key.clone(), buses.clone(), client.link()));
    let _replication_tasks = replicator.spawn();

    let records = Arc::new(
        RecordService::new(Arc::clone(&store), buses.clone(), key.clone())
            .with_nameservers(config.dns.nameservers.clone()),
    );
    let _record_task = records.follow();
    let _cert_task = follow_certificates(&buses, key.clone(), Arc::clone(&certs));

    let router = Arc::new(ProxyRouter::new());
    let _router_task = router.follow(&buses);

    if config.acme.enabled {
        let manager = Arc::new(CertificateManager::new(
            config.acme.clone(),
            Arc::new(AcmeAccount::new(&config.acme)),
            records.clone(),
            Arc::clone(&certs),
            buses.clone(),
            key.clone(),
        ));
        manager.follow_protected();
        manager.spawn_renewal();
        info!("ACME enabled against {}", config.acme.directory_url);
    }

    // Data plane
    let dns = DnsServer::new(config.dns.clone(), Arc::clone(&store), Arc::clone(&geo))?
        .with_events(buses.clone(), key.clone());
    let dns = Arc::new(dns);
    let proxy = ReverseProxy::new(config.proxy.clone(), router, pages)
        .with_store(Arc::clone(&store));
    let proxy = Arc::new(proxy);
    let tls = server_config(Arc::clone(&certs)).context("building TLS config")?;

    tokio::select! {
        result = client.run() => {
            result.context("master session")?;
        }
        result = dns.run() => {
            result.context("DNS server")?;
        }
        result = proxy.run(tls) => {
            result.context("reverse proxy")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    info!("Node '{}' stopped", key);
    Ok(())
}
