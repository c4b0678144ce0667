//! configdb - Dual-Node Configuration Database
//!
//! Runs one node of an active/passive pair, or both nodes in-process for a
//! quick replication simulation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use configdb::config::{ConfigDbConfig, LoggingConfig, PreferredRole, SyncMode};
use configdb::database::state::{NodeRole, PeerState};
use configdb::database::storage::MemoryStorage;
use configdb::database::tables::{ConfigEntry, ConfigTables, EdgeEntry, EntryHeader, EntryState, ObjectEntry, UserEntry};
use configdb::engine::{EngineBuilder, ReplicationEngine};
use configdb::messaging::{LoopbackTransport, TcpTransport};
use configdb::replication::TransactionType;

/// configdb - Dual-Node Configuration Database
#[derive(Parser)]
#[command(name = "configdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "configdb.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Active,
    Passive,
}

#[derive(Subcommand)]
enum Commands {
    /// Start this node over the TCP link
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "configdb.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "spa")]
        node_id: String,

        /// Role taken when both nodes are present
        #[arg(long, value_enum, default_value = "active")]
        role: Role,

        /// Peer address to dial; without it the node listens
        #[arg(long)]
        peer: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Replicate a synthetic configuration between two in-process nodes
    Simulate {
        /// Number of table entries on the active node
        #[arg(short, long, default_value = "1000")]
        entries: usize,

        /// Copy whole tables instead of streaming entries
        #[arg(long)]
        bulk: bool,

        /// Run one replicated transaction once both nodes are ready
        #[arg(long)]
        transaction: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = ConfigDbConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref(), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id, role, peer } => run_init(output, node_id, role, peer),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate { entries, bulk, transaction } => run_simulate(entries, bulk, transaction).await,
    }
}

/// Initialize logging. `RUST_LOG` wins over the CLI and the file.
fn init_logging(cli_level: Option<&str>, logging: &LoggingConfig) {
    let level = cli_level.unwrap_or(&logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load(config_path: &Path) -> anyhow::Result<ConfigDbConfig> {
    ConfigDbConfig::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))
}

/// Run this node until Ctrl-C
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load(&config_path)?;
    tracing::info!("Starting configdb node {}", config.node.id);

    let transport = TcpTransport::new(config.node.id.clone(), config.link.clone());
    if let Some(address) = transport.start().await.context("failed to start the link")? {
        tracing::info!("Waiting for the peer on {}", address);
    }

    let engine = EngineBuilder::new(config)
        .transport(Arc::new(transport.clone()))
        .build()
        .context("failed to build the replication engine")?;
    let role = engine.start().await?;
    tracing::info!("Node booting as {}", role);

    let mut states = engine.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow();
                tracing::info!("Database state is now {}", state);
            }
            _ = report.tick() => {
                let status = engine.status();
                tracing::debug!(
                    state = %status.state,
                    role = %status.role,
                    peer = %status.peer_state,
                    outstanding = status.pool.outstanding,
                    "Node status"
                );
            }
        }
    }

    engine.shutdown().await;
    transport.shutdown();
    tracing::info!("configdb node stopped");
    Ok(())
}

/// Write a starting configuration
fn run_init(output: PathBuf, node_id: String, role: Role, peer: Option<String>) -> anyhow::Result<()> {
    let role = match role {
        Role::Active => "active",
        Role::Passive => "passive",
    };
    let link = match &peer {
        Some(peer) => format!("listen = false\npeer_address = \"{peer}\""),
        None => "listen = true\n# peer_address = \"spb.example.com:7400\"".to_string(),
    };
    let config_content = format!(
        r#"# configdb Configuration
# Generated configuration file

[node]
id = "{node_id}"
preferred_role = "{role}"
data_dir = "/var/lib/configdb/{node_id}"

[link]
bind_address = "0.0.0.0:7400"
{link}
connect_timeout_ms = 5000
reconnect_interval_ms = 1000
busy_retry_limit = 1000
busy_retry_delay_ms = 1

[messaging]
pool_capacity = 256
reserved_headroom = 50
sync_timeout_ms = 30000
alloc_retry_ms = 10
drain_timeout_ms = 5000

[sync]
mode = "entry"
throttle_every = 10
throttle_delay_ms = 1
backpressure_poll_ms = 500
max_transfer_unit = 4096
config_poll_interval_ms = 100

[tables]
user_capacity = 512
object_capacity = 1024
edges_per_object = 4
system_spare_capacity = 64
key_memory_size = 8192

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: configdb start --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match ConfigDbConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Preferred Role: {}", config.node.preferred_role);
            println!("  Pool: {} messages, {} reserved", config.messaging.pool_capacity, config.messaging.reserved_headroom);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load(&config_path)?;

    println!("configdb Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Preferred Role:   {}", config.node.preferred_role);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Link:");
    if config.link.listen {
        println!("  Listening on:   {}", config.link.bind_address);
    } else {
        println!("  Peer:           {}", config.link.peer_address.as_deref().unwrap_or("(none)"));
    }
    println!("  Connect Wait:   {} ms", config.link.connect_timeout_ms);
    println!();
    println!("Messaging:");
    println!("  Pool Capacity:  {}", config.messaging.pool_capacity);
    println!("  Backpressure:   {} outstanding", config.backpressure_threshold());
    println!("  Sync Timeout:   {} ms", config.messaging.sync_timeout_ms);
    println!();
    println!("Tables:");
    println!("  Users:          {}", config.tables.user_capacity);
    println!("  Objects:        {}", config.tables.object_capacity);
    println!("  Edges:          {}", config.edge_capacity());
    println!("  Key Memory:     {} bytes", config.tables.key_memory_size);
    println!("  Sync Mode:      {}", config.sync.mode);
    Ok(())
}

fn simulation_config(id: &str, role: PreferredRole, bulk: bool) -> ConfigDbConfig {
    let mut config = ConfigDbConfig::default();
    config.node.id = id.to_string();
    config.node.preferred_role = role;
    config.link.connect_timeout_ms = 1000;
    config.messaging.sync_timeout_ms = 5000;
    config.messaging.alloc_retry_ms = 1;
    config.messaging.drain_timeout_ms = 500;
    config.sync.backpressure_poll_ms = 5;
    config.sync.config_poll_interval_ms = 10;
    if bulk {
        config.sync.mode = SyncMode::Bulk;
    }
    config
}

/// Spread `count` valid entries over the user, object and edge tables
fn synthetic_tables(config: &ConfigDbConfig, count: usize) -> anyhow::Result<ConfigTables> {
    let capacity = config.tables.user_capacity + config.tables.object_capacity + config.edge_capacity();
    if count > capacity {
        bail!("{} entries do not fit the {} table slots", count, capacity);
    }

    let mut tables = ConfigTables::with_defaults(&config.tables);
    let (mut users, mut objects, mut edges) = (0u32, 0u32, 0u32);
    for i in 0..count {
        let entry = match i % 3 {
            0 if (users as usize) < config.tables.user_capacity => {
                users += 1;
                ConfigEntry::User(UserEntry {
                    header: EntryHeader::new(users - 1, EntryState::Valid),
                    class_id: 1,
                    ..Default::default()
                })
            }
            1 if (objects as usize) < config.tables.object_capacity => {
                objects += 1;
                ConfigEntry::Object(ObjectEntry {
                    header: EntryHeader::new(objects - 1, EntryState::Valid),
                    class_id: 2,
                    ..Default::default()
                })
            }
            _ if (edges as usize) < config.edge_capacity() => {
                edges += 1;
                let slot = edges as usize - 1;
                let per_object = config.tables.edges_per_object;
                ConfigEntry::Edge(EdgeEntry {
                    header: EntryHeader::new((slot / per_object) as u32, EntryState::Valid),
                    client_index: (slot % per_object) as u16,
                    server_id: (slot / per_object) as u32,
                    ..Default::default()
                })
            }
            _ => {
                objects += 1;
                ConfigEntry::Object(ObjectEntry {
                    header: EntryHeader::new(objects - 1, EntryState::Valid),
                    class_id: 2,
                    ..Default::default()
                })
            }
        };
        tables.apply(&entry)?;
    }
    Ok(tables)
}

/// Two nodes over the loopback transport
async fn run_simulate(entries: usize, bulk: bool, transaction: bool) -> anyhow::Result<()> {
    let config_a = simulation_config("sim-a", PreferredRole::Active, bulk);
    let config_b = simulation_config("sim-b", PreferredRole::Passive, bulk);
    let snapshot = synthetic_tables(&config_a, entries)?.snapshot();

    let (link_a, link_b, _control) = LoopbackTransport::pair(
        config_a.link.busy_retry_limit,
        config_a.busy_retry_delay(),
    );
    let a = EngineBuilder::new(config_a)
        .transport(Arc::new(link_a))
        .storage(MemoryStorage::with_snapshot(snapshot).shared())
        .build()?;
    let b = EngineBuilder::new(config_b)
        .transport(Arc::new(link_b))
        .storage(MemoryStorage::new().shared())
        .build()?;

    let started = std::time::Instant::now();
    let (role_a, role_b) = futures::future::try_join(a.start(), b.start()).await?;
    tracing::info!("Simulation roles: sim-a {}, sim-b {}", role_a, role_b);
    futures::future::try_join(a.wait_ready(), b.wait_ready()).await?;
    tracing::info!("Both nodes ready after {:?}", started.elapsed());

    if transaction {
        run_transaction(&a, &b).await?;
    }

    let report = serde_json::json!({
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "nodes": [a.status(), b.status()],
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    futures::future::join(a.shutdown(), b.shutdown()).await;
    Ok(())
}

async fn run_transaction(a: &Arc<ReplicationEngine>, b: &Arc<ReplicationEngine>) -> anyhow::Result<()> {
    let (active, passive) = if a.role() == NodeRole::Active { (a, b) } else { (b, a) };
    // Staged entries reach the peer once it reported its boot complete
    for _ in 0..100 {
        if active.service_state().peer_state() == PeerState::Ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let object_id = (active.config().tables.object_capacity - 1) as u32;

    let id = active.start_transaction(TransactionType::User, 1).await?;
    active
        .stage(ConfigEntry::Object(ObjectEntry {
            header: EntryHeader::new(object_id, EntryState::Create),
            class_id: 7,
            ..Default::default()
        }))
        .await?;
    active.commit().await?;

    let replicated = passive
        .tables()
        .read()
        .object
        .get(object_id as usize)
        .map(|entry| entry.class_id == 7)
        .unwrap_or(false);
    tracing::info!("Transaction {} committed, replicated to peer: {}", id, replicated);
    Ok(())
}
