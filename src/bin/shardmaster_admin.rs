use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use shardmaster::master::split_slots;
use shardmaster::{
    DbMeta, Master, MasterConfig, MemoryTopoBackend, PartitionMeta, PartitionPolicy,
    SequenceIdGenerator, SpaceMeta, TcpConnector, TopoServer, ZoneRpcClient,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardmaster-admin")]
#[command(about = "Operator tooling for the shardmaster metadata control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the slot ranges a new space would get
    Plan {
        #[arg(long, default_value_t = 1024)]
        slots: u32,
        #[arg(long, default_value_t = 4)]
        partitions: u32,
    },
    /// Create the DBs and spaces of a manifest and print the resulting metadata
    Bootstrap {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also send create-partition to every replica node
        #[arg(long)]
        dispatch: bool,
    },
    /// Validate a master configuration file
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    cluster_id: Option<String>,
    dbs: Vec<ManifestDb>,
}

#[derive(Debug, Deserialize)]
struct ManifestDb {
    name: String,
    #[serde(default)]
    spaces: Vec<ManifestSpace>,
}

#[derive(Debug, Deserialize)]
struct ManifestSpace {
    name: String,
    key: String,
    function: String,
    /// Zero takes the configured default.
    #[serde(default)]
    partitions: u32,
    #[serde(default)]
    replicas: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BootstrapReport {
    dbs: Vec<DbReport>,
}

#[derive(Debug, Serialize)]
struct DbReport {
    db: DbMeta,
    spaces: Vec<SpaceReport>,
}

#[derive(Debug, Serialize)]
struct SpaceReport {
    space: SpaceMeta,
    partitions: Vec<PartitionMeta>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Plan { slots, partitions } => plan(slots, partitions),
        Command::Bootstrap {
            manifest,
            config,
            dispatch,
        } => bootstrap(&manifest, config.as_deref(), dispatch).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn plan(slots: u32, partitions: u32) -> Result<()> {
    let ranges = split_slots(slots, partitions)?;
    for (i, (start, end)) in ranges.iter().enumerate() {
        println!("partition {:>3}: [{}, {})  {} slots", i, start, end, end - start);
    }
    Ok(())
}

fn load_config(path: Option<&Path>, cluster_id: Option<&str>) -> Result<MasterConfig> {
    match path {
        Some(path) => MasterConfig::from_json_file(path).map_err(|err| anyhow!(err)),
        None => Ok(MasterConfig::new(cluster_id.unwrap_or("local"))),
    }
}

async fn bootstrap(manifest_path: &Path, config_path: Option<&Path>, dispatch: bool) -> Result<()> {
    let raw = fs::read_to_string(manifest_path)
        .with_context(|| format!("Failed to read manifest '{}'", manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid manifest '{}'", manifest_path.display()))?;
    let config = load_config(config_path, manifest.cluster_id.as_deref())?;

    let connector = Arc::new(TcpConnector::new(config.rpc.connect_timeout));
    let dispatcher = Arc::new(ZoneRpcClient::new(&config, connector)?);
    let master = Master::new(
        config,
        TopoServer::new(Arc::new(MemoryTopoBackend::new())),
        Arc::new(SequenceIdGenerator::new()),
        dispatcher,
    )?;

    let mut report = BootstrapReport { dbs: Vec::new() };
    for db_spec in &manifest.dbs {
        let db = master.create_db(&db_spec.name).await?;
        let mut spaces = Vec::new();
        for space_spec in &db_spec.spaces {
            let policy =
                PartitionPolicy::new(&space_spec.key, &space_spec.function, space_spec.partitions);
            let space = master
                .create_space(&db_spec.name, &space_spec.name, &policy, &space_spec.replicas)
                .await?;
            if dispatch && !space_spec.replicas.is_empty() {
                let calls = master
                    .dispatch_space_partitions(&db_spec.name, &space_spec.name)
                    .await
                    .with_context(|| format!("Dispatch failed for space '{}'", space_spec.name))?;
                info!(space = %space_spec.name, calls, "dispatched");
            }
            spaces.push(SpaceReport {
                space: space.meta(),
                partitions: space.partitions().iter().map(|p| p.meta()).collect(),
            });
        }
        report.dbs.push(DbReport {
            db: db.meta(),
            spaces,
        });
    }
    master.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = MasterConfig::from_json_file(path).map_err(|err| anyhow!(err))?;
    println!(
        "Config OK: cluster '{}', request timeout {:?}, {} slots x {} partitions",
        config.cluster.cluster_id,
        config.rpc.request_timeout,
        config.space.slot_count,
        config.space.partition_count
    );
    Ok(())
}
