//! stratusd — the Stratus director.
//!
//! Binds a deployment manifest against the persisted state and the live
//! agents, and prints the resulting plan.
//!
//! # Usage
//!
//! ```text
//! stratusd upload-release --file cf-245.json
//! stratusd upload-stemcell --name ubuntu-trusty --version 3312 --cid ami-3312
//! stratusd deploy --manifest cf.toml --config director.toml
//! stratusd instances --deployment cf
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use stratus_agent::HttpAgentClient;
use stratus_core::{DirectorConfig, Manifest};
use stratus_planner::{Assembler, DeploymentPlan, PlanContext, Rename, StoreDnsManager};
use stratus_state::{ReleaseRecord, StateStore, StemcellRecord};

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus deployment director")]
struct Cli {
    /// Director configuration file (TOML). Defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `base_dir` from the configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind a manifest and print the reconciliation plan as JSON.
    Deploy {
        /// Deployment manifest (TOML).
        #[arg(long)]
        manifest: PathBuf,

        /// Rename a job for this deploy, as OLD:NEW.
        #[arg(long)]
        rename: Option<Rename>,

        /// Upper bound on concurrent agent queries.
        #[arg(long)]
        max_threads: Option<usize>,

        /// Address published as the domain's nameserver.
        #[arg(long)]
        nameserver: Option<Ipv4Addr>,
    },

    /// List persisted instances of a deployment.
    Instances {
        #[arg(long)]
        deployment: String,
    },

    /// Register a release from its JSON description.
    UploadRelease {
        #[arg(long)]
        file: PathBuf,
    },

    /// Register a stemcell image.
    UploadStemcell {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        cid: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stratus=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DirectorConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => DirectorConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.base_dir = dir;
    }

    match cli.command {
        Command::Deploy {
            manifest,
            rename,
            max_threads,
            nameserver,
        } => {
            if let Some(n) = max_threads {
                config.max_threads = n;
            }
            deploy(config, &manifest, rename, nameserver).await
        }
        Command::Instances { deployment } => list_instances(&config, &deployment),
        Command::UploadRelease { file } => upload_release(&config, &file),
        Command::UploadStemcell { name, version, cid } => {
            let store = open_store(&config)?;
            store.put_stemcell(&StemcellRecord {
                name: name.clone(),
                version: version.clone(),
                cid,
            })?;
            info!(%name, %version, "stemcell uploaded");
            Ok(())
        }
    }
}

fn open_store(config: &DirectorConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.base_dir)
        .with_context(|| format!("creating {}", config.base_dir.display()))?;
    let path = config.state_db_path();
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

async fn deploy(
    config: DirectorConfig,
    manifest_path: &Path,
    rename: Option<Rename>,
    nameserver: Option<Ipv4Addr>,
) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let manifest = Manifest::from_file(manifest_path)
        .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
    let plan = DeploymentPlan::new(manifest, rename)?;
    info!(deployment = %plan.name, groups = plan.groups.len(), "manifest loaded");

    let agents = Arc::new(HttpAgentClient::new(config.agent_timeout()));
    let mut dns = StoreDnsManager::new(store.clone(), config.dns_domain.clone());
    if let Some(address) = nameserver {
        dns = dns.with_nameserver(address);
    }
    let assembler = Assembler::new(agents, Arc::new(dns), &config);

    let owner = format!("stratusd-{}", std::process::id());
    let mut ctx = PlanContext::new(plan, store, config, owner);
    assembler.bind_models(&mut ctx).await?;

    println!("{}", serde_json::to_string_pretty(&ctx.summary())?);
    Ok(())
}

fn list_instances(config: &DirectorConfig, deployment: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let instances = store.load_instances(deployment)?;
    if instances.is_empty() {
        println!("no instances in deployment '{deployment}'");
        return Ok(());
    }
    for instance in instances {
        println!(
            "{}/{}\t{}\t{}\t{}\t{} disk(s)",
            instance.job(),
            instance.index(),
            instance.id(),
            instance.az.as_deref().unwrap_or("-"),
            instance.vm.as_ref().map(|vm| vm.cid.as_str()).unwrap_or("unallocated"),
            instance.disks.len()
        );
    }
    Ok(())
}

fn upload_release(config: &DirectorConfig, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading release {}", file.display()))?;
    let release: ReleaseRecord = serde_json::from_str(&content)?;
    let store = open_store(config)?;
    store.put_release(&release)?;
    info!(name = %release.name, version = %release.version, jobs = release.jobs.len(), "release uploaded");
    Ok(())
}
