use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ethers::types::Address;
use eyre::Context;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use castellan::artifacts::DirArtifactResolver;
use castellan::client::ChainClient;
use castellan::config::{DeployerSettings, DeploymentId, DiamondConfig};
use castellan::deployer::{DeployerFactory, DiamondDeployer};
use castellan::record::{DeployedState, DeployedStateStore, JsonStateStore};
use castellan::selector::Selector;
use castellan::steps::JsonStepStore;
use castellan_ethers::contracts::DiamondLoupe;
use castellan_ethers::EthersClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    rpc_url: Option<String>,

    /// Diamond configuration (facets, versions, overrides).
    #[arg(short, long)]
    config: PathBuf,

    /// Directory of compiled-contract artifacts.
    #[arg(short, long, default_value = "artifacts")]
    artifacts: PathBuf,

    /// Directory for step checkpoints and deployed-state records.
    #[arg(short, long, default_value = "deployments")]
    state_dir: PathBuf,

    #[arg(short, long)]
    network: String,

    #[arg(long, default_value_t = 1.2)]
    gas_multiplier: f64,

    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    #[arg(long, default_value_t = 1000)]
    retry_base_delay_ms: u64,

    #[arg(long)]
    no_jitter: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy or upgrade the diamond; a failed run resumes automatically.
    Deploy,
    /// Compare live on-chain facets against the recorded deployment.
    Status,
}

fn get_private_key() -> eyre::Result<String> {
    env::var("CASTELLAN_PRIVATE_KEY").context("CASTELLAN_PRIVATE_KEY not found in environment")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let rpc_url = cli.rpc_url.unwrap_or("http://localhost:8547".to_owned());

    let settings = DeployerSettings {
        rpc_url,
        private_key: get_private_key()?,
        network_name: cli.network.clone(),
        gas_multiplier: cli.gas_multiplier,
        max_retries: cli.max_retries,
        retry_base_delay: Duration::from_millis(cli.retry_base_delay_ms),
        retry_jitter: !cli.no_jitter,
    };

    let config = DiamondConfig::load(&cli.config)?;
    let client = EthersClient::try_new(&settings)
        .await
        .context("Failed to connect to the Ethereum client")?;
    let chain_id = client.chain_id().await?;
    let id = DeploymentId::new(&config.diamond_name, &settings.network_name, chain_id);

    let states = JsonStateStore::new(&cli.state_dir);
    match cli.command {
        Command::Deploy => {
            let steps = JsonStepStore::open(&cli.state_dir, &id)?;
            let client = Arc::new(client);
            let factory = DeployerFactory::new();
            let deployer = factory.get_or_create(&id, || {
                DiamondDeployer::new(
                    id.clone(),
                    config.clone(),
                    client.clone(),
                    Arc::new(DirArtifactResolver::new(&cli.artifacts)),
                    Arc::new(steps),
                    Arc::new(states.clone()),
                )
            })?;

            let state = deployer.deploy().await.context("Deployment failed")?;
            print_summary(&id, &state);
        }
        Command::Status => {
            let state = states
                .load(&id)?
                .ok_or_else(|| eyre::eyre!("no deployed-state record for {id}"))?;
            show_status(&client, &state).await;
        }
    }

    Ok(())
}

fn print_summary(id: &DeploymentId, state: &DeployedState) {
    println!("=== DEPLOYMENT COMPLETE ===");
    println!("Deployment : {id}");
    if let Some(diamond) = state.diamond_address {
        println!("Diamond    : {diamond:?}");
    }
    println!("Protocol   : v{}", state.protocol_version);
    for (name, facet) in &state.deployed_facets {
        println!(
            "Facet {name} @ {:?} (v{}, {} selectors)",
            facet.address,
            facet.version,
            facet.func_selectors.len()
        );
    }
}

/// Advisory loupe inspection: RPC trouble here is logged, never fatal.
async fn show_status(client: &EthersClient, state: &DeployedState) {
    let Some(diamond) = state.diamond_address else {
        println!("diamond not deployed yet");
        return;
    };
    let loupe = DiamondLoupe::new(diamond, client.middleware());

    let live = match loupe.facet_addresses().call().await {
        Ok(addresses) => addresses,
        Err(err) => {
            warn!(error = %err, "could not read live facets from the diamond");
            return;
        }
    };

    let recorded: BTreeMap<Address, &String> = state
        .deployed_facets
        .iter()
        .map(|(name, facet)| (facet.address, name))
        .collect();

    println!("diamond {diamond:?}: {} live facets", live.len());
    for address in &live {
        let name = recorded
            .get(address)
            .map(|s| s.as_str())
            .unwrap_or("<not in record>");
        match loupe.facet_function_selectors(*address).call().await {
            Ok(selectors) => {
                let rendered: Vec<String> = selectors
                    .into_iter()
                    .map(|raw| Selector::new(raw).to_string())
                    .collect();
                println!("  {address:?} {name}: {}", rendered.join(", "));
            }
            Err(err) => {
                warn!(error = %err, facet = %name, "could not read facet selectors");
                println!("  {address:?} {name}: <unreadable>");
            }
        }
    }
    for (name, facet) in &state.deployed_facets {
        if !live.contains(&facet.address) {
            println!("  recorded facet {name} @ {:?} is not live on-chain", facet.address);
        }
    }
}
