use anyhow::Result;
use clap::{Parser, Subcommand};
use icn_config::{load_mesh_config, MeshConfig};
use icn_node_lib::{generate_key_file, init_tracing, load_identity, run_devnet, DevnetOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "ICN mesh job coordination node", long_about = None)]
struct Cli {
    /// Path to a TOML node configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an originator and a set of executors on an in-process network
    Devnet {
        #[arg(short, long, default_value_t = 3)]
        executors: usize,

        #[arg(short, long, default_value_t = 2)]
        jobs: usize,

        /// Bidding window per job in milliseconds
        #[arg(long, default_value_t = 500)]
        bidding_window_ms: u64,

        /// Print the originator's metrics when done
        #[arg(long)]
        metrics: bool,
    },

    /// Generate a new node key
    #[command(name = "key-gen")]
    KeyGen {
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the DID of the configured key
    Identity,

    /// Print the effective configuration as TOML
    #[command(name = "show-config")]
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let config = match &cli.config {
        Some(path) => load_mesh_config(path)?,
        None => MeshConfig::default(),
    };

    match cli.command {
        Commands::Devnet {
            executors,
            jobs,
            bidding_window_ms,
            metrics,
        } => {
            let options = DevnetOptions {
                executors,
                jobs,
                bidding_window: Duration::from_millis(bidding_window_ms),
                ..DevnetOptions::default()
            };
            let report = run_devnet(config, options).await?;
            for job in &report.jobs {
                println!(
                    "{}  {}  executor={}  receipt={}",
                    job.announcement_id,
                    job.state,
                    job.executor.as_deref().unwrap_or("-"),
                    job.receipt_ref.as_deref().unwrap_or("-"),
                );
            }
            if metrics {
                print!("{}", report.metrics);
            }
        }
        Commands::KeyGen { output } => {
            let did = generate_key_file(&output)?;
            println!("Generated key for {}", did);
            println!("Saved to {}", output.display());
        }
        Commands::Identity => {
            let identity = load_identity(&config.node, "local")?;
            println!("{}", identity.did());
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
