use std::path::PathBuf;
use std::sync::Arc;

use advo_ingest::{run_ingest, IngestConfig};
use advo_storage::{AdvocateStore, MemoryAdvocateStore};
use advo_web::WebConfig;
use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "advo")]
#[command(about = "Advocate ingestion pipeline")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a directory of advocate JSON exports and print run stats.
    Ingest(IngestArgs),
    /// Ingest into memory, then serve the metrics API.
    Serve {
        #[command(flatten)]
        ingest: IngestArgs,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Default, Args)]
struct IngestArgs {
    #[arg(long)]
    ingest_dir: Option<PathBuf>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dry_run: bool,
    /// YAML file with ingest settings; replaces the ADVO_* environment defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IngestArgs {
    fn resolve(&self) -> Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) => IngestConfig::from_yaml_file(path)?,
            None => IngestConfig::from_env(),
        };
        if let Some(dir) = &self.ingest_dir {
            config.ingest_dir = dir.clone();
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        config.dry_run |= self.dry_run;
        Ok(config)
    }
}

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn init_logging(verbose: u8) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose))),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => {
            let config = args.resolve()?;
            let store: Arc<dyn AdvocateStore> = Arc::new(MemoryAdvocateStore::new());
            let summary = run_ingest(config, Some(store)).await;
            info!(
                run_id = %summary.run_id,
                batches = summary.batches_flushed,
                flush_failures = summary.flush_failures,
                "ingest summary"
            );
            println!("Ingest finished. {}", summary.stats);
        }
        Commands::Serve { ingest, port } => {
            let config = ingest.resolve()?;
            let store = Arc::new(MemoryAdvocateStore::new());
            let summary = run_ingest(config, Some(store.clone())).await;
            println!("Ingest finished. {}", summary.stats);

            let mut web = WebConfig::from_env();
            if let Some(port) = port {
                web.port = port;
            }
            advo_web::serve(web, store).await?;
        }
    }

    Ok(())
}
