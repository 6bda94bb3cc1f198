use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use vecstore::config::{DbConfig, DEFAULT_DIMENSIONS};
use vecstore::storage::FileStorage;
use vecstore::VectorDb;

#[derive(Parser)]
#[command(name = "vecstore", about = "Maintenance tool for vecstore databases")]
struct Args {
    /// Database directory
    #[arg(short, long, env = "VECSTORE_DATA_DIR")]
    data_dir: PathBuf,

    /// Dimensions for collections created implicitly
    #[arg(long, default_value_t = DEFAULT_DIMENSIONS)]
    dimensions: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print database and collection statistics as JSON
    Stats,
    /// Write one collection to an export file
    Export {
        #[arg(short, long)]
        collection: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Load an export file as a new collection
    Import {
        #[arg(short, long)]
        input: PathBuf,
        /// Import under this name instead of the exported one
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Rebuild one collection's indexes from stored rows
    Rebuild {
        #[arg(short, long)]
        collection: String,
    },
    /// Save every index, purge resolved WAL entries and compact the store journal
    Compact,
    /// Inspect or prune the write-ahead log
    Wal {
        #[command(subcommand)]
        command: WalCommand,
    },
}

#[derive(Subcommand)]
enum WalCommand {
    /// Print WAL entries as JSON lines
    List {
        /// Only entries still pending
        #[arg(long, default_value_t = false)]
        pending: bool,
    },
    /// Purge resolved entries older than the given age
    Cleanup {
        #[arg(long, default_value_t = 0)]
        max_age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let engine: Directive = "vecstore=info".parse()?;
    let core: Directive = "vecstore_core=info".parse()?;
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(engine)
                .add_directive(core),
        )
        .init();

    let args = Args::parse();

    if args.data_dir.exists() && !args.data_dir.is_dir() {
        eprintln!(
            "Error: data_dir '{}' exists but is not a directory",
            args.data_dir.display()
        );
        std::process::exit(1);
    }

    let config = DbConfig::persistent(&args.data_dir, args.dimensions);
    let db = VectorDb::open(config).await?;

    match args.command {
        Command::Stats => {
            let stats = db.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Export { collection, output } => {
            let Some(handle) = db.get_collection(&collection).await? else {
                eprintln!("Error: collection '{collection}' not found");
                std::process::exit(1);
            };
            let bytes = handle.export().await?;
            tokio::fs::write(&output, &bytes).await?;
            tracing::info!(collection, path = %output.display(), bytes = bytes.len(), "export written");
        }
        Command::Import { input, name } => {
            let bytes = tokio::fs::read(&input).await?;
            let imported = db.import_as(&bytes, name.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(imported.record())?);
        }
        Command::Rebuild { collection } => {
            let Some(handle) = db.get_collection(&collection).await? else {
                eprintln!("Error: collection '{collection}' not found");
                std::process::exit(1);
            };
            let nodes = handle.rebuild_index().await?;
            tracing::info!(collection, nodes, "rebuild complete");
        }
        Command::Compact => {
            for record in db.list_collections().await? {
                if let Some(handle) = db.get_collection(&record.name).await? {
                    handle.persist_index().await?;
                }
            }
            let purged = db.wal().cleanup(Duration::ZERO).await?;
            db.close().await?;
            let storage = FileStorage::open(&args.data_dir)?;
            storage.compact().await?;
            tracing::info!(purged, "compaction complete");
            return Ok(());
        }
        Command::Wal { command } => match command {
            WalCommand::List { pending } => {
                let entries = if pending {
                    db.wal().pending().await
                } else {
                    db.wal().entries().await
                };
                for entry in entries {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
            WalCommand::Cleanup { max_age_secs } => {
                let purged = db.wal().cleanup(Duration::from_secs(max_age_secs)).await?;
                tracing::info!(purged, "WAL cleanup complete");
            }
        },
    }

    db.close().await?;
    Ok(())
}
