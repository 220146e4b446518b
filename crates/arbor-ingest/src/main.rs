use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use arbor_ingest::config::{load_config, Config};
use arbor_ingest::db::{default_database_path, Database};
use arbor_ingest::error::{ConfigError, IngestError};
use arbor_ingest::server::{self, AppState};
use arbor_ingest::{
    telemetry, FilesystemStore, ObjectStore, OrphanReconciler, Pipeline, QueueCoordinator,
    QueueEventBroadcaster, QueueWorker,
};

#[derive(Parser, Debug)]
#[command(name = "arbor-ingest", version, about = "Page-image ingestion pipeline for the tree knowledge base")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "ARBOR_INGEST_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and the queue worker (default)
    Serve,
    /// Validate the configuration file and exit
    CheckConfig,
    /// List stored images whose source has no batch
    Orphans {
        /// Remove them instead of listing
        #[arg(long)]
        cleanup: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("arbor-ingest: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), IngestError> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    let command = cli.command.unwrap_or(Command::Serve);
    if let Command::CheckConfig = command {
        println!("configuration ok");
        return Ok(());
    }

    telemetry::init_tracing(&config.logging)?;
    tracing::info!("Starting arbor-ingest v{}", env!("CARGO_PKG_VERSION"));

    let db_path = match &config.database_path {
        Some(path) => PathBuf::from(path),
        None => default_database_path().ok_or_else(|| ConfigError::Validation {
            message: "databasePath is not set and no home directory was found".into(),
        })?,
    };
    let db = Database::open(&db_path)?;
    let store: Arc<dyn ObjectStore> = Arc::new(FilesystemStore::new(
        &config.storage.root,
        &config.storage.public_base_url,
    ));
    let coordinator = QueueCoordinator::new(db, QueueEventBroadcaster::default())
        .with_max_batch_pages(config.queue.max_batch_pages);
    let reconciler = Arc::new(OrphanReconciler::new(&coordinator, Arc::clone(&store)));

    match command {
        Command::Orphans { cleanup: false } => {
            for orphan in reconciler.find_orphans()? {
                println!("{}\t{}\t{}", orphan.source_id, orphan.page, orphan.uri);
            }
            Ok(())
        }
        Command::Orphans { cleanup: true } => {
            let report = reconciler.cleanup(None).await?;
            println!(
                "removed {} image(s), {} storage failure(s)",
                report.removed.len(),
                report.storage_failures.len()
            );
            Ok(())
        }
        Command::Serve | Command::CheckConfig => serve(config, coordinator, store, reconciler).await,
    }
}

async fn serve(
    config: Config,
    coordinator: QueueCoordinator,
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<OrphanReconciler>,
) -> Result<(), IngestError> {
    let pipeline = Arc::new(Pipeline::from_config(&config, coordinator, store)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = config.worker.enabled.then(|| {
        QueueWorker::from_config(Arc::clone(&pipeline), &config.worker).spawn(stop_rx)
    });

    let state = AppState::new(pipeline, reconciler);
    let served = server::serve(&config.server, state).await;

    let _ = stop_tx.send(true);
    if let Some(handle) = worker {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "queue worker task failed");
        }
    }

    served.map_err(IngestError::from)
}
