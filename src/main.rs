//! FFX Ingest command line
//!
//! Ingests tool output into a case database and prints one JSON outcome per
//! file on stdout. Logging goes to stderr; control it with `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, error, info};

use ffx_ingest_lib::engine::types::SourceItem;
use ffx_ingest_lib::sources::PlistSelection;
use ffx_ingest_lib::{
    logging, tool_output_jobs, ArtifactKind, FileOutcome, InMemoryStore, IngestConfig, IngestEngine, IngestJob,
    KnowledgeStore, NeverCancel, SourceSpec, SqliteStore,
};

#[derive(Parser)]
#[command(
    name = "ffx-ingest",
    about = "Forensic tool-output ingestion with dynamic schema mapping",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Ingest config (JSON); defaults to the selected preset
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Built-in config used when --config is not given
    #[arg(long, global = true, value_enum, default_value = "default")]
    preset: Preset,

    /// Case database; defaults to the user data directory
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Map into a throwaway in-memory store
    #[arg(long, global = true, conflicts_with = "store")]
    dry_run: bool,

    /// Data source (e.g. disk image name) to attribute artifacts to
    #[arg(short, long, global = true)]
    data_source: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Macos,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one CSV/TSV file
    Csv {
        file: PathBuf,

        /// Artifact kind name; defaults to <NAMESPACE>_<FILE STEM>
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Ingest every CSV/TSV file under a tool's output directory
    ToolOutput { dir: PathBuf },

    /// Ingest records from an XML or binary property list
    Plist {
        file: PathBuf,

        #[arg(short, long)]
        kind: String,

        /// Dotted key path to the record collection
        #[arg(long)]
        key_path: Option<String>,

        /// Field name for dictionary keys
        #[arg(long)]
        key_field: Option<String>,

        /// Dotted key path to read from each record (repeatable)
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Ingest the rows of a query against a SQLite database
    Sqlite {
        file: PathBuf,

        #[arg(short, long)]
        query: String,

        #[arg(short, long)]
        kind: String,
    },
}

fn kind_named(name: &str) -> ArtifactKind {
    ArtifactKind::new(name.to_uppercase(), name.to_uppercase().replace('_', " "))
}

fn load_config(global: &GlobalArgs) -> Result<IngestConfig, String> {
    match &global.config {
        Some(path) => IngestConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(match global.preset {
            Preset::Default => IngestConfig::default(),
            Preset::Macos => IngestConfig::macos(),
        }),
    }
}

fn open_store(global: &GlobalArgs) -> Result<Box<dyn KnowledgeStore>, String> {
    if global.dry_run {
        info!("Dry run: using in-memory store");
        return Ok(Box::new(InMemoryStore::new()));
    }
    let path = global.store.clone().unwrap_or_else(SqliteStore::default_path);
    info!("Opening case database: {}", path.display());
    let store = SqliteStore::open(&path).map_err(|e| e.to_string())?;
    Ok(Box::new(store))
}

fn build_jobs(command: Commands, config: &IngestConfig) -> Result<Vec<IngestJob>, String> {
    let namespace = config.namespace.as_str();
    Ok(match command {
        Commands::Csv { file, kind } => {
            let kind = match kind {
                Some(name) => kind_named(&name),
                None => ArtifactKind::for_output(namespace, &file),
            };
            vec![IngestJob::new(SourceSpec::Delimited(file), kind)]
        }
        Commands::ToolOutput { dir } => tool_output_jobs(&dir, namespace).map_err(|e| e.to_string())?,
        Commands::Plist {
            file,
            kind,
            key_path,
            key_field,
            fields,
        } => {
            let selection = PlistSelection {
                key_path,
                key_field,
                fields,
            };
            vec![IngestJob::new(
                SourceSpec::Plist { path: file, selection },
                kind_named(&kind),
            )]
        }
        Commands::Sqlite { file, query, kind } => {
            vec![IngestJob::new(SourceSpec::Sqlite { path: file, query }, kind_named(&kind))]
        }
    })
}

fn run(cli: Cli) -> Result<Vec<FileOutcome>, String> {
    let config = load_config(&cli.global)?;
    if logging::is_debug_enabled() {
        debug!(namespace = %config.namespace, module = %config.module_name, "Using ingest config");
    }
    let store = open_store(&cli.global)?;
    let data_source = cli.global.data_source.clone();

    let mut jobs = build_jobs(cli.command, &config)?;
    if let Some(name) = data_source {
        let item = SourceItem::new(name.clone(), name);
        jobs = jobs.into_iter().map(|job| job.attributed_to(item.clone())).collect();
    }

    let engine = IngestEngine::new(store.as_ref(), config, &NeverCancel).map_err(|e| e.to_string())?;
    Ok(engine.ingest_all(jobs))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.global.verbose {
        logging::init_verbose();
    } else {
        logging::init();
    }

    match run(cli) {
        Ok(outcomes) => {
            for outcome in &outcomes {
                match serde_json::to_string(outcome) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!(source = %outcome.source(), "Cannot serialize outcome: {}", e),
                }
            }
            if outcomes.iter().any(|o| o.is_failure() || matches!(o, FileOutcome::Canceled { .. })) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}
