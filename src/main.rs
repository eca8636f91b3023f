//! Split client-side CLI
//!
//! Fills the local flag store and evaluates flags against it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use split_client_side::{
    build_factory,
    config::Config,
    engine::Attributes,
    import,
    storage::{
        DbClient, SqlEventStorage, SqlImpressionStorage, SqlMySegmentsStorage, SqlSegmentStorage,
        SqlSplitStorage,
    },
    VERSION,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "split-client-side")]
#[command(version = VERSION)]
#[command(about = "Feature flags for a single traffic key, from a local store", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Flag store connection string, overriding the configuration
    #[arg(long, global = true)]
    sql_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a splitChanges (or, with --segment, segmentChanges) document into the store
    Import {
        /// JSON document to load
        file: PathBuf,

        /// Treat the document as segmentChanges
        #[arg(long)]
        segment: bool,
    },

    /// Set the segments a traffic key belongs to
    Segments {
        /// Traffic key
        key: String,

        /// Segment names
        names: Vec<String>,

        /// Read names from a mySegments document instead
        #[arg(long, conflicts_with = "names")]
        file: Option<PathBuf>,
    },

    /// Evaluate flags for a traffic key
    Treatment {
        /// Traffic key
        key: String,

        /// Flag names
        #[arg(required = true)]
        features: Vec<String>,

        /// Attributes as a JSON object
        #[arg(long)]
        attributes: Option<String>,

        /// API key
        #[arg(long, default_value = "client-side")]
        api_key: String,

        /// How long to wait for definitions, in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },

    /// Show what the store holds
    Status,

    /// Show configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.sql_url)?;

    match cli.command {
        Commands::Import { file, segment } => cmd_import(&config, &file, segment),
        Commands::Segments { key, names, file } => cmd_segments(&config, &key, names, file),
        Commands::Treatment {
            key,
            features,
            attributes,
            api_key,
            timeout_ms,
        } => cmd_treatment(
            config,
            &key,
            &features,
            attributes.as_deref(),
            &api_key,
            Duration::from_millis(timeout_ms),
        ),
        Commands::Status => cmd_status(&config),
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>, sql_url: Option<String>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?,
        None => Config::load().context("reading configuration")?,
    };
    if let Some(sql_url) = sql_url {
        config.sql_url = sql_url;
    }
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<DbClient> {
    DbClient::open(&config.sql_url)
        .with_context(|| format!("opening flag store {}", config.sql_url))
}

fn cmd_import(config: &Config, file: &Path, segment: bool) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let db = open_store(config)?;

    if segment {
        let summary = import::import_segment_changes(&SqlSegmentStorage::new(db), &json)?;
        println!(
            "Segment updated: {} added, {} removed (change number {})",
            summary.stored, summary.removed, summary.change_number
        );
    } else {
        let summary = import::import_split_changes(&SqlSplitStorage::new(db), &json)?;
        println!(
            "Imported {} splits, removed {} (change number {})",
            summary.stored, summary.removed, summary.change_number
        );
    }
    Ok(())
}

fn cmd_segments(
    config: &Config,
    key: &str,
    names: Vec<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let storage = SqlMySegmentsStorage::new(open_store(config)?);
    let names = match file {
        Some(file) => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            import::import_my_segments_json(&storage, key, &json)?
        }
        None => {
            import::import_my_segments(&storage, key, &names)?;
            names
        }
    };
    println!("{key} is in {} segment(s): {}", names.len(), names.join(", "));
    Ok(())
}

fn cmd_treatment(
    config: Config,
    key: &str,
    features: &[String],
    attributes: Option<&str>,
    api_key: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let attributes: Option<Attributes> = attributes
        .map(serde_json::from_str::<Attributes>)
        .transpose()
        .context("attributes must be a JSON object")?;

    let factory = build_factory(api_key, config, key)?;
    if let Err(e) = factory.block_until_ready(timeout) {
        eprintln!("Warning: {e}, treatments will be control");
    }

    let client = factory.client();
    let features: Vec<&str> = features.iter().map(String::as_str).collect();
    let treatments = client.get_treatments_with_config(&features, attributes.as_ref());

    let output: BTreeMap<_, _> = treatments
        .iter()
        .map(|(feature, (treatment, config))| {
            (
                feature.as_str(),
                serde_json::json!({ "treatment": treatment, "config": config }),
            )
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);

    factory.destroy();
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let db = open_store(config)?;
    let splits = SqlSplitStorage::new(db.clone());
    let impressions = SqlImpressionStorage::new(db.clone(), config.impressions_queue_size);
    let events = SqlEventStorage::new(db, config.events_queue_size);

    println!("Split Client-Side Status");
    println!("========================");
    println!();
    println!("Store: {}", config.sql_url);
    println!("Change number: {}", splits.get_change_number()?);
    println!("Splits: {}", splits.get_split_names()?.len());
    println!("Segments referenced: {}", splits.get_segment_names()?.len());
    println!();
    println!("Queued impressions: {}", impressions.count()?);
    println!("Queued events: {}", events.count()?);
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
