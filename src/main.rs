use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use grix::config::PopulationConfig;
use grix::monitor::{EventSink, MonitorEvent};
use grix::populate::{PopulationJob, PopulationOutcome};
use grix::progress::{ProgressBar, ProgressStyle};
use grix::schema::{AccumulatorProvider, IndexBuildDescriptor, SchemaDescriptor};
use grix::stats::IndexStatisticsStore;
use grix::store::{EntityRecord, InMemoryEntityStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "grix")]
#[command(about = "Online secondary-index population engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Populate one or more indexes from an entity snapshot
    Populate {
        /// JSON file with an array of entity records
        data: PathBuf,

        /// Index definition, `name:token,token:prop,prop` (repeatable)
        #[arg(short, long = "index", required = true)]
        indexes: Vec<String>,

        /// Config file (TOML); env vars override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Statistics file to update
        #[arg(short, long)]
        stats: Option<PathBuf>,

        /// Persist built indexes as segments under this directory
        #[arg(long)]
        segments: Option<PathBuf>,
    },
    /// Show persisted index statistics
    Stats {
        /// Statistics file
        stats: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Populate {
            data,
            indexes,
            config,
            stats,
            segments,
        } => populate(data, indexes, config, stats, segments),
        Commands::Stats { stats } => show_stats(stats),
    }
}

fn populate(
    data: PathBuf,
    indexes: Vec<String>,
    config: Option<PathBuf>,
    stats: Option<PathBuf>,
    segments: Option<PathBuf>,
) -> Result<()> {
    let raw = std::fs::read_to_string(&data)
        .with_context(|| format!("reading entity snapshot {}", data.display()))?;
    let records: Vec<EntityRecord> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", data.display()))?;
    let entity_count = records.len();
    let store = Arc::new(InMemoryEntityStore::load(records));

    let config = PopulationConfig::load(config.as_deref())?;
    let stats_store = match stats {
        Some(path) => Arc::new(IndexStatisticsStore::open(path)?),
        None => Arc::new(IndexStatisticsStore::in_memory()),
    };

    let mut descriptors = Vec::new();
    for (i, spec) in indexes.iter().enumerate() {
        let (name, schema) = parse_index_spec(spec)?;
        let provider = match &segments {
            Some(dir) => AccumulatorProvider::Segment { dir: dir.clone() },
            None => AccumulatorProvider::Memory,
        };
        descriptors.push(IndexBuildDescriptor::new(i as u64 + 1, name, schema, provider));
    }

    let (tx, rx) = mpsc::channel();
    let handle = PopulationJob::new(store, descriptors)
        .config(config)
        .stats(stats_store.clone())
        .events(EventSink::new(tx))
        .start()?;

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}%")?
            .progress_chars("=> "),
    );
    bar.set_message(format!("Scanning {entity_count} entities"));

    // Drain events until the job settles and the channel is quiet
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => render_event(&bar, event),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if handle.outcome().is_some() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Ok(event) = rx.try_recv() {
        render_event(&bar, event);
    }
    bar.finish_and_clear();

    let outcome = handle
        .await_completion(None)
        .unwrap_or(PopulationOutcome::Failed("job thread vanished".into()));
    match &outcome {
        PopulationOutcome::Completed => println!("Population completed"),
        PopulationOutcome::Cancelled => println!("Population cancelled"),
        PopulationOutcome::Failed(reason) => println!("Population failed: {reason}"),
    }

    for (index_id, proxy) in handle.proxies() {
        let state = format!("{:?}", proxy.state());
        match stats_store.get(*index_id) {
            Some(stat) => println!(
                "  index {index_id}: {state}, {} entries, {} distinct values",
                stat.sample.index_size, stat.sample.unique_values
            ),
            None => println!("  index {index_id}: {state}"),
        }
    }

    if matches!(outcome, PopulationOutcome::Failed(_)) {
        bail!("population did not complete");
    }
    Ok(())
}

fn render_event(bar: &ProgressBar, event: MonitorEvent) {
    match event {
        MonitorEvent::PopulationStarted { index_id, name } => {
            bar.set_message(format!("Populating '{name}' (index {index_id})"));
        }
        MonitorEvent::ScanStarting => {}
        MonitorEvent::Progress { percent } => {
            bar.set_position((percent * 10.0) as u64);
        }
        MonitorEvent::ScanCompleted => {
            bar.set_message("Scan complete, flipping indexes".to_string());
        }
        MonitorEvent::PopulationCompleted { peak_queued_bytes } => {
            bar.set_message(format!(
                "Done (peak queued bytes: {peak_queued_bytes})"
            ));
        }
        MonitorEvent::PopulationFailed {
            index_id,
            name,
            reason,
        } => {
            bar.set_message(format!("Index '{name}' ({index_id}) failed: {reason}"));
        }
        MonitorEvent::PopulationCancelled => {
            bar.set_message("Cancelled".to_string());
        }
    }
}

/// `name:token,token:prop,prop`, e.g. `by_name:1:7` or `pairs:1,2:3,4`
fn parse_index_spec(spec: &str) -> Result<(String, SchemaDescriptor)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [name, tokens, properties] = parts.as_slice() else {
        bail!("index spec '{spec}' is not of the form name:tokens:properties");
    };
    if name.is_empty() {
        bail!("index spec '{spec}' has an empty name");
    }
    let tokens = parse_id_list(tokens)
        .with_context(|| format!("bad token list in index spec '{spec}'"))?;
    let properties = parse_id_list(properties)
        .with_context(|| format!("bad property list in index spec '{spec}'"))?;
    if properties.is_empty() {
        bail!("index spec '{spec}' declares no properties");
    }
    Ok((name.to_string(), SchemaDescriptor::new(tokens, properties)))
}

fn parse_id_list(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse::<u32>().map_err(Into::into))
        .collect()
}

fn show_stats(path: PathBuf) -> Result<()> {
    let store = IndexStatisticsStore::open(path)?;
    let samples = store.samples();
    if samples.is_empty() {
        println!("No statistics recorded");
        return Ok(());
    }
    println!(
        "{:>8}  {:>12}  {:>15}  {:>12}",
        "index", "entries", "distinct values", "sample size"
    );
    for (id, sample) in samples {
        println!(
            "{:>8}  {:>12}  {:>15}  {:>12}",
            id, sample.index_size, sample.unique_values, sample.sample_size
        );
    }
    Ok(())
}
