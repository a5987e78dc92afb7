use anyhow::{Context, Result};
use clap::Parser;
use hypothesis_protocol::{
    summarize, Cli, Config, Dataset, Engine, JsonRunStore, Protocol, ProtocolService, Reporter,
    RunStore, TerminalReporter, WorkerPool,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config and apply CLI overrides
    let mut config = Config::load_from(cli.config_path())?;
    cli.apply_to_config(&mut config);
    config.validate()?;

    init_tracing(&config);
    info!(?config, "configuration loaded");

    // 1. Load inputs
    let dataset_json = std::fs::read_to_string(&cli.dataset)
        .with_context(|| format!("Failed to read dataset: {}", cli.dataset.display()))?;
    let dataset = Dataset::from_json_str(&dataset_json)
        .with_context(|| format!("Failed to parse dataset: {}", cli.dataset.display()))?;
    let protocol_json = std::fs::read_to_string(&cli.protocol)
        .with_context(|| format!("Failed to read protocol: {}", cli.protocol.display()))?;
    let protocol = Protocol::from_json_str(&protocol_json)
        .with_context(|| format!("Failed to parse protocol: {}", cli.protocol.display()))?;

    // 2. Assemble the service
    let engine = Engine::new(Arc::new(config.methods.registry()), config.analysis.clone());
    let pool = Arc::new(WorkerPool::from_config(&config.pool));
    let store: Option<Arc<dyn RunStore>> = if cli.no_store {
        None
    } else {
        Some(Arc::new(JsonRunStore::new(config.storage.runs_dir.clone())))
    };
    let service = ProtocolService::new(engine, pool, store);

    // 3. Run
    let title = format!("{} on {}", protocol.name, dataset.id());
    let record = service
        .run_protocol(Arc::new(dataset), protocol)
        .await
        .context("Failed to run protocol")?;

    // 4. Report
    let mut reporter = if cli.no_color {
        TerminalReporter::without_colors()
    } else {
        TerminalReporter::new()
    };
    if cli.output.is_none() {
        // stdout carries the JSON record
        reporter = reporter.on_stderr();
    }
    reporter.report(&title, &summarize(&record))?;

    // 5. Emit the record
    let json = record.to_json_pretty()?;
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write run record: {}", path.display()))?,
        None => println!("{}", json),
    }

    Ok(())
}
