//! `mrringest` - MRR-2 ingest daemon CLI
//!
//! This binary reads framed radar records from the MRR-2 serial link into
//! rotating raw files and publishes one derived data product per hour.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use tracing::info;

use mrr_ingest::cli::{Cli, Command, ConfigCommand, ProcessHourCommand, RunCommand};
use mrr_ingest::clock::SystemClock;
use mrr_ingest::dispatch::HourlyDispatcher;
use mrr_ingest::ingest::IngestLoop;
use mrr_ingest::transport::SerialLineTransport;
use mrr_ingest::upload::{NullSink, OutboxSink, UploadSink};
use mrr_ingest::{init_logging, Config, Error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Run(run_cmd) => run_daemon(config, run_cmd).await,
        Command::ProcessHour(cmd) => process_hour(&config, &cmd).await,
        Command::Config(config_cmd) => handle_config(&config, &config_cmd),
    }
}

/// Run the ingest daemon until process termination.
async fn run_daemon(mut config: Config, cmd: RunCommand) -> anyhow::Result<()> {
    if let Some(device) = cmd.device {
        config.transport.device = device;
    }
    if let Some(timeout) = cmd.timeout {
        config.transport.timeout_secs = timeout;
    }
    config.validate()?;
    bootstrap_dirs(&config)?;

    let transport = SerialLineTransport::open(&config.transport.device, config.read_timeout())?;

    let sink = make_sink(&config)?;
    let dispatcher = Arc::new(HourlyDispatcher::new(
        config.raw_dir(),
        config.converter.clone(),
        Arc::clone(&sink),
    ));
    let ingest = IngestLoop::new(
        config.work_dir(),
        config.raw_dir(),
        SystemClock,
        sink,
        dispatcher,
    );

    info!(
        device = %config.transport.device,
        raw_dir = %config.raw_dir().display(),
        "Starting ingest daemon"
    );
    ingest.run(transport).await?;
    Ok(())
}

/// Convert and publish one hour's batch manually.
async fn process_hour(config: &Config, cmd: &ProcessHourCommand) -> anyhow::Result<()> {
    bootstrap_dirs(config)?;

    let hour = match &cmd.hour {
        Some(prefix) => parse_hour_prefix(prefix)?,
        None => Utc::now() - chrono::Duration::hours(1),
    };

    let sink = make_sink(config)?;
    let dispatcher = HourlyDispatcher::new(config.raw_dir(), config.converter.clone(), sink);
    dispatcher.process_hour(hour).await?;
    Ok(())
}

/// Parse a `yyMMddHH` batch prefix into the hour it names.
fn parse_hour_prefix(prefix: &str) -> anyhow::Result<DateTime<Utc>> {
    let padded = format!("{prefix}0000");
    let naive = NaiveDateTime::parse_from_str(&padded, "%y%m%d%H%M%S")
        .with_context(|| format!("invalid hour prefix '{prefix}', expected yyMMddHH"))?;
    Ok(naive.and_utc())
}

/// Build the configured upload sink.
fn make_sink(config: &Config) -> anyhow::Result<Arc<dyn UploadSink>> {
    if config.upload.enabled {
        Ok(Arc::new(OutboxSink::new(config.outbox_dir())?))
    } else {
        Ok(Arc::new(NullSink))
    }
}

/// Create the work and storage directories if absent.
fn bootstrap_dirs(config: &Config) -> anyhow::Result<()> {
    for dir in [config.work_dir(), config.raw_dir()] {
        std::fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Transport]");
                println!("  Device:            {}", config.transport.device);
                println!("  Read timeout (s):  {}", config.transport.timeout_secs);
                println!();
                println!("[Storage]");
                println!("  Work directory:    {}", config.work_dir().display());
                println!("  Raw directory:     {}", config.raw_dir().display());
                println!();
                println!("[Converter]");
                println!("  Program:           {}", config.converter.program);
                println!("  Arguments:         {}", config.converter.args.join(" "));
                println!();
                println!("[Upload]");
                println!("  Enabled:           {}", config.upload.enabled);
                println!("  Outbox directory:  {}", config.outbox_dir().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.clone().unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
