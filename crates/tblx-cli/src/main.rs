//! 🚀 tblx-cli: the front door, the bouncer, the maître d' of tblx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Parses flags, loads config, sets up logging, then lets the library do
//! the heavy lifting. Like a manager. 🦆
//!
//! Two faces:
//! - `tblx export <TABLE>`: the whole job, with a spinner and a summary table;
//! - `tblx worker <TABLE> --segment I ...`: hidden. One segment, spawned by the
//!   process executor. Talks in plain lines on stdout/stderr and ends with a
//!   `segment-report {json}` line. No tracing subscriber: stdout is the protocol.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, CellAlignment, Table, presets::UTF8_FULL_CONDENSED};
use tblx::app_config::{AppConfig, DestinationConfig, ExecutionMode, load_config};
use tblx::backends::{LocalStoreConfig, S3StoreConfig};
use tblx::coordinator::Executor;
use tblx::events::{EventKind, EventReceiver};
use tblx::progress::ExportProgress;
use tblx::workers::{REPORT_PREFIX, WorkerCommand};
use tblx::{ExportJob, ExportSummary};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// -- 🔧 the ol' reliable: picked up from the cwd when --config is absent
const DEFAULT_CONFIG_FILE: &str = "tblx.toml";
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Parser)]
#[command(name = "tblx", version, about = "📤 Export a table to CSV files, one segment per worker")]
struct Cli {
    /// TOML config file. Defaults to ./tblx.toml when it exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Upload to this S3 bucket instead of the configured destination.
    #[arg(long, global = true)]
    bucket: Option<String>,
    /// Key prefix inside the bucket.
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Write files under this local directory instead of the configured destination.
    #[arg(long, global = true, conflicts_with = "bucket")]
    output_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Export every segment of a table.
    Export(ExportArgs),
    /// Export one segment. Spawned by `export --workers process`.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
struct ExportArgs {
    table: String,
    /// Explicit header, in order. Without it, each file's first row decides.
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    #[arg(long, default_value_t = 1)]
    segments: u32,
    /// Gzip each file (.csv.gz).
    #[arg(long)]
    compress: bool,
    /// Rotate to a new file once this many MB are written. Defaults to 250.
    #[arg(long)]
    max_file_size_mb: Option<u64>,
    /// Where segments run. Overrides `runtime.execution`.
    #[arg(long, value_enum)]
    workers: Option<WorkersArg>,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    table: String,
    #[arg(long)]
    segment: u32,
    #[arg(long)]
    total_segments: u32,
    #[arg(long)]
    max_file_size_bytes: u64,
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    #[arg(long)]
    compress: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkersArg {
    InProcess,
    Process,
}

impl From<WorkersArg> for ExecutionMode {
    fn from(arg: WorkersArg) -> Self {
        match arg {
            WorkersArg::InProcess => ExecutionMode::InProcess,
            WorkersArg::Process => ExecutionMode::Process,
        }
    }
}

fn job_from(table: String, columns: Vec<String>) -> ExportJob {
    let job = ExportJob::new(table);
    if columns.is_empty() {
        job
    } else {
        job.with_columns(columns)
    }
}

impl Cli {
    fn config_path(&self) -> Option<PathBuf> {
        match &self.config {
            Some(path) => Some(path.clone()),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                fallback.exists().then(|| fallback.to_path_buf())
            }
        }
    }

    /// 🔧 Config file + env, then the destination flags on top.
    fn load(&self) -> Result<(AppConfig, Option<PathBuf>)> {
        let config_path = self.config_path();
        if let Some(path) = &config_path {
            if !path.try_exists().with_context(|| {
                format!("💀 Couldn't check whether '{}' exists.", path.display())
            })? {
                anyhow::bail!(
                    "💀 Configuration file '{}' doesn't exist. If it's a relative path, \
                     double check your cwd, or use an absolute path to be absolutely certain.",
                    path.display()
                );
            }
        }
        let mut config = load_config(config_path.as_deref()).context(
            "💀 In tblx-cli, main, we couldn't load the config. Make sure there's a [table] section.",
        )?;

        if let Some(bucket) = &self.bucket {
            let mut s3 = match config.destination {
                DestinationConfig::S3(existing) => S3StoreConfig {
                    bucket: bucket.clone(),
                    ..existing
                },
                DestinationConfig::Local(_) => S3StoreConfig::for_bucket(bucket.clone()),
            };
            if self.prefix.is_some() {
                s3.prefix = self.prefix.clone();
            }
            config.destination = DestinationConfig::S3(s3);
        } else if let Some(prefix) = &self.prefix {
            match &mut config.destination {
                DestinationConfig::S3(s3) => s3.prefix = Some(prefix.clone()),
                DestinationConfig::Local(_) => {
                    warn!("⚠️ --prefix only means something for S3 destinations; ignoring it")
                }
            }
        }
        if let Some(output_dir) = &self.output_dir {
            config.destination = DestinationConfig::Local(LocalStoreConfig {
                output_dir: output_dir.clone(),
            });
        }
        Ok((config, config_path))
    }

    /// 🧬 The global flags a worker process needs to see what we see.
    fn worker_command(&self, config_path: Option<&Path>) -> Result<WorkerCommand> {
        let program = std::env::current_exe()
            .context("💀 Couldn't find our own executable to spawn workers from")?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        if let Some(bucket) = &self.bucket {
            args.extend(["--bucket".to_string(), bucket.clone()]);
        }
        if let Some(prefix) = &self.prefix {
            args.extend(["--prefix".to_string(), prefix.clone()]);
        }
        if let Some(output_dir) = &self.output_dir {
            let output_dir = std::path::absolute(output_dir).unwrap_or_else(|_| output_dir.clone());
            args.extend(["--output-dir".to_string(), output_dir.display().to_string()]);
        }
        Ok(WorkerCommand::new(program).with_args(args))
    }
}

/// 🚀 main(): where it all begins. The "I pressed enter and held my breath" moment.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Export(args) => {
            // 📡 tracing for the human-facing mode only. Workers keep stdout clean.
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_writer(std::io::stderr)
                .init();
            run_export(&cli, args).await
        }
        Command::Worker(args) => run_worker(&cli, args).await,
    };

    if let Err(err) = result {
        report_failure(&cli.command, &err);
        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }
}

async fn run_export(cli: &Cli, args: &ExportArgs) -> Result<()> {
    let (mut config, config_path) = cli.load()?;
    if let Some(workers) = args.workers {
        config.runtime.execution = workers.into();
    }
    let executor = match config.runtime.execution {
        ExecutionMode::InProcess => Executor::InProcess,
        ExecutionMode::Process => Executor::Process(cli.worker_command(config_path.as_deref())?),
    };

    let job = job_from(args.table.clone(), args.columns.clone())
        .with_segments(args.segments)
        .compressed(args.compress)
        .with_max_file_size_bytes(ExportJob::max_file_size_from_mb(args.max_file_size_mb));

    let (coordinator, events) = tblx::build_coordinator(&config).await?;
    let coordinator = coordinator.with_executor(executor);
    let progress = if std::io::stderr().is_terminal() {
        ExportProgress::new(&job.table)
    } else {
        ExportProgress::hidden(&job.table)
    };
    let watcher = tokio::spawn(watch(events, progress));

    let outcome = coordinator.export_table(&job).await;
    // -- dropping the coordinator drops the last sender, which ends the watcher
    drop(coordinator);
    let progress = watcher.await.context("💀 The progress watcher panicked")?;
    progress.finish();

    let summary = outcome?;
    println!("{}", summary_table(&summary));
    info!(
        "🏁 {} rows in {} file(s) after {:.1}s",
        summary.rows,
        summary.files,
        progress.elapsed().as_secs_f64()
    );
    Ok(())
}

/// 👀 Log every event at the level its kind deserves and keep the spinner fed.
async fn watch(events: EventReceiver, mut progress: ExportProgress) -> ExportProgress {
    while let Ok(event) = events.recv().await {
        match event.kind() {
            EventKind::Info => info!("{event}"),
            EventKind::ThroughputExceeded => warn!("🐢 {event}"),
            EventKind::Error => error!("💀 {event}"),
        }
        progress.observe(&event);
    }
    progress
}

fn summary_table(summary: &ExportSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["segment", "rows", "MiB", "files"]);
    let right = |text: String| Cell::new(text).set_alignment(CellAlignment::Right);
    for segment in &summary.segments {
        table.add_row(vec![
            right(segment.segment.to_string()),
            right(segment.rows.to_string()),
            right(format!("{:.2}", segment.bytes as f64 / BYTES_PER_MIB)),
            right(segment.files.len().to_string()),
        ]);
    }
    table.add_row(vec![
        Cell::new(format!("{} total", summary.table)),
        right(summary.rows.to_string()),
        right(format!("{:.2}", summary.bytes as f64 / BYTES_PER_MIB)),
        right(summary.files.to_string()),
    ]);
    table
}

async fn run_worker(cli: &Cli, args: &WorkerArgs) -> Result<()> {
    let (config, _) = cli.load()?;
    let job = job_from(args.table.clone(), args.columns.clone())
        .with_segments(args.total_segments)
        .compressed(args.compress)
        .with_max_file_size_bytes(args.max_file_size_bytes);

    let (coordinator, events) = tblx::build_coordinator(&config).await?;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind() {
                EventKind::Error => eprintln!("{event}"),
                _ => println!("{event}"),
            }
        }
    });

    let outcome = coordinator.export_segment(&job, args.segment).await;
    drop(coordinator);
    printer.await.context("💀 The event printer panicked")?;

    let report = outcome?;
    let json = serde_json::to_string(&report).context("💀 Couldn't serialize the segment report")?;
    println!("{REPORT_PREFIX}{json}");
    Ok(())
}

/// 🧅 Peel the error onion, one tear-jerking layer at a time.
fn report_failure(command: &Command, err: &anyhow::Error) {
    if let Command::Worker(_) = command {
        // -- the parent turns each stderr line into an error event for this segment
        eprintln!("{err:#}");
        return;
    }

    error!("💀 error: {err}");
    eprintln!("💀 error: {err}");
    let mut the_vibes_are_giving_connection_issues = false;
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {cause}");
        eprintln!("⚠️  cause: {cause}");
        let cause_str = cause.to_string();
        if cause_str.contains("dispatch failure")
            || cause_str.contains("error sending request")
            || cause_str.contains("onnection refused")
            || cause_str.contains("tcp connect error")
            || cause_str.contains("dns error")
        {
            the_vibes_are_giving_connection_issues = true;
        }
    }
    if the_vibes_are_giving_connection_issues {
        eprintln!(
            "🔧 hint: looks like AWS (or your local stand-in) isn't reachable. Check the region, \
             the endpoint_url, and your credentials. If you're running DynamoDB Local or MinIO \
             in Docker, `docker ps` will tell you whether it's actually up. ☕"
        );
    }
}
