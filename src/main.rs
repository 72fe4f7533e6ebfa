//! StripeStor CLI
//!
//! Operator front-end for the erasure-coded object storage engine: ingest
//! a byte stream into a placement group of file-backed endpoints, read it
//! back, and verify or repair damaged objects.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stripestor::endpoint::FileEndpointProvider;
use stripestor::repair::{RepairEngine, RepairOptions};
use stripestor::{ObjectConfig, ObjectReader, StreamWriter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StripeStor - erasure-coded object storage over a placement group
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory holding one sub-directory per endpoint
    #[arg(long, env = "STRIPESTOR_BASE_DIR", default_value = ".")]
    base_dir: PathBuf,

    /// Object layout configuration (JSON)
    #[arg(long, env = "STRIPESTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STRIPESTOR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "STRIPESTOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a template object configuration to stdout
    InitConfig {
        /// Object name; a generated name is used when omitted
        #[arg(long)]
        object: Option<String>,

        /// Number of endpoints in the placement group
        #[arg(long, default_value = "6")]
        endpoints: u16,

        /// Bytes per stripe
        #[arg(long, default_value = "1048576")]
        chunk_size: u32,

        /// Data stripes per block
        #[arg(long, default_value = "4")]
        data_chunks: u16,
    },

    /// Ingest a file (or stdin) as a new object
    Write {
        /// Input path; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Read an object back to a file (or stdout)
    Read {
        /// Output path; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Verify an object without modifying it
    Check {
        /// Upper bound on concurrently allocated stripe read buffers
        #[arg(long, default_value = "64")]
        buffer_limit: usize,
    },

    /// Verify an object and rewrite damaged stripes
    Repair {
        /// Upper bound on concurrently allocated stripe read buffers
        #[arg(long, default_value = "64")]
        buffer_limit: usize,

        /// Re-run verification once repair completes
        #[arg(long)]
        check_after_repair: bool,
    },
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stripestor={level}")));
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }

    match args.command {
        Command::InitConfig {
            object,
            endpoints,
            chunk_size,
            data_chunks,
        } => {
            let object =
                object.unwrap_or_else(|| format!("obj-{}", uuid::Uuid::new_v4().simple()));
            let placement = (0..endpoints).map(|i| format!("ep-{i}")).collect();
            let cfg = ObjectConfig::new(object, placement, chunk_size, data_chunks, endpoints)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            return Ok(());
        }
        _ => {}
    }

    let config_path = args
        .config
        .context("--config is required for this command")?;
    let raw = std::fs::read(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let cfg: ObjectConfig = serde_json::from_slice(&raw).context("parse object config")?;
    cfg.validate()?;
    let cfg = Arc::new(cfg);
    let provider = FileEndpointProvider::new(&args.base_dir);

    match args.command {
        Command::InitConfig { .. } => unreachable!("handled above"),

        Command::Write { input } => {
            let mut data = Vec::new();
            match input {
                Some(path) => {
                    std::fs::File::open(&path)
                        .with_context(|| format!("open {}", path.display()))?
                        .read_to_end(&mut data)?;
                }
                None => {
                    std::io::stdin().read_to_end(&mut data)?;
                }
            }
            let mut writer = StreamWriter::open(Arc::clone(&cfg), &provider).await?;
            writer.write(&data)?;
            let written = writer.close().await?;
            info!(object = %cfg.object_name, written, "object stored");
        }

        Command::Read { output } => {
            let reader = ObjectReader::open(Arc::clone(&cfg), &provider).await?;
            let data = reader.read_all().await?;
            match output {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("write {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
            info!(object = %cfg.object_name, bytes = data.len(), "object read");
        }

        Command::Check { buffer_limit } => {
            let engine = RepairEngine::new(
                Arc::clone(&cfg),
                RepairOptions {
                    buffer_limit,
                    check_after_repair: false,
                },
            );
            let report = engine.check_object(&provider).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                std::process::exit(1);
            }
        }

        Command::Repair {
            buffer_limit,
            check_after_repair,
        } => {
            let engine = RepairEngine::new(
                Arc::clone(&cfg),
                RepairOptions {
                    buffer_limit,
                    check_after_repair,
                },
            );
            let report = engine.repair_object(&provider).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.repair_failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
