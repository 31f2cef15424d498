//! recstore maintenance tool
//!
//! Inspects, verifies and compacts record stores on disk.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use recstore_core::{
    Engine, EngineKind, Recid, StoreAppend, StoreConfig, StoreDirect, StoreWal, VolumeKind,
};
use serde::Serialize;
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "recstore")]
#[command(about = "Inspect and maintain recstore files", long_about = None)]
struct Cli {
    /// TOML config file; command line options override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine the files were written by (direct, wal, append_only).
    #[arg(short, long)]
    engine: Option<String>,

    /// Use plain file IO instead of memory mapping.
    #[arg(long)]
    no_mmap: bool,

    /// Print machine-readable JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record and space statistics.
    Stats {
        /// Base path of the store files.
        path: PathBuf,
    },

    /// Verify checksums and free-space accounting.
    Verify { path: PathBuf },

    /// Print one record.
    Dump {
        path: PathBuf,
        recid: Recid,

        /// Write the raw payload to stdout.
        #[arg(long)]
        raw: bool,
    },

    /// Rewrite live records out of old segments (append-only stores).
    Compact { path: PathBuf },
}

enum Opened {
    Direct(StoreDirect),
    Wal(StoreWal),
    Append(StoreAppend),
}

impl Opened {
    fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.path.as_deref().unwrap_or(std::path::Path::new("?"));
        let context = || format!("Failed to open {} store at {}", engine_name(config.engine), path.display());
        Ok(match config.engine {
            EngineKind::Direct => Opened::Direct(StoreDirect::open(config).with_context(context)?),
            EngineKind::Wal => Opened::Wal(StoreWal::open(config).with_context(context)?),
            EngineKind::AppendOnly => {
                Opened::Append(StoreAppend::open(config).with_context(context)?)
            }
        })
    }

    fn engine(&self) -> &dyn Engine {
        match self {
            Opened::Direct(store) => store,
            Opened::Wal(store) => store,
            Opened::Append(store) => store,
        }
    }

    fn stats(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Opened::Direct(store) => serde_json::to_value(store.stats()?)?,
            Opened::Wal(store) => serde_json::to_value(store.stats()?)?,
            Opened::Append(store) => serde_json::to_value(store.stats()?)?,
        })
    }

    fn verify(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Opened::Direct(store) => serde_json::to_value(store.check_consistency()?)?,
            Opened::Wal(store) => serde_json::to_value(store.check_consistency()?)?,
            // replay on open already checked every batch
            Opened::Append(store) => serde_json::to_value(store.stats()?)?,
        })
    }
}

fn engine_name(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::Direct => "direct",
        EngineKind::Wal => "wal",
        EngineKind::AppendOnly => "append-only",
    }
}

fn build_config(cli: &Cli, path: PathBuf, read_only: bool) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(file) => StoreConfig::load(file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => StoreConfig::default(),
    };
    config.path = Some(path);
    if config.volume == VolumeKind::Memory {
        config.volume = VolumeKind::MappedFile;
    }
    if cli.no_mmap {
        config.volume = VolumeKind::File;
    }
    if let Some(engine) = &cli.engine {
        config.engine = engine.parse()?;
    }
    config.read_only = read_only;
    config.async_write = None;
    config.validate()?;
    Ok(config)
}

fn print_report<T: Serialize>(title: &str, report: &T, json: bool) -> Result<()> {
    let value = serde_json::to_value(report)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("{}", title.bright_green());
    if let serde_json::Value::Object(fields) = value {
        for (key, v) in fields {
            println!("  {:<18} {}", key, v.to_string().bright_cyan());
        }
    }
    Ok(())
}

fn hex_line(offset: usize, chunk: &[u8]) -> String {
    let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
    let text: String = chunk
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{offset:08x}  {:<48}  {text}", hex.join(" "))
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Stats { path } => {
            let store = Opened::open(&build_config(&cli, path.clone(), true)?)?;
            print_report("Store statistics", &store.stats()?, cli.json)?;
        }

        Commands::Verify { path } => {
            let store = Opened::open(&build_config(&cli, path.clone(), true)?)?;
            let report = store.verify().context("Store failed verification")?;
            if !cli.json {
                println!("{}", "Store is consistent".bright_green());
            }
            print_report("Store statistics", &report, cli.json)?;
        }

        Commands::Dump { path, recid, raw } => {
            let store = Opened::open(&build_config(&cli, path.clone(), true)?)?;
            let Some(data) = store.engine().get_bytes(*recid)? else {
                bail!("Record {recid} holds no value");
            };
            if *raw {
                use std::io::Write;
                std::io::stdout().write_all(&data)?;
            } else if cli.json {
                let dump = serde_json::json!({
                    "recid": recid,
                    "size": data.len(),
                    "text": String::from_utf8_lossy(&data),
                });
                println!("{}", serde_json::to_string_pretty(&dump)?);
            } else {
                println!(
                    "{} {} ({} bytes)",
                    "Record".bright_green(),
                    recid.to_string().bright_cyan(),
                    data.len()
                );
                for (i, chunk) in data.chunks(16).enumerate() {
                    println!("{}", hex_line(i * 16, chunk));
                }
            }
        }

        Commands::Compact { path } => {
            let mut config = build_config(&cli, path.clone(), false)?;
            if cli.engine.is_none() && cli.config.is_none() {
                config.engine = EngineKind::AppendOnly;
            }
            let Opened::Append(store) = Opened::open(&config)? else {
                bail!("Only append-only stores can be compacted");
            };
            let stats = store.compact()?;
            store.close()?;
            print_report("Compacted", &stats, cli.json)?;
        }
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("recstore=info,recstore_core=info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("{} {:#}", "Error:".bright_red(), e);
        std::process::exit(1);
    }
}
