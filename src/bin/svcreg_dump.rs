//! svcreg-dump
//!
//! Recovers a persistent registrar from its data directory, prints its
//! stats and every live registration as JSON, then shuts it down.

use std::path::PathBuf;
use std::process::ExitCode;

use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use svcreg::{Registrar, RegistrarConfig};

struct Args {
    data_dir: PathBuf,
    config: Option<PathBuf>,
    snapshot: bool,
}

fn usage() {
    println!("svcreg-dump - print the contents of a registrar data directory");
    println!();
    println!("USAGE:");
    println!("    svcreg-dump [OPTIONS] <DATA_DIR>");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>   TOML configuration (persistence_dir is overridden)");
    println!("    -s, --snapshot        Write a snapshot before exiting (compacts the log)");
    println!("    -h, --help            Print help information");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut data_dir = None;
    let mut config = None;
    let mut snapshot = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args.get(i + 1).ok_or("--config requires a value")?;
                config = Some(PathBuf::from(value));
                i += 2;
            }
            "--snapshot" | "-s" => {
                snapshot = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => return Err(format!("unknown option: {other}")),
            other => {
                if data_dir.replace(PathBuf::from(other)).is_some() {
                    return Err("only one data directory may be given".to_string());
                }
                i += 1;
            }
        }
    }

    Ok(Args {
        data_dir: data_dir.ok_or("missing <DATA_DIR>")?,
        config,
        snapshot,
    })
}

fn run(args: Args) -> Result<(), String> {
    let mut config = match &args.config {
        Some(path) => RegistrarConfig::from_file(path).map_err(|e| e.to_string())?,
        None => RegistrarConfig::default(),
    };
    config.persistence_dir = Some(args.data_dir.clone());

    let registrar = Registrar::open(config).map_err(|e| format!("failed to open {}: {e}", args.data_dir.display()))?;
    let dump = registrar.dump().map_err(|e| e.to_string())?;
    let stats = registrar.stats();

    let out = json!({
        "stats": stats,
        "services": dump.services,
        "events": dump.events,
    });
    let text = serde_json::to_string_pretty(&out).map_err(|e| e.to_string())?;
    println!("{text}");

    if args.snapshot {
        registrar.snapshot().map_err(|e| format!("snapshot failed: {e}"))?;
        tracing::info!(dir = %args.data_dir.display(), "snapshot written");
    }
    registrar.destroy().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            usage();
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
