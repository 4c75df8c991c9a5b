use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use backup_meta_cli::config::{self, Config};
use backup_meta_scan::Scanner;
use backup_meta_storage::{find_log, MetadataRepository};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, args) = parse_args()?;
    let settings = config::resolve(&cfg, |key| env::var(key).ok())?;
    let repo = MetadataRepository::new(settings.store);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => run(&repo, &Scanner::new(settings.scan)),
        ["recover"] => {
            if !repo.recover()? {
                info!("nothing to recover");
            }
            Ok(())
        }
        ["show"] => {
            let catalog = repo.document().load_or_empty();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
        ["log", device, backup] => {
            let catalog = repo.document().load_or_empty();
            let path = find_log(&catalog, device, backup)?;
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading log file {}", path.display()))?;
            print!("{contents}");
            Ok(())
        }
        other => bail!("unexpected arguments {other:?}; usage: backup-meta [--config PATH] [run | recover | show | log DEVICE BACKUP]"),
    }
}

/// Parse CLI args, returning the loaded config and the remaining positional arguments.
fn parse_args() -> Result<(Config, Vec<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut rest = Vec::new();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => rest.push(other.to_owned()),
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, rest))
}

fn run(repo: &MetadataRepository, scanner: &Scanner) -> Result<()> {
    info!(root = %scanner.config().root.display(), "scanning backups");
    let summary = repo.run(scanner)?;
    info!(
        devices = summary.devices,
        records = summary.records,
        valid = summary.valid,
        new = summary.merge.new,
        invalidated = summary.merge.invalidated,
        "backup processing complete"
    );
    Ok(())
}
