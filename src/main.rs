use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};

use vaultcache::api::UploadFile;
use vaultcache::cache::CacheSource;
use vaultcache::config::{self, Config};
use vaultcache::transfer::TransferSource;
use vaultcache::{logging, DataError, DataLayer};

#[derive(Parser, Debug)]
#[command(name = "vaultcache")]
#[command(about = "File storage client with ETag caching, idempotent transfers and offline files")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vaultcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level regardless of VAULTCACHE_LOG
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List folders
  Folders,
  /// List files in a folder
  Ls { folder: u64 },
  /// Upload a local file into a folder
  Upload {
    path: PathBuf,
    #[arg(long)]
    folder: u64,
  },
  /// Download a file
  Download {
    id: u64,
    /// Keep a copy for offline use
    #[arg(long)]
    offline: bool,
    /// Where to write the content (default: the file's name)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Keep files available offline
  Pin {
    #[arg(required = true)]
    ids: Vec<u64>,
  },
  /// Drop offline copies
  Unpin {
    #[arg(required = true)]
    ids: Vec<u64>,
  },
  /// List offline files
  Offline {
    #[arg(long)]
    folder: Option<u64>,
  },
  /// Show how much space offline files use
  OfflineSize,
  /// Remove every offline file
  OfflineClear,
  /// Delete a file on the server
  Rm {
    id: u64,
    #[arg(long)]
    folder: u64,
  },
}

impl Command {
  fn needs_session(&self) -> bool {
    !matches!(
      self,
      Command::Unpin { .. } | Command::Offline { .. } | Command::OfflineSize | Command::OfflineClear
    )
  }
}

/// Authenticate with a token from the environment, or log in with a password.
async fn start_session(layer: &DataLayer, config: &Config) -> Result<()> {
  if let Some(token) = Config::get_token() {
    layer.set_credential(token);
    return Ok(());
  }

  let username = config
    .backend
    .username
    .as_deref()
    .ok_or_else(|| eyre!("No credentials. Set VAULTCACHE_TOKEN or backend.username in the config."))?;
  let password = Config::get_password()?;
  layer.login(username, &password).await?;
  Ok(())
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "fresh",
    CacheSource::Revalidated => "revalidated",
    CacheSource::CacheFresh => "cached",
    CacheSource::Offline => "offline, may be stale",
  }
}

fn transfer_label(source: TransferSource) -> &'static str {
  match source {
    TransferSource::Network => "transferred",
    TransferSource::Duplicate => "already done",
    TransferSource::OfflineStore => "from offline store",
  }
}

fn human_size(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
  let mut size = bytes as f64;
  let mut unit = 0;
  while size >= 1024.0 && unit < UNITS.len() - 1 {
    size /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} {}", bytes, UNITS[0])
  } else {
    format!("{:.1} {}", size, UNITS[unit])
  }
}

/// Tell the user how long to wait after a 429, when the server said.
fn rate_limit_hint(report: &color_eyre::Report) -> Option<String> {
  let wait = report
    .downcast_ref::<DataError>()?
    .retry_guidance()?
    .backoff()?;
  Some(format!("Rate limited; retry in {}s", wait.as_secs().max(1)))
}

async fn upload(layer: &DataLayer, path: &Path, folder: u64) -> Result<()> {
  let content = tokio::fs::read(path)
    .await
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  let name = path
    .file_name()
    .and_then(|n| n.to_str())
    .ok_or_else(|| eyre!("Not a file path: {}", path.display()))?;

  let outcome = layer
    .upload_file(&UploadFile::new(name, content), folder)
    .await?;
  match outcome.receipt.remote_file() {
    Some(file) => println!(
      "{}\t{}\t{} ({})",
      file.id,
      file.original_name,
      human_size(file.size),
      transfer_label(outcome.source)
    ),
    None => println!("{} uploaded ({})", name, transfer_label(outcome.source)),
  }
  Ok(())
}

async fn download(layer: &DataLayer, id: u64, offline: bool, output: Option<PathBuf>) -> Result<()> {
  let outcome = layer.download_file(id, offline).await?;

  let output = match output {
    Some(path) => path,
    None => {
      let name = layer
        .offline_store()
        .get_metadata(id)
        .ok()
        .flatten()
        .map(|m| m.display_name)
        .unwrap_or_else(|| format!("file-{}", id));
      PathBuf::from(name)
    }
  };
  tokio::fs::write(&output, &outcome.file.content)
    .await
    .map_err(|e| eyre!("Failed to write {}: {}", output.display(), e))?;

  println!(
    "{} -> {} ({}, {}{})",
    id,
    output.display(),
    human_size(outcome.file.content.len() as u64),
    transfer_label(outcome.source),
    if outcome.pinned { ", pinned" } else { "" }
  );
  Ok(())
}

async fn run(layer: &DataLayer, command: Command) -> Result<()> {
  match command {
    Command::Folders => {
      let result = layer.list_folders().await?;
      for folder in &result.data {
        println!("{}\t{}", folder.id, folder.name);
      }
      eprintln!("({})", source_label(result.source));
    }
    Command::Ls { folder } => {
      let result = layer.list_files(folder).await?;
      for file in &result.data {
        println!(
          "{}\t{}\t{}",
          file.id,
          file.original_name,
          human_size(file.size)
        );
      }
      eprintln!("({})", source_label(result.source));
    }
    Command::Upload { path, folder } => upload(layer, &path, folder).await?,
    Command::Download { id, offline, output } => download(layer, id, offline, output).await?,
    Command::Pin { ids } => {
      let results = futures::future::join_all(ids.iter().map(|id| layer.pin_offline(*id))).await;
      let mut failed = 0;
      for (id, result) in ids.iter().zip(results) {
        match result {
          Ok(outcome) if outcome.pinned => println!("{}\tpinned", id),
          Ok(_) => {
            failed += 1;
            println!("{}\tdownloaded but not stored offline", id);
          }
          Err(e) => {
            failed += 1;
            println!("{}\tfailed: {}", id, e);
          }
        }
      }
      if failed > 0 {
        return Err(eyre!("{} of {} files were not pinned", failed, ids.len()));
      }
    }
    Command::Unpin { ids } => {
      for id in ids {
        let removed = layer.unpin_offline(id)?;
        println!("{}\t{}", id, if removed { "unpinned" } else { "was not pinned" });
      }
    }
    Command::Offline { folder } => {
      let files = match folder {
        Some(folder) => layer.list_offline_files_in_folder(folder)?,
        None => layer.list_offline_files()?,
      };
      for file in files {
        println!(
          "{}\t{}\t{}\t{}",
          file.file_id,
          file.display_name,
          human_size(file.byte_size),
          file.cached_at.format("%Y-%m-%d %H:%M")
        );
      }
    }
    Command::OfflineSize => println!("{}", human_size(layer.offline_storage_size()?)),
    Command::OfflineClear => println!("removed {} files", layer.clear_offline_files()?),
    Command::Rm { id, folder } => {
      layer.delete_file(id, folder).await?;
      println!("{}\tdeleted", id);
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let layer = DataLayer::connect(&config)?;
  let needs_session = match &args.command {
    // A pinned file can be read without the network.
    Command::Download {
      id, offline: false, ..
    } => !layer.offline_store().has(*id).unwrap_or(false),
    command => command.needs_session(),
  };
  if needs_session {
    start_session(&layer, &config).await?;
  }

  let result = run(&layer, args.command).await;
  if let Some(hint) = result.as_ref().err().and_then(rate_limit_hint) {
    eprintln!("{}", hint);
  }
  result
}
