mod app;
mod cache;
mod config;
mod error;
mod event;
mod logging;
mod proxy;
mod server;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "offline-proxy")]
#[command(about = "Offline-first caching proxy for a single web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-proxy.yaml, then $XDG_CONFIG_HOME/offline-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to proxy, e.g. http://localhost:8000
  #[arg(short, long)]
  origin: Option<String>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<String>,

  /// Name of the current store version
  #[arg(long)]
  store_version: Option<String>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, falling back to defaults when only --origin is given
  let mut config = config::Config::load_or_origin(args.config.as_deref(), args.origin.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(version) = args.store_version {
    config.store.version = version;
  }
  config.validate()?;

  let _guard = logging::init(args.verbose, config.log_dir.as_deref())?;

  app::run(config).await
}
