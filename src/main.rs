mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use vaultcache::config::Config;
use vaultcache::context::AppContext;
use vaultcache::setup::Anonymous;

#[derive(Parser, Debug)]
#[command(name = "vaultcache")]
#[command(about = "Inspect and maintain the local drive cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vaultcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version to operate on
  #[arg(long)]
  cache_version: Option<u32>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override cache version if specified on command line
  if let Some(version) = args.cache_version {
    config.cache.version = version;
  }

  let _guard = vaultcache::logging::init(&config.log);

  // Offline tooling never signs in
  let ctx = AppContext::new(config, Arc::new(Anonymous))?;
  commands::run(args.command, &ctx, &mut std::io::stdout().lock()).await?;

  Ok(())
}
