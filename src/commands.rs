//! Subcommands for inspecting the persisted cache.

use chrono::DateTime;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::io::Write;

use vaultcache::context::AppContext;
use vaultcache::query::{PersistedRecord, QueryKey};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// List persisted query keys of the current cache version
  Keys,
  /// Print one persisted record
  Get {
    /// Logical key, e.g. `notes:null`
    key: String,
  },
  /// Delete one persisted record
  Remove { key: String },
  /// Delete every record of the current cache version
  Clear,
  /// Delete records left behind by other cache versions
  Prune,
  /// Restore persisted queries and report counts per query name
  Restore,
}

pub async fn run(command: Command, ctx: &AppContext, out: &mut impl Write) -> Result<()> {
  match command {
    Command::Keys => {
      ctx.persister.init()?;
      let mut keys = ctx.persister.keys()?;
      keys.sort();
      for key in keys {
        writeln!(out, "{}", key)?;
      }
    }
    Command::Get { key } => {
      ctx.persister.init()?;
      let record = ctx
        .persister
        .get::<PersistedRecord>(&key)?
        .ok_or_else(|| eyre!("No persisted record for {}", key))?;
      writeln!(out, "{}", format_record(&record)?)?;
    }
    Command::Remove { key } => {
      ctx.persister.init()?;
      ctx.persister.remove(&key)?;
      writeln!(out, "Removed {}", key)?;
    }
    Command::Clear => {
      ctx.persister.init()?;
      ctx.persister.clear()?;
      writeln!(out, "Cleared {}", ctx.persister.namespace())?;
    }
    Command::Prune => {
      ctx.persister.init()?;
      let removed = ctx.persister.prune_orphans()?;
      writeln!(out, "Pruned {} orphaned records", removed)?;
    }
    Command::Restore => {
      ctx.setup.setup().await?;
      let counts = count_by_name(ctx.queries.query_keys());
      if counts.is_empty() {
        writeln!(out, "Nothing to restore")?;
      }
      for (name, count) in counts {
        writeln!(out, "{:<20} {}", name, count)?;
      }
    }
  }
  Ok(())
}

fn format_record(record: &PersistedRecord) -> Result<String> {
  let saved = DateTime::from_timestamp_millis(record.timestamp)
    .map(|at| at.to_rfc3339())
    .unwrap_or_else(|| record.timestamp.to_string());
  let data = serde_json::to_string_pretty(&record.data)?;
  Ok(format!("saved: {}\n{}", saved, data))
}

fn count_by_name(keys: impl IntoIterator<Item = String>) -> BTreeMap<String, usize> {
  let mut counts = BTreeMap::new();
  for key in keys {
    if let Some(key) = QueryKey::parse(&key) {
      *counts.entry(key.name().to_string()).or_insert(0) += 1;
    }
  }
  counts
}
