/// Schema for the local database.
pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

-- Blob key-value records (persisted query cache, settings)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
