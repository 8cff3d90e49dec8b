/// File name of the queue database inside the data directory.
pub const DATABASE_FILE: &str = "pwa-database.db";

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Tables created by the version 1 upgrade.
pub const SCHEMA_V1: &str = r#"
-- Writes waiting for replay; AUTOINCREMENT keeps ids strictly increasing
-- and never reused, even after deletes.
CREATE TABLE IF NOT EXISTS post_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    body TEXT NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
