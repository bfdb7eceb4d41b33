use anyhow::Result;
use rusqlite::Connection;

// Window bounds and expiration are RFC 3339 UTC strings with nanosecond precision,
// so lexicographic comparison matches chronological order. NULL means open.
pub const USAGE_RECORDS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    record_id TEXT PRIMARY KEY,
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    feature_id TEXT NOT NULL,
    limit_id TEXT NOT NULL,
    window_start TEXT,
    window_end TEXT,
    units INTEGER NOT NULL,
    expiration_date TEXT,
    updated_at TEXT NOT NULL
);
"#;

pub const USAGE_RECORDS_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_window ON usage_records(
    subject_kind, subject_id, product_id, feature_id, limit_id,
    IFNULL(window_start, ''), IFNULL(window_end, '')
);
CREATE INDEX IF NOT EXISTS idx_usage_expiration ON usage_records(expiration_date);
"#;

pub const LIMIT_OVERRIDES_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS limit_overrides (
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    feature_id TEXT NOT NULL,
    limit_id TEXT NOT NULL,
    rule TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (subject_kind, subject_id, product_id, feature_id, limit_id)
);
"#;

pub fn init_database(conn: &Connection) -> Result<()> {
    conn.execute_batch(USAGE_RECORDS_TABLE_SCHEMA)?;
    conn.execute_batch(USAGE_RECORDS_INDEXES)?;
    conn.execute_batch(LIMIT_OVERRIDES_TABLE_SCHEMA)?;
    Ok(())
}
