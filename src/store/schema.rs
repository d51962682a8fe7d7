//! Versioned schema for the local durable store.
//!
//! Each entry is applied once, in order, and `PRAGMA user_version` records how
//! many have run. Entries must only add to the schema so older data survives.

pub const MIGRATIONS: &[&str] = &[V1_COLLECTIONS, V2_DELIVERY_ATTEMPTS];

const V1_COLLECTIONS: &str = r#"
-- Registry of known collections
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    auto_key INTEGER NOT NULL
);

INSERT OR IGNORE INTO collections (name, auto_key) VALUES ('members', 0);
INSERT OR IGNORE INTO collections (name, auto_key) VALUES ('pendingActions', 1);

-- Records of every collection (serialized JSON)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    seq INTEGER,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_seq ON records(collection, seq);
"#;

const V2_DELIVERY_ATTEMPTS: &str = r#"
-- Failed delivery bookkeeping, kept apart so queued actions are never rewritten
CREATE TABLE IF NOT EXISTS delivery_attempts (
    action_key INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_attempt_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
