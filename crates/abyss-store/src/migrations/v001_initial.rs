//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `users` and `resource_attributes`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    uuid       INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT UNIQUE NOT NULL,             -- ASCII alphanumeric
    parent_id  INTEGER NOT NULL,                 -- creator's uuid
    public_key BLOB NOT NULL,                    -- raw 32-byte Ed25519
    privilege  INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Resource attributes
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS resource_attributes (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    uid        TEXT UNIQUE NOT NULL,             -- base64 path hash
    owner      INTEGER NOT NULL,                 -- uuid of owning user
    permission TEXT NOT NULL                     -- "oo,pp,tt"
);

CREATE INDEX IF NOT EXISTS idx_resource_attributes_uid
    ON resource_attributes(uid);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
