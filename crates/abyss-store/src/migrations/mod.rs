pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type MigrationFn = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// Schema migrations in order. `user_version` records the last one applied.
const MIGRATIONS: &[(u32, &str, MigrationFn)] = &[(1, "v001_initial", v001_initial::up)];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    for (version, name, up) in MIGRATIONS {
        if current < *version {
            tracing::info!(migration = name, version, "applying schema migration");
            up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
            conn.pragma_update(None, "user_version", version)?;
        }
    }
    Ok(())
}
