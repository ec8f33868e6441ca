//! CRUD operations for [`User`] records.

use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new user. Usernames are unique; a clash fails with
    /// [`StoreError::DuplicateUser`]. Returns the stored record with its
    /// assigned uuid (the first user in an empty table gets uuid 1).
    pub fn insert_user(
        &self,
        username: &str,
        parent_id: i64,
        public_key: &[u8; 32],
        privilege: i64,
    ) -> Result<User> {
        self.conn()
            .execute(
                "INSERT INTO users (username, parent_id, public_key, privilege)
                 VALUES (?1, ?2, ?3, ?4)",
                params![username, parent_id, public_key.as_slice(), privilege],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DuplicateUser
                }
                other => StoreError::Sqlite(other),
            })?;

        let uuid = self.conn().last_insert_rowid();
        Ok(User {
            uuid,
            username: username.to_string(),
            parent_id,
            public_key: *public_key,
            privilege,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn find_user_by_uuid(&self, uuid: i64) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT uuid, username, parent_id, public_key, privilege
                 FROM users
                 WHERE uuid = ?1",
                params![uuid],
                row_to_user,
            )
            .map_err(map_not_found)
    }

    pub fn find_user_by_name(&self, username: &str) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT uuid, username, parent_id, public_key, privilege
                 FROM users
                 WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .map_err(map_not_found)
    }

    /// Fetch several users in one statement, e.g. the distinct owners seen
    /// during a path walk. Unknown uuids are simply absent from the result.
    pub fn find_users_by_uuids(&self, uuids: &[i64]) -> Result<Vec<User>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uuids.len()].join(",");
        let sql = format!(
            "SELECT uuid, username, parent_id, public_key, privilege
             FROM users
             WHERE uuid IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(uuids.iter()), row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    pub fn users_is_empty(&self) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    /// All registered public keys, for the tunnel handshake's
    /// verify-against-any step.
    pub fn all_public_keys(&self) -> Result<Vec<[u8; 32]>> {
        let mut stmt = self.conn().prepare("SELECT public_key FROM users")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(blob_to_key(row?)?);
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn blob_to_key(blob: Vec<u8>) -> Result<[u8; 32]> {
    blob.as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("public key of {} bytes", blob.len())))
}

/// Map a `rusqlite::Row` to a [`User`].
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let blob: Vec<u8> = row.get(3)?;
    let public_key: [u8; 32] = blob.as_slice().try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Blob,
            format!("public key of {} bytes", blob.len()).into(),
        )
    })?;

    Ok(User {
        uuid: row.get(0)?,
        username: row.get(1)?,
        parent_id: row.get(2)?,
        public_key,
        privilege: row.get(4)?,
    })
}
