//! CRUD operations for [`ResourceAttribute`] rows.
//!
//! Attributes are keyed by uid (the base64 path hash), never by plaintext
//! path. Reads used by the authorization walk are batched into a single
//! statement so one decision sees one consistent snapshot.

use rusqlite::params;

use abyss_shared::perms::Permission;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::ResourceAttribute;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert one attribute; an existing uid fails with
    /// [`StoreError::DuplicateAttribute`].
    pub fn insert_attribute(
        &self,
        uid: &str,
        owner: i64,
        permission: &Permission,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO resource_attributes (uid, owner, permission)
                 VALUES (?1, ?2, ?3)",
                params![uid, owner, permission.to_string()],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DuplicateAttribute
                }
                other => StoreError::Sqlite(other),
            })?;
        Ok(())
    }

    /// Insert or replace, used by bootstrap where re-runs overwrite.
    pub fn upsert_attribute(
        &self,
        uid: &str,
        owner: i64,
        permission: &Permission,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO resource_attributes (uid, owner, permission)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET owner = ?2, permission = ?3",
            params![uid, owner, permission.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_attribute(&self, uid: &str) -> Result<ResourceAttribute> {
        self.conn()
            .query_row(
                "SELECT uid, owner, permission
                 FROM resource_attributes
                 WHERE uid = ?1",
                params![uid],
                row_to_attribute,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Batch fetch for a set of uids in one statement. Missing uids are
    /// absent from the result; the caller decides what absence means.
    pub fn get_attributes(&self, uids: &[String]) -> Result<Vec<ResourceAttribute>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uids.len()].join(",");
        let sql = format!(
            "SELECT uid, owner, permission
             FROM resource_attributes
             WHERE uid IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(uids.iter()), row_to_attribute)?;

        let mut attrs = Vec::new();
        for row in rows {
            attrs.push(row?);
        }
        Ok(attrs)
    }

    pub fn attribute_exists(&self, uid: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM resource_attributes WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Bulk permission update; returns the number of rows changed.
    pub fn update_permissions(&self, uids: &[String], permission: &Permission) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; uids.len()].join(",");
        let sql = format!(
            "UPDATE resource_attributes SET permission = ?
             WHERE uid IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let perm_text = permission.to_string();
        let bind = std::iter::once(&perm_text as &dyn rusqlite::ToSql)
            .chain(uids.iter().map(|u| u as &dyn rusqlite::ToSql));
        let changed = stmt.execute(rusqlite::params_from_iter(bind))?;
        Ok(changed)
    }

    /// Bulk ownership update; returns the number of rows changed.
    pub fn update_owners(&self, uids: &[String], owner: i64) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; uids.len()].join(",");
        let sql = format!(
            "UPDATE resource_attributes SET owner = ?
             WHERE uid IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let bind = std::iter::once(&owner as &dyn rusqlite::ToSql)
            .chain(uids.iter().map(|u| u as &dyn rusqlite::ToSql));
        let changed = stmt.execute(rusqlite::params_from_iter(bind))?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete by uid. Returns `true` if a row was deleted.
    pub fn delete_attribute(&self, uid: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM resource_attributes WHERE uid = ?1",
            params![uid],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`ResourceAttribute`].
fn row_to_attribute(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceAttribute> {
    let perm_text: String = row.get(2)?;
    let permission: Permission = perm_text.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("permission {perm_text:?}").into(),
        )
    })?;

    Ok(ResourceAttribute {
        uid: row.get(0)?,
        owner: row.get(1)?,
        permission,
    })
}
