//! Media operations behind the authorization walk.
//!
//! Everything here takes a resolved actor (the API layer turns tokens into
//! users first, the control socket acts as root) and goes through
//! [`Authority`] before touching the filesystem or the attribute table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info};

use abyss_shared::constants::{RESERVED_DIRS, ROOT_UUID};
use abyss_shared::error::AbyssError;
use abyss_shared::perms::{render_listing, AccessKind, Permission};
use abyss_shared::uid::resource_uid;
use abyss_store::{ResourceAttribute, StoreError, User};

use crate::authz::Authority;
use crate::Store;

/// One row of a directory listing, as the `ls` surfaces render it.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub permission: String,
    pub owner: i64,
    pub uid: String,
    pub name: String,
}

pub struct Resources {
    authority: Arc<Authority>,
    store: Store,
    debug_mode: bool,
}

impl Resources {
    pub fn new(authority: Arc<Authority>, store: Store, debug_mode: bool) -> Self {
        Self {
            authority,
            store,
            debug_mode,
        }
    }

    #[allow(dead_code)]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// List the immediate children the actor may Read. Denied or
    /// unmanaged children are dropped silently.
    pub async fn query(&self, actor: &User, path: &str) -> Result<Vec<String>, AbyssError> {
        let relative = self
            .authority
            .authorize(actor, path, AccessKind::Read)
            .await?;
        let full = self.authority.full_path(&relative);

        let mut names = Vec::new();
        let mut child_paths = Vec::new();
        let mut entries = fs::read_dir(&full).await.map_err(|_| AbyssError::NotFound)?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                child_paths.push(join_relative(&relative, name));
                names.push(name.to_string());
            }
        }

        let verdicts = self
            .authority
            .valid_any(actor, &child_paths, AccessKind::Read)
            .await?;
        Ok(names
            .into_iter()
            .zip(child_paths.iter())
            .filter(|(_, child)| verdicts.get(*child).copied().unwrap_or(false))
            .map(|(name, _)| name)
            .collect())
    }

    /// Authorize Read and hand back the absolute path for range-capable
    /// serving by the HTTP layer.
    pub async fn get_file(&self, actor: &User, path: &str) -> Result<PathBuf, AbyssError> {
        let relative = self
            .authority
            .authorize(actor, path, AccessKind::Read)
            .await?;
        let full = self.authority.full_path(&relative);
        if !fs::try_exists(&full).await.unwrap_or(false) {
            return Err(AbyssError::NotFound);
        }
        Ok(full)
    }

    pub async fn get_string(&self, actor: &User, path: &str) -> Result<String, AbyssError> {
        let relative = self
            .authority
            .authorize(actor, path, AccessKind::Read)
            .await?;
        fs::read_to_string(self.authority.full_path(&relative))
            .await
            .map_err(|_| AbyssError::NotFound)
    }

    /// Batch text read: `path -> Some(text)` where authorized and
    /// readable, `None` otherwise. Partial failure never errors the batch.
    pub async fn get_all_string(
        &self,
        actor: &User,
        paths: &[String],
    ) -> Result<HashMap<String, Option<String>>, AbyssError> {
        let verdicts = self
            .authority
            .valid_any(actor, paths, AccessKind::Read)
            .await?;

        let mut out = HashMap::new();
        for path in paths {
            let text = if verdicts.get(path).copied().unwrap_or(false) {
                match self.authority.relative_path(path) {
                    Ok(relative) => fs::read_to_string(self.authority.full_path(&relative))
                        .await
                        .ok(),
                    Err(_) => None,
                }
            } else {
                None
            };
            out.insert(path.clone(), text);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Replace file contents atomically (write-then-rename).
    pub async fn update_string(
        &self,
        actor: &User,
        path: &str,
        body: &str,
    ) -> Result<(), AbyssError> {
        let relative = self
            .authority
            .authorize(actor, path, AccessKind::Write)
            .await?;
        let full = self.authority.full_path(&relative);

        let file_name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AbyssError::Malformed(format!("not a file path: {path:?}")))?;
        let tmp = full.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &full).await?;
        debug!(path = %relative, bytes = body.len(), "replaced file contents");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attribute management
    // ------------------------------------------------------------------

    /// Recursively bring a subtree under management: one owner-only
    /// attribute per path that has none yet. Root-only, except that debug
    /// mode waives the check for local bring-up. Returns the number of
    /// attributes inserted; a second run inserts none.
    pub async fn initialize(
        &self,
        actor: &User,
        path: &str,
        owner: i64,
    ) -> Result<usize, AbyssError> {
        if actor.uuid != ROOT_UUID && !self.debug_mode {
            return Err(AbyssError::PermissionDenied);
        }
        let relative = self.authority.relative_path(path)?;

        {
            let db = self.store.lock().await;
            db.find_user_by_uuid(owner)
                .map_err(|_| AbyssError::UserNotFound)?;
        }

        let mut targets = vec![relative.clone()];
        targets.extend(self.collect_descendants(&relative).await?);

        let permission = Permission::owner_only();
        let mut inserted = 0usize;
        let db = self.store.lock().await;
        for target in &targets {
            match db.insert_attribute(&resource_uid(target), owner, &permission) {
                Ok(()) => inserted += 1,
                Err(StoreError::DuplicateAttribute) => {}
                Err(e) => return Err(AbyssError::Malformed(format!("storage: {e}"))),
            }
        }
        info!(path = %relative, owner, inserted, total = targets.len(), "initialized subtree");
        Ok(inserted)
    }

    /// Root-only single insert; an existing attribute is a conflict.
    pub async fn include(
        &self,
        actor: &User,
        path: &str,
        owner: i64,
        permission: &Permission,
    ) -> Result<(), AbyssError> {
        if actor.uuid != ROOT_UUID {
            return Err(AbyssError::PermissionDenied);
        }
        let relative = self.authority.relative_path(path)?;
        let db = self.store.lock().await;
        db.find_user_by_uuid(owner)
            .map_err(|_| AbyssError::UserNotFound)?;
        db.insert_attribute(&resource_uid(&relative), owner, permission)
            .map_err(|e| match e {
                StoreError::DuplicateAttribute => {
                    AbyssError::Conflict(format!("attribute exists for {relative:?}"))
                }
                other => AbyssError::Malformed(format!("storage: {other}")),
            })
    }

    /// Root-only delete by uid.
    pub async fn exclude(&self, actor: &User, path: &str) -> Result<(), AbyssError> {
        if actor.uuid != ROOT_UUID {
            return Err(AbyssError::PermissionDenied);
        }
        let relative = self.authority.relative_path(path)?;
        let db = self.store.lock().await;
        if db
            .delete_attribute(&resource_uid(&relative))
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?
        {
            Ok(())
        } else {
            Err(AbyssError::NotFound)
        }
    }

    /// Bulk permission change. Security must hold on the target and, when
    /// recursive, on every managed descendant before any row is written.
    pub async fn chmod(
        &self,
        actor: &User,
        path: &str,
        permission: &Permission,
        recursive: bool,
    ) -> Result<usize, AbyssError> {
        let uids = self.security_set(actor, path, recursive).await?;
        let db = self.store.lock().await;
        let changed = db
            .update_permissions(&uids, permission)
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;
        info!(path, recursive, changed, "chmod applied");
        Ok(changed)
    }

    /// Bulk ownership change; the new owner must exist.
    pub async fn chown(
        &self,
        actor: &User,
        path: &str,
        new_owner: i64,
        recursive: bool,
    ) -> Result<usize, AbyssError> {
        let uids = self.security_set(actor, path, recursive).await?;
        let db = self.store.lock().await;
        db.find_user_by_uuid(new_owner)
            .map_err(|_| AbyssError::UserNotFound)?;
        let changed = db
            .update_owners(&uids, new_owner)
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;
        info!(path, recursive, new_owner, changed, "chown applied");
        Ok(changed)
    }

    /// Unauthorized convenience read of one attribute row.
    #[allow(dead_code)]
    pub async fn get_attribute(&self, path: &str) -> Result<ResourceAttribute, AbyssError> {
        let relative = self.authority.relative_path(path)?;
        let db = self.store.lock().await;
        db.get_attribute(&resource_uid(&relative)).map_err(|e| match e {
            StoreError::NotFound => AbyssError::NotFound,
            other => AbyssError::Malformed(format!("storage: {other}")),
        })
    }

    #[allow(dead_code)]
    pub async fn exists(&self, path: &str) -> Result<bool, AbyssError> {
        let relative = self.authority.relative_path(path)?;
        let db = self.store.lock().await;
        db.attribute_exists(&resource_uid(&relative))
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))
    }

    /// Directory listing with attribute rows, for the `ls` surfaces.
    /// Unmanaged children are omitted.
    pub async fn list_entries(&self, path: &str) -> Result<Vec<ListEntry>, AbyssError> {
        let relative = self.authority.relative_path(path)?;
        let full = self.authority.full_path(&relative);

        let mut children: Vec<(String, bool)> = Vec::new();
        let mut entries = fs::read_dir(&full).await.map_err(|_| AbyssError::NotFound)?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                children.push((name.to_string(), is_dir));
            }
        }

        let uids: Vec<String> = children
            .iter()
            .map(|(name, _)| resource_uid(&join_relative(&relative, name)))
            .collect();
        let attrs = {
            let db = self.store.lock().await;
            db.get_attributes(&uids)
                .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?
        };
        let by_uid: HashMap<String, ResourceAttribute> =
            attrs.into_iter().map(|a| (a.uid.clone(), a)).collect();

        let mut out = Vec::new();
        for ((name, is_dir), uid) in children.into_iter().zip(uids) {
            if let Some(attr) = by_uid.get(&uid) {
                out.push(ListEntry {
                    permission: render_listing(&attr.permission, is_dir),
                    owner: attr.owner,
                    uid: attr.uid.clone(),
                    name,
                });
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Live channels
    // ------------------------------------------------------------------

    /// Create a live channel under `Live/`, owned by the actor. Needs
    /// Write on the `Live` directory itself.
    pub async fn create_channel(&self, actor: &User, id: &str) -> Result<(), AbyssError> {
        if id.is_empty()
            || !id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(AbyssError::Malformed(format!("channel id: {id:?}")));
        }
        self.authority
            .authorize(actor, "Live", AccessKind::Write)
            .await?;

        let relative = format!("Live/{id}");
        fs::create_dir_all(self.authority.full_path(&relative)).await?;
        let db = self.store.lock().await;
        db.insert_attribute(&resource_uid(&relative), actor.uuid, &Permission::owner_only())
            .map_err(|e| match e {
                StoreError::DuplicateAttribute => {
                    AbyssError::Conflict(format!("channel exists: {id:?}"))
                }
                other => AbyssError::Malformed(format!("storage: {other}")),
            })
    }

    /// Tear down a live channel: its attribute rows and its directory.
    /// Needs Security on the channel.
    pub async fn remove_channel(&self, actor: &User, id: &str) -> Result<(), AbyssError> {
        let relative = format!("Live/{id}");
        let uids = self.security_set(actor, &relative, true).await?;
        {
            let db = self.store.lock().await;
            for uid in &uids {
                db.delete_attribute(uid)
                    .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;
            }
        }
        let _ = fs::remove_dir_all(self.authority.full_path(&relative)).await;
        info!(channel = id, "live channel removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// First-run setup for a media root: create the reserved directories
    /// and (re)write world-readable attributes for `Tasks/` and `Live/`
    /// owned by root. Re-running replaces, never duplicates.
    pub async fn bootstrap(&self) -> Result<(), AbyssError> {
        for dir in RESERVED_DIRS {
            fs::create_dir_all(self.authority.full_path(dir)).await?;
        }
        let world = Permission::world_readable();
        let db = self.store.lock().await;
        for dir in ["Tasks", "Live"] {
            db.upsert_attribute(&resource_uid(dir), ROOT_UUID, &world)
                .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;
        }
        info!(root = %self.authority.media_root().display(), "media root bootstrapped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// All managed uids a chmod/chown touches, with the Security
    /// precondition checked over the whole set first.
    async fn security_set(
        &self,
        actor: &User,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, AbyssError> {
        let relative = self
            .authority
            .authorize(actor, path, AccessKind::Security)
            .await?;

        let mut uids = vec![resource_uid(&relative)];
        if recursive {
            let descendants = self.collect_descendants(&relative).await?;
            let candidate_uids: Vec<String> =
                descendants.iter().map(|d| resource_uid(d)).collect();
            let set = self.authority.load(&candidate_uids).await?;
            for uid in candidate_uids {
                // Only managed descendants are part of the batch; each one
                // must pass Security before any row is written.
                if set.attribute(&uid).is_some() {
                    if !set.allows(actor, &uid, AccessKind::Security) {
                        return Err(AbyssError::PermissionDenied);
                    }
                    uids.push(uid);
                }
            }
        }
        Ok(uids)
    }

    /// Relative paths of every descendant of `relative`, depth-first.
    async fn collect_descendants(&self, relative: &str) -> Result<Vec<String>, AbyssError> {
        let mut found = Vec::new();
        let mut stack = vec![relative.to_string()];
        while let Some(current) = stack.pop() {
            let full = self.authority.full_path(&current);
            let Ok(mut entries) = fs::read_dir(&full).await else {
                continue; // files and unreadable dirs end the walk here
            };
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    let child = join_relative(&current, name);
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        stack.push(child.clone());
                    }
                    found.push(child);
                }
            }
        }
        Ok(found)
    }
}

fn join_relative(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}
