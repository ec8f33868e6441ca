//! Path-based authorization walk.
//!
//! Every decision derives from the requester's user record and the
//! attribute rows of the path and its ancestors: each strict prefix needs
//! Read, the target needs the requested operation. All attribute rows for
//! one call are fetched in a single batched read, so a decision sees one
//! consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use abyss_shared::error::AbyssError;
use abyss_shared::perms::{decide, AccessKind};
use abyss_shared::uid::resource_uid;
use abyss_store::{ResourceAttribute, User};

use crate::Store;

pub struct Authority {
    store: Store,
    media_root: PathBuf,
}

/// Snapshot of the attribute and owner rows one authorization call needs.
pub struct DecisionSet {
    attrs: HashMap<String, ResourceAttribute>,
    owners: HashMap<i64, User>,
}

impl DecisionSet {
    /// Decide one `(uid, access)` pair. A missing attribute or an
    /// unresolvable owner denies.
    pub fn allows(&self, requester: &User, uid: &str, access: AccessKind) -> bool {
        let Some(attr) = self.attrs.get(uid) else {
            return false;
        };
        let Some(owner) = self.owners.get(&attr.owner) else {
            return false;
        };
        decide(
            &attr.permission,
            attr.owner,
            owner.principal(),
            requester.principal(),
            access,
        )
    }

    pub fn attribute(&self, uid: &str) -> Option<&ResourceAttribute> {
        self.attrs.get(uid)
    }
}

impl Authority {
    /// `media_root` is normalized once here; all boundary checks compare
    /// against this canonical form.
    pub fn new(store: Store, media_root: &Path) -> Self {
        let media_root = std::fs::canonicalize(media_root)
            .unwrap_or_else(|_| media_root.to_path_buf());
        Self { store, media_root }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// Absolute filesystem path for a relative media path.
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.media_root.join(relative)
    }

    /// Reduce `path` (absolute or media-root-relative) to its canonical
    /// relative form, the input to the uid hash. `..` anywhere and paths
    /// escaping the media root are rejected before any storage is touched.
    pub fn relative_path(&self, path: &str) -> Result<String, AbyssError> {
        let p = Path::new(path);
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(AbyssError::Malformed(format!("path traversal: {path:?}")));
        }

        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.media_root.join(p)
        };

        let full_text = full.to_string_lossy().replace('\\', "/");
        let root_text = self.media_root.to_string_lossy().replace('\\', "/");

        // Case-insensitive prefix compare against the normalized root, with
        // a component boundary so /opt does not claim /optx.
        if full_text.len() < root_text.len()
            || !full_text[..root_text.len()].eq_ignore_ascii_case(&root_text)
        {
            return Err(AbyssError::Malformed(format!(
                "path outside media root: {path:?}"
            )));
        }
        let rest = &full_text[root_text.len()..];
        if !(rest.is_empty() || rest.starts_with('/')) {
            return Err(AbyssError::Malformed(format!(
                "path outside media root: {path:?}"
            )));
        }

        let relative = rest
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != ".")
            .collect::<Vec<_>>()
            .join("/");
        Ok(relative)
    }

    /// The `(uid, access)` pairs a path requires: Read on every strict
    /// prefix, `access` on the target.
    fn walk_requirements(relative: &str, access: AccessKind) -> Vec<(String, AccessKind)> {
        let components: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        if components.is_empty() {
            // The media root itself carries no attribute row, so this
            // requirement can never be satisfied.
            return vec![(resource_uid(""), access)];
        }

        let mut requirements = Vec::with_capacity(components.len());
        let mut prefix = String::new();
        for (i, component) in components.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            let kind = if i + 1 == components.len() {
                access
            } else {
                AccessKind::Read
            };
            requirements.push((resource_uid(&prefix), kind));
        }
        requirements
    }

    /// Load the attributes and owner records for a uid set in one pass.
    pub async fn load(&self, uids: &[String]) -> Result<DecisionSet, AbyssError> {
        let db = self.store.lock().await;
        let attrs = db
            .get_attributes(uids)
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;

        let owner_ids: Vec<i64> = attrs
            .iter()
            .map(|a| a.owner)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let owners = db
            .find_users_by_uuids(&owner_ids)
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;

        Ok(DecisionSet {
            attrs: attrs.into_iter().map(|a| (a.uid.clone(), a)).collect(),
            owners: owners.into_iter().map(|u| (u.uuid, u)).collect(),
        })
    }

    /// Authorize one path for one operation.
    pub async fn authorize(
        &self,
        requester: &User,
        path: &str,
        access: AccessKind,
    ) -> Result<String, AbyssError> {
        let relative = self.relative_path(path)?;
        let requirements = Self::walk_requirements(&relative, access);

        let uids: Vec<String> = requirements
            .iter()
            .map(|(uid, _)| uid.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let set = self.load(&uids).await?;

        for (uid, kind) in &requirements {
            if !set.allows(requester, uid, *kind) {
                return Err(AbyssError::PermissionDenied);
            }
        }
        Ok(relative)
    }

    /// Batch form: per-path verdicts keyed by the paths as given.
    /// Malformed or unmanaged paths map to false, never to an error.
    pub async fn valid_any(
        &self,
        requester: &User,
        paths: &[String],
        access: AccessKind,
    ) -> Result<HashMap<String, bool>, AbyssError> {
        let mut plans: Vec<(String, Option<Vec<(String, AccessKind)>>)> = Vec::new();
        let mut uids = HashSet::new();
        for path in paths {
            match self.relative_path(path) {
                Ok(relative) => {
                    let reqs = Self::walk_requirements(&relative, access);
                    for (uid, _) in &reqs {
                        uids.insert(uid.clone());
                    }
                    plans.push((path.clone(), Some(reqs)));
                }
                Err(_) => plans.push((path.clone(), None)),
            }
        }

        let uids: Vec<String> = uids.into_iter().collect();
        let set = self.load(&uids).await?;

        // Each (uid, access) pair is decided at most once per call.
        let mut memo: HashMap<(String, AccessKind), bool> = HashMap::new();
        let mut verdicts = HashMap::new();
        for (path, reqs) in plans {
            let allowed = match reqs {
                None => false,
                Some(reqs) => reqs.into_iter().all(|(uid, kind)| {
                    *memo
                        .entry((uid.clone(), kind))
                        .or_insert_with(|| set.allows(requester, &uid, kind))
                }),
            };
            verdicts.insert(path, allowed);
        }
        Ok(verdicts)
    }

    /// Conjunctive batch form; false as soon as any path fails.
    #[allow(dead_code)]
    pub async fn valid_all(
        &self,
        requester: &User,
        paths: &[String],
        access: AccessKind,
    ) -> Result<bool, AbyssError> {
        let verdicts = self.valid_any(requester, paths, access).await?;
        Ok(paths.iter().all(|p| verdicts.get(p).copied().unwrap_or(false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use abyss_shared::perms::Permission;
    use abyss_store::Database;

    struct Fixture {
        authority: Authority,
        root: User,
        owner: User,
        peer: User,
        lesser: User,
        _dir: tempfile::TempDir,
    }

    fn perm(s: &str) -> Permission {
        s.parse().unwrap()
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();

        let root = db.insert_user("root", 1, &[1u8; 32], 1024).unwrap();
        let owner = db.insert_user("owner", 1, &[2u8; 32], 10).unwrap();
        let peer = db.insert_user("peer", 1, &[3u8; 32], 10).unwrap();
        let lesser = db.insert_user("lesser", 1, &[4u8; 32], 5).unwrap();

        // Videos/ world-readable, owned by root; Videos/a owned by `owner`,
        // peers may read; the file itself owner-only.
        db.insert_attribute(&resource_uid("Videos"), root.uuid, &perm("rw,r-,r-"))
            .unwrap();
        db.insert_attribute(&resource_uid("Videos/a"), owner.uuid, &perm("rw,r-,--"))
            .unwrap();
        db.insert_attribute(&resource_uid("Videos/a/f.mp4"), owner.uuid, &perm("rw,--,--"))
            .unwrap();

        let store: Store = Arc::new(tokio::sync::Mutex::new(db));
        let authority = Authority::new(store, dir.path());
        Fixture {
            authority,
            root,
            owner,
            peer,
            lesser,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn owner_reads_through_the_walk() {
        let f = fixture().await;
        f.authority
            .authorize(&f.owner, "Videos/a/f.mp4", AccessKind::Read)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn peer_denied_at_target_pair() {
        let f = fixture().await;
        // Peer passes the prefixes but the file's pair denies.
        let err = f
            .authority
            .authorize(&f.peer, "Videos/a/f.mp4", AccessKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::PermissionDenied));

        // The directory itself is peer-readable.
        f.authority
            .authorize(&f.peer, "Videos/a", AccessKind::Read)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lesser_privilege_denied_at_prefix() {
        let f = fixture().await;
        // `lesser` is Other on Videos/a (privilege 5 vs 10) with no read bit.
        let err = f
            .authority
            .authorize(&f.lesser, "Videos/a/f.mp4", AccessKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::PermissionDenied));
    }

    #[tokio::test]
    async fn root_overrides_everywhere_but_is_not_special_cased_here() {
        let f = fixture().await;
        // Root's privilege strictly exceeds every owner's, so Read/Write pass.
        f.authority
            .authorize(&f.root, "Videos/a/f.mp4", AccessKind::Write)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmanaged_path_denied() {
        let f = fixture().await;
        let err = f
            .authority
            .authorize(&f.owner, "Videos/unmanaged", AccessKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::PermissionDenied));
    }

    #[tokio::test]
    async fn traversal_rejected_before_storage() {
        let f = fixture().await;
        for path in ["../etc/passwd", "Videos/../../etc", "Videos/a/.."] {
            let err = f
                .authority
                .authorize(&f.root, path, AccessKind::Read)
                .await
                .unwrap_err();
            assert!(matches!(err, AbyssError::Malformed(_)), "{path}");
        }
        // Absolute path outside the root.
        let err = f
            .authority
            .authorize(&f.root, "/etc/passwd", AccessKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::Malformed(_)));
    }

    #[tokio::test]
    async fn sibling_root_prefix_rejected() {
        let f = fixture().await;
        let outside = format!("{}-evil/file", f.authority.media_root().display());
        let err = f
            .authority
            .authorize(&f.root, &outside, AccessKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::Malformed(_)));
    }

    #[tokio::test]
    async fn batch_verdicts_match_singles() {
        let f = fixture().await;
        let paths: Vec<String> = vec![
            "Videos/a".into(),
            "Videos/a/f.mp4".into(),
            "Videos/unmanaged".into(),
            "../escape".into(),
        ];
        let verdicts = f
            .authority
            .valid_any(&f.peer, &paths, AccessKind::Read)
            .await
            .unwrap();

        assert!(verdicts[&paths[0]]);
        assert!(!verdicts[&paths[1]]);
        assert!(!verdicts[&paths[2]]);
        assert!(!verdicts[&paths[3]]);

        // valid_all == conjunction of valid_any.
        assert!(!f
            .authority
            .valid_all(&f.peer, &paths, AccessKind::Read)
            .await
            .unwrap());
        assert!(f
            .authority
            .valid_all(&f.peer, &paths[..1].to_vec(), AccessKind::Read)
            .await
            .unwrap());
    }
}
