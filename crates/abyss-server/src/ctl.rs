//! Admin control socket.
//!
//! A stream socket on the filesystem carrying one request/response pair per
//! connection, encoded per [`abyss_shared::control`]. The socket's
//! filesystem permissions are the trust boundary: handlers act with root
//! authority and never see a session token. Dispatch is a static match on
//! the request head.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use abyss_shared::constants::{ROOT_PRIVILEGE, ROOT_UUID};
use abyss_shared::control::{head, status, CtlMessage};
use abyss_shared::error::AbyssError;
use abyss_shared::identity::Identity;
use abyss_shared::perms::Permission;
use abyss_store::{StoreError, User};

use crate::resources::Resources;
use crate::Store;

#[derive(Clone)]
pub struct CtlState {
    pub store: Store,
    pub resources: Arc<Resources>,
}

pub async fn serve(socket_path: &Path, state: CtlState) -> anyhow::Result<()> {
    // A stale socket file from a previous run blocks bind.
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "Control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                warn!(error = %e, "control connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, state: CtlState) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let response = match CtlMessage::decode(&line) {
        Ok(request) => {
            debug!(head = request.head, "control request");
            dispatch(request, &state).await
        }
        Err(e) => CtlMessage::error(status::BAD_REQUEST, e.to_string()),
    };

    write_half
        .write_all(format!("{}\n", response.encode()?).as_bytes())
        .await?;
    write_half.flush().await?;
    Ok(())
}

pub async fn dispatch(request: CtlMessage, state: &CtlState) -> CtlMessage {
    let result = match request.head {
        head::HELLO => Ok(CtlMessage::ok(vec![
            "abyss".into(),
            env!("CARGO_PKG_VERSION").into(),
        ])),
        head::INIT => handle_init(state).await,
        head::USERADD => handle_useradd(&request.params, state).await,
        head::INCLUDE => handle_include(&request.params, state).await,
        head::CHMOD => handle_chmod(&request.params, state).await,
        head::LIST => handle_list(&request.params, state).await,
        other => {
            warn!(head = other, "unknown control head");
            Ok(CtlMessage::error(status::BAD_REQUEST, "unknown head"))
        }
    };
    result.unwrap_or_else(error_response)
}

/// Bootstrap: create the root user and the reserved directories. Running
/// the command is the operator's explicit confirmation; a populated user
/// table refuses.
async fn handle_init(state: &CtlState) -> Result<CtlMessage, AbyssError> {
    {
        let db = state.store.lock().await;
        if !db
            .users_is_empty()
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?
        {
            return Ok(CtlMessage::error(status::FORBIDDEN, "already initialized"));
        }
    }

    let identity = Identity::generate();
    {
        let db = state.store.lock().await;
        let root = db
            .insert_user("root", ROOT_UUID, &identity.public_key_bytes(), ROOT_PRIVILEGE)
            .map_err(|e| AbyssError::Malformed(format!("storage: {e}")))?;
        debug_assert_eq!(root.uuid, ROOT_UUID);
    }
    state.resources.bootstrap().await?;

    info!(
        pubkey = hex::encode(identity.public_key_bytes()),
        "root user created, media root bootstrapped"
    );
    Ok(CtlMessage::ok(vec![identity.private_key_base64()]))
}

/// `useradd <username> <privilege>`: returns the generated private key.
async fn handle_useradd(params: &[String], state: &CtlState) -> Result<CtlMessage, AbyssError> {
    let [username, privilege] = params else {
        return Ok(CtlMessage::error(status::BAD_REQUEST, "useradd <name> <privilege>"));
    };
    if username.is_empty() || !username.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(AbyssError::UsernameInvalid);
    }
    let privilege: i64 = privilege
        .parse()
        .map_err(|_| AbyssError::Malformed(format!("privilege: {privilege:?}")))?;

    let identity = Identity::generate();
    {
        let db = state.store.lock().await;
        db.insert_user(username, ROOT_UUID, &identity.public_key_bytes(), privilege)
            .map_err(|e| match e {
                StoreError::DuplicateUser => AbyssError::DuplicateUser,
                other => AbyssError::Malformed(format!("storage: {other}")),
            })?;
    }
    info!(
        user = %username,
        privilege,
        pubkey = hex::encode(identity.public_key_bytes()),
        "user added via control socket"
    );
    Ok(CtlMessage::ok(vec![identity.private_key_base64()]))
}

/// `include <path> <owner_uuid> <recursive>`: bring a path (or subtree)
/// under management with owner-only permissions.
async fn handle_include(params: &[String], state: &CtlState) -> Result<CtlMessage, AbyssError> {
    let [path, owner, recursive] = params else {
        return Ok(CtlMessage::error(
            status::BAD_REQUEST,
            "include <path> <owner> <recursive>",
        ));
    };
    let owner: i64 = owner
        .parse()
        .map_err(|_| AbyssError::Malformed(format!("owner: {owner:?}")))?;
    let recursive = parse_bool(recursive)?;
    let root = root_actor(state).await?;

    let inserted = if recursive {
        state.resources.initialize(&root, path, owner).await?
    } else {
        state
            .resources
            .include(&root, path, owner, &Permission::owner_only())
            .await?;
        1
    };
    Ok(CtlMessage::ok(vec![inserted.to_string()]))
}

/// `chmod <path> <permission> <recursive>`: returns the changed row count.
async fn handle_chmod(params: &[String], state: &CtlState) -> Result<CtlMessage, AbyssError> {
    let [path, permission, recursive] = params else {
        return Ok(CtlMessage::error(
            status::BAD_REQUEST,
            "chmod <path> <permission> <recursive>",
        ));
    };
    let permission: Permission = permission.parse()?;
    let recursive = parse_bool(recursive)?;
    let root = root_actor(state).await?;

    let changed = state
        .resources
        .chmod(&root, path, &permission, recursive)
        .await?;
    Ok(CtlMessage::ok(vec![changed.to_string()]))
}

/// `list <path>`: one `"<permission> <owner> <uid> <name>"` param per
/// managed entry.
async fn handle_list(params: &[String], state: &CtlState) -> Result<CtlMessage, AbyssError> {
    let [path] = params else {
        return Ok(CtlMessage::error(status::BAD_REQUEST, "list <path>"));
    };
    let entries = state.resources.list_entries(path).await?;
    Ok(CtlMessage::ok(
        entries
            .into_iter()
            .map(|e| format!("{} {} {} {}", e.permission, e.owner, e.uid, e.name))
            .collect(),
    ))
}

async fn root_actor(state: &CtlState) -> Result<User, AbyssError> {
    let db = state.store.lock().await;
    db.find_user_by_uuid(ROOT_UUID)
        .map_err(|_| AbyssError::Malformed("not initialized".into()))
}

fn parse_bool(raw: &str) -> Result<bool, AbyssError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(AbyssError::Malformed(format!("boolean: {other:?}"))),
    }
}

fn error_response(e: AbyssError) -> CtlMessage {
    let code = match e {
        AbyssError::PermissionDenied
        | AbyssError::DuplicateUser
        | AbyssError::Conflict(_) => status::FORBIDDEN,
        AbyssError::NotFound | AbyssError::UserNotFound => status::NOT_FOUND,
        AbyssError::Malformed(_) | AbyssError::UsernameInvalid => status::BAD_REQUEST,
        _ => status::INTERNAL,
    };
    CtlMessage::error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use abyss_shared::constants::RESERVED_DIRS;
    use abyss_store::Database;

    use crate::authz::Authority;

    fn state(dir: &Path) -> CtlState {
        let db = Database::open_in_memory().unwrap();
        let store: Store = Arc::new(tokio::sync::Mutex::new(db));
        let authority = Arc::new(Authority::new(store.clone(), dir));
        let resources = Arc::new(Resources::new(authority, store.clone(), false));
        CtlState { store, resources }
    }

    #[tokio::test]
    async fn init_creates_root_and_reserved_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let response = dispatch(CtlMessage::new(head::INIT, vec![]), &state).await;
        assert_eq!(response.head, status::OK);
        assert_eq!(response.params.len(), 1);

        // The returned private key belongs to the stored root user.
        let identity = Identity::from_private_base64(&response.params[0]).unwrap();
        let root = {
            let db = state.store.lock().await;
            db.find_user_by_uuid(ROOT_UUID).unwrap()
        };
        assert_eq!(root.username, "root");
        assert_eq!(root.public_key, identity.public_key_bytes());

        for sub in RESERVED_DIRS {
            assert!(dir.path().join(sub).is_dir());
        }
        assert!(state.resources.exists("Tasks").await.unwrap());
        assert!(state.resources.exists("Live").await.unwrap());

        // Re-running refuses.
        let again = dispatch(CtlMessage::new(head::INIT, vec![]), &state).await;
        assert_eq!(again.head, status::FORBIDDEN);
    }

    #[tokio::test]
    async fn useradd_returns_working_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        dispatch(CtlMessage::new(head::INIT, vec![]), &state).await;

        let response = dispatch(
            CtlMessage::new(head::USERADD, vec!["alice".into(), "10".into()]),
            &state,
        )
        .await;
        assert_eq!(response.head, status::OK);
        Identity::from_private_base64(&response.params[0]).unwrap();

        let alice = {
            let db = state.store.lock().await;
            db.find_user_by_name("alice").unwrap()
        };
        assert_eq!(alice.privilege, 10);
        assert_eq!(alice.parent_id, ROOT_UUID);

        // Duplicate and malformed names are refused.
        let dup = dispatch(
            CtlMessage::new(head::USERADD, vec!["alice".into(), "10".into()]),
            &state,
        )
        .await;
        assert_eq!(dup.head, status::FORBIDDEN);
        let bad = dispatch(
            CtlMessage::new(head::USERADD, vec!["al ice".into(), "10".into()]),
            &state,
        )
        .await;
        assert_eq!(bad.head, status::BAD_REQUEST);
    }

    #[tokio::test]
    async fn include_chmod_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        dispatch(CtlMessage::new(head::INIT, vec![]), &state).await;

        std::fs::create_dir_all(dir.path().join("Videos/show1")).unwrap();
        std::fs::write(dir.path().join("Videos/show1/summary.json"), "{}").unwrap();

        let response = dispatch(
            CtlMessage::new(
                head::INCLUDE,
                vec!["Videos".into(), "1".into(), "true".into()],
            ),
            &state,
        )
        .await;
        assert_eq!(response.head, status::OK);
        assert_eq!(response.params, vec!["3"]);

        let response = dispatch(
            CtlMessage::new(
                head::CHMOD,
                vec!["Videos".into(), "rw,r-,r-".into(), "true".into()],
            ),
            &state,
        )
        .await;
        assert_eq!(response.head, status::OK);
        assert_eq!(response.params, vec!["3"]);

        let response = dispatch(CtlMessage::new(head::LIST, vec!["Videos".into()]), &state).await;
        assert_eq!(response.head, status::OK);
        assert_eq!(response.params.len(), 1);
        assert!(response.params[0].starts_with("drw-r--r-- 1 "));
        assert!(response.params[0].ends_with(" show1"));
    }

    #[tokio::test]
    async fn unknown_head_gets_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let response = dispatch(CtlMessage::new(42, vec![]), &state).await;
        assert_eq!(response.head, status::BAD_REQUEST);
    }

    #[tokio::test]
    async fn socket_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let socket = dir.path().join("abyss-ctl.sock");

        let serve_state = state.clone();
        let socket_path = socket.clone();
        tokio::spawn(async move {
            let _ = serve(&socket_path, serve_state).await;
        });
        // Give the listener a moment to bind.
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let request = CtlMessage::new(head::HELLO, vec![]);
        stream
            .write_all(format!("{}\n", request.encode().unwrap()).as_bytes())
            .await
            .unwrap();

        let (read_half, _write_half) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        let response = CtlMessage::decode(&line).unwrap();
        assert_eq!(response.head, status::OK);
        assert_eq!(response.params[0], "abyss");
    }
}
