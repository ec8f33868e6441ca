//! Challenge–response login and session tokens.
//!
//! A login is two steps: the server hands out a random challenge for a
//! username, the client returns an Ed25519 signature over the raw challenge
//! bytes. Success mints an opaque token bound to the caller's IP. A failed
//! signature poisons the outstanding challenge for the rest of its window
//! so the same challenge cannot be retried.

use std::net::IpAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use abyss_shared::constants::{
    CHALLENGE_SIZE, CHALLENGE_TTL_SECS, DEBUG_TOKEN, DELEGATED_TTL_SECS, ROOT_UUID,
    SESSION_TTL_SECS, TOKEN_LEN,
};
use abyss_shared::error::AbyssError;
use abyss_shared::identity::verify_signature;
use abyss_store::StoreError;

use crate::cache::ExpiringCache;
use crate::Store;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub uuid: i64,
    pub ip: IpAddr,
}

/// Request payload for user creation (the PATCH body, minus the signature).
#[derive(Debug, Clone)]
pub struct UserCreating {
    pub name: String,
    pub privilege: i64,
    pub public_key: [u8; 32],
}

pub struct SessionService {
    store: Store,
    challenges: ExpiringCache<i64, String>,
    tokens: ExpiringCache<String, SessionEntry>,
    debug_mode: bool,
}

impl SessionService {
    pub fn new(store: Store, debug_mode: bool) -> Self {
        let service = Self {
            store,
            challenges: ExpiringCache::new(),
            tokens: ExpiringCache::new(),
            debug_mode,
        };
        if debug_mode {
            // Loopback-only token for local tooling; never minted in
            // release configurations.
            service.tokens.put(
                DEBUG_TOKEN.to_string(),
                SessionEntry {
                    uuid: ROOT_UUID,
                    ip: IpAddr::from([127, 0, 0, 1]),
                },
                Duration::from_secs(DELEGATED_TTL_SECS),
            );
            warn!("DEBUG_MODE=Debug: loopback debug token enabled");
        }
        service
    }

    /// Issue a challenge for `username`, replacing any outstanding one.
    /// Unknown users get `None` rather than an error so the HTTP layer can
    /// answer 403 without an oracle for valid names.
    pub async fn challenge(&self, username: &str) -> Result<Option<String>, StoreError> {
        let user = {
            let db = self.store.lock().await;
            match db.find_user_by_name(username) {
                Ok(user) => user,
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
        };

        let mut raw = [0u8; CHALLENGE_SIZE];
        OsRng.fill_bytes(&mut raw);
        let challenge = BASE64.encode(raw);

        self.challenges.put(
            user.uuid,
            challenge.clone(),
            Duration::from_secs(CHALLENGE_TTL_SECS),
        );
        debug!(user = %username, "issued login challenge");
        Ok(Some(challenge))
    }

    /// Verify a signature over the outstanding challenge's raw bytes and
    /// mint a session token bound to `ip`. Any failure poisons the
    /// challenge until its original expiry.
    pub async fn verify(&self, username: &str, response: &[u8], ip: IpAddr) -> Option<String> {
        let user = {
            let db = self.store.lock().await;
            db.find_user_by_name(username).ok()?
        };
        let challenge = self.challenges.get(&user.uuid)?;

        let verified = BASE64
            .decode(&challenge)
            .ok()
            .and_then(|bytes| verify_signature(&user.public_key, &bytes, response).ok())
            .is_some();

        if !verified {
            // Overwrite in place: the slot stays occupied (and useless)
            // for the remaining window, so the challenge cannot be ground
            // through repeated guesses.
            self.challenges.mutate(&user.uuid, |value| {
                *value = format!("failed : {}", random_ascii(CHALLENGE_SIZE));
            });
            warn!(user = %username, ip = %ip, "login signature rejected");
            return None;
        }

        self.challenges.remove(&user.uuid);
        let token = self.create_token(user.uuid, ip, Duration::from_secs(SESSION_TTL_SECS));
        info!(user = %username, uuid = user.uuid, ip = %ip, "login succeeded");
        Some(token)
    }

    /// Resolve a token presented from `ip` to a uuid, or -1.
    ///
    /// A mismatched IP on a non-loopback request burns the token: whoever
    /// holds it next gets nothing, including the original owner.
    pub fn validate(&self, token: &str, ip: IpAddr) -> i64 {
        let Some(entry) = self.tokens.get(&token.to_string()) else {
            return -1;
        };
        if entry.ip == ip {
            return entry.uuid;
        }
        if ip.is_loopback() && self.debug_mode && is_debug_token(token) {
            return entry.uuid;
        }
        if !ip.is_loopback() {
            self.tokens.remove(&token.to_string());
            warn!(uuid = entry.uuid, bound = %entry.ip, seen = %ip, "token IP mismatch, destroyed");
        }
        -1
    }

    pub fn destroy(&self, token: &str) {
        self.tokens.remove(&token.to_string());
    }

    /// Mint a fresh random token. Also the delegation primitive: root uses
    /// it to hand out short-lived tokens bound to another address.
    pub fn create_token(&self, uuid: i64, ip: IpAddr, ttl: Duration) -> String {
        let token = random_ascii(TOKEN_LEN);
        self.tokens.put(token.clone(), SessionEntry { uuid, ip }, ttl);
        token
    }

    /// Create a user on behalf of the holder of `creator_token`. The
    /// creator's token is destroyed on success to force a re-login.
    pub async fn create_user(
        &self,
        creator_token: &str,
        ip: IpAddr,
        req: UserCreating,
    ) -> Result<(), AbyssError> {
        let creator_uuid = self.validate(creator_token, ip);
        if creator_uuid < 0 {
            return Err(AbyssError::TokenMissing);
        }

        if req.name.is_empty() || !req.name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(AbyssError::UsernameInvalid);
        }

        {
            let db = self.store.lock().await;
            let creator = db
                .find_user_by_uuid(creator_uuid)
                .map_err(|_| AbyssError::UserNotFound)?;

            if req.privilege > creator.privilege {
                return Err(AbyssError::PrivilegeExceeded);
            }
            match db.find_user_by_name(&req.name) {
                Ok(_) => return Err(AbyssError::DuplicateUser),
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(store_internal(e)),
            }

            db.insert_user(&req.name, creator.uuid, &req.public_key, req.privilege)
                .map_err(|e| match e {
                    StoreError::DuplicateUser => AbyssError::DuplicateUser,
                    other => store_internal(other),
                })?;
        }

        self.destroy(creator_token);
        info!(name = %req.name, parent = creator_uuid, privilege = req.privilege, "user created");
        Ok(())
    }

    /// True if `signature` over `data` verifies under any registered public
    /// key. Used by the tunnel handshake, which identifies no user.
    pub async fn verify_any(&self, data: &[u8], signature: &[u8]) -> bool {
        let keys = {
            let db = self.store.lock().await;
            match db.all_public_keys() {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "could not load public keys for handshake");
                    return false;
                }
            }
        };
        keys.iter()
            .any(|key| verify_signature(key, data, signature).is_ok())
    }

    /// Purge expired challenges and tokens; called from the sweep task.
    pub fn purge_expired(&self) -> usize {
        self.challenges.purge_expired() + self.tokens.purge_expired()
    }
}

fn is_debug_token(token: &str) -> bool {
    let token = token.as_bytes();
    let expected = DEBUG_TOKEN.as_bytes();
    token.len() == expected.len() && token.ct_eq(expected).unwrap_u8() == 1
}

fn random_ascii(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn store_internal(e: StoreError) -> AbyssError {
    AbyssError::Malformed(format!("storage: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use abyss_shared::identity::Identity;
    use abyss_store::Database;

    const LOCAL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));
    const OTHER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2));

    fn service_with_user(name: &str) -> (SessionService, Identity) {
        let db = Database::open_in_memory().unwrap();
        let id = Identity::generate();
        db.insert_user(name, 1, &id.public_key_bytes(), 10).unwrap();
        let store: Store = Arc::new(tokio::sync::Mutex::new(db));
        (SessionService::new(store, false), id)
    }

    #[tokio::test]
    async fn challenges_are_unique_per_issue() {
        let (svc, _id) = service_with_user("alice");
        let c1 = svc.challenge("alice").await.unwrap().unwrap();
        let c2 = svc.challenge("alice").await.unwrap().unwrap();
        assert_ne!(c1, c2);
        assert_eq!(c1.len(), 44);
    }

    #[tokio::test]
    async fn unknown_user_gets_none() {
        let (svc, _id) = service_with_user("alice");
        assert!(svc.challenge("mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_mints_ip_bound_token() {
        let (svc, id) = service_with_user("alice");
        let challenge = svc.challenge("alice").await.unwrap().unwrap();
        let sig = id.sign(&BASE64.decode(&challenge).unwrap());

        let token = svc.verify("alice", &sig.to_bytes(), LOCAL).await.unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(svc.validate(&token, LOCAL) > 0);
    }

    #[tokio::test]
    async fn bad_signature_poisons_challenge() {
        let (svc, id) = service_with_user("alice");
        let challenge = svc.challenge("alice").await.unwrap().unwrap();
        let challenge_bytes = BASE64.decode(&challenge).unwrap();

        // Flip a bit in an otherwise valid signature.
        let mut sig = id.sign(&challenge_bytes).to_bytes();
        sig[0] ^= 0x01;
        assert!(svc.verify("alice", &sig, LOCAL).await.is_none());

        // The genuine signature over the original challenge no longer works:
        // the stored entry was rewritten.
        let good = id.sign(&challenge_bytes).to_bytes();
        assert!(svc.verify("alice", &good, LOCAL).await.is_none());
    }

    #[tokio::test]
    async fn ip_mismatch_destroys_token() {
        let (svc, id) = service_with_user("alice");
        let challenge = svc.challenge("alice").await.unwrap().unwrap();
        let sig = id.sign(&BASE64.decode(&challenge).unwrap());
        let token = svc.verify("alice", &sig.to_bytes(), LOCAL).await.unwrap();

        assert_eq!(svc.validate(&token, OTHER), -1);
        // Burned for the legitimate address too.
        assert_eq!(svc.validate(&token, LOCAL), -1);
    }

    #[tokio::test]
    async fn create_user_enforces_preconditions() {
        let (svc, _id) = service_with_user("alice");
        let token = svc.create_token(
            /* alice */ 1,
            LOCAL,
            Duration::from_secs(60),
        );
        let key = Identity::generate().public_key_bytes();

        // Privilege above the creator's is refused.
        let err = svc
            .create_user(
                &token,
                LOCAL,
                UserCreating {
                    name: "bob".into(),
                    privilege: 99,
                    public_key: key,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::PrivilegeExceeded));

        // Bad username is refused.
        let err = svc
            .create_user(
                &token,
                LOCAL,
                UserCreating {
                    name: "bob!".into(),
                    privilege: 5,
                    public_key: key,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AbyssError::UsernameInvalid));

        // Success destroys the creator token.
        svc.create_user(
            &token,
            LOCAL,
            UserCreating {
                name: "bob".into(),
                privilege: 5,
                public_key: key,
            },
        )
        .await
        .unwrap();
        assert_eq!(svc.validate(&token, LOCAL), -1);
    }

    #[tokio::test]
    async fn verify_any_matches_registered_keys() {
        let (svc, id) = service_with_user("alice");
        let sig = id.sign(b"handshake challenge");
        assert!(svc.verify_any(b"handshake challenge", &sig.to_bytes()).await);

        let stranger = Identity::generate();
        let sig = stranger.sign(b"handshake challenge");
        assert!(!svc.verify_any(b"handshake challenge", &sig.to_bytes()).await);
    }

    #[tokio::test]
    async fn debug_token_only_from_loopback() {
        let db = Database::open_in_memory().unwrap();
        db.insert_user("root", 1, &[1u8; 32], 1024).unwrap();
        let store: Store = Arc::new(tokio::sync::Mutex::new(db));
        let svc = SessionService::new(store, true);

        let loopback = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        assert_eq!(svc.validate(DEBUG_TOKEN, loopback), ROOT_UUID);
        assert_eq!(svc.validate(DEBUG_TOKEN, OTHER), -1);
    }
}
