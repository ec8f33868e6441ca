use hkdf::Hkdf;
use sha2::Sha256;

use crate::constants::{HKDF_LABEL_KEY, HKDF_LABEL_SALT_A, HKDF_LABEL_SALT_B, NONCE_SALT_SIZE};
use crate::error::AbyssError;

/// Key material for one established tunnel session.
#[derive(Clone)]
pub struct SessionKeys {
    pub key: [u8; 32],
    pub send_salt: [u8; NONCE_SALT_SIZE],
    pub recv_salt: [u8; NONCE_SALT_SIZE],
}

/// Derive the AEAD key and the two per-direction nonce salts from the
/// X25519 shared secret.
///
/// Salt assignment is pinned to the lexicographic order of the raw public
/// keys: the smaller side sends with salt A and receives with salt B, the
/// larger side the reverse. Socket role and timing play no part, so both
/// peers agree without negotiation.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    local_public: &[u8; 32],
    remote_public: &[u8; 32],
) -> Result<SessionKeys, AbyssError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);

    let mut key = [0u8; 32];
    let mut salt_a = [0u8; NONCE_SALT_SIZE];
    let mut salt_b = [0u8; NONCE_SALT_SIZE];
    hk.expand(HKDF_LABEL_KEY, &mut key)
        .map_err(|_| AbyssError::AuthFailure)?;
    hk.expand(HKDF_LABEL_SALT_A, &mut salt_a)
        .map_err(|_| AbyssError::AuthFailure)?;
    hk.expand(HKDF_LABEL_SALT_B, &mut salt_b)
        .map_err(|_| AbyssError::AuthFailure)?;

    let (send_salt, recv_salt) = if local_public < remote_public {
        (salt_a, salt_b)
    } else {
        (salt_b, salt_a)
    };

    Ok(SessionKeys {
        key,
        send_salt,
        recv_salt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_derive_mirrored_salts() {
        let secret = [0x42u8; 32];
        let pub_a = [1u8; 32];
        let pub_b = [2u8; 32];

        let a = derive_session_keys(&secret, &pub_a, &pub_b).unwrap();
        let b = derive_session_keys(&secret, &pub_b, &pub_a).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(a.send_salt, b.recv_salt);
        assert_eq!(a.recv_salt, b.send_salt);
        assert_ne!(a.send_salt, a.recv_salt);
    }

    #[test]
    fn different_secrets_different_keys() {
        let pub_a = [1u8; 32];
        let pub_b = [2u8; 32];
        let k1 = derive_session_keys(&[1u8; 32], &pub_a, &pub_b).unwrap();
        let k2 = derive_session_keys(&[2u8; 32], &pub_a, &pub_b).unwrap();
        assert_ne!(k1.key, k2.key);
    }

    #[test]
    fn assignment_ignores_argument_order_semantics() {
        // The same side always gets the same salts regardless of which peer
        // initiated the connection.
        let secret = [7u8; 32];
        let small = [0u8; 32];
        let large = [0xFFu8; 32];

        let as_initiator = derive_session_keys(&secret, &small, &large).unwrap();
        let as_responder = derive_session_keys(&secret, &small, &large).unwrap();
        assert_eq!(as_initiator.send_salt, as_responder.send_salt);
        assert_eq!(as_initiator.recv_salt, as_responder.recv_salt);
    }
}
