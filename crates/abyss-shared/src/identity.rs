use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::AbyssError;

// Ed25519 identity. Private keys travel as base64(seed || pubkey), 64 bytes
// raw, matching the admin tooling's key format; 32-byte bare seeds are also
// accepted on import.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Import from base64: either a 32-byte seed or 64-byte seed||pub.
    pub fn from_private_base64(encoded: &str) -> Result<Self, AbyssError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| AbyssError::Malformed(format!("private key base64: {e}")))?;
        let mut seed = [0u8; 32];
        match raw.len() {
            32 => seed.copy_from_slice(&raw),
            64 => seed.copy_from_slice(&raw[..32]),
            n => {
                return Err(AbyssError::Malformed(format!(
                    "private key must be 32 or 64 bytes, got {n}"
                )))
            }
        }
        Ok(Self::from_seed(&seed))
    }

    /// Export as base64(seed || pubkey), 64 raw bytes.
    pub fn private_key_base64(&self) -> String {
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(self.signing_key.as_bytes());
        raw[32..].copy_from_slice(&self.signing_key.verifying_key().to_bytes());
        BASE64.encode(raw)
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Verify a detached signature against a raw 32-byte public key.
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), AbyssError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| AbyssError::SignatureInvalid)?;
    let signature =
        Signature::from_slice(signature_bytes).map_err(|_| AbyssError::SignatureInvalid)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| AbyssError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let id = Identity::generate();
        let sig = id.sign(b"challenge bytes");

        assert!(verify_signature(&id.public_key_bytes(), b"challenge bytes", &sig.to_bytes()).is_ok());
        assert!(verify_signature(&id.public_key_bytes(), b"other bytes", &sig.to_bytes()).is_err());
    }

    #[test]
    fn private_base64_roundtrip() {
        let id = Identity::generate();
        let exported = id.private_key_base64();
        let restored = Identity::from_private_base64(&exported).unwrap();
        assert_eq!(id.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn bare_seed_import() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let id = Identity::generate();
        let full = BASE64.decode(id.private_key_base64()).unwrap();
        let seed_only = BASE64.encode(&full[..32]);

        let restored = Identity::from_private_base64(&seed_only).unwrap();
        assert_eq!(id.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn bad_length_rejected() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let encoded = BASE64.encode([0u8; 48]);
        assert!(Identity::from_private_base64(&encoded).is_err());
    }

    #[test]
    fn tampered_signature_rejected() {
        let id = Identity::generate();
        let mut sig = id.sign(b"data").to_bytes();
        sig[0] ^= 0x01;
        assert!(verify_signature(&id.public_key_bytes(), b"data", &sig).is_err());
    }
}
