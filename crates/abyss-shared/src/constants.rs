/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// X25519 public key size in bytes
pub const ECDH_PUBKEY_SIZE: usize = 32;

/// Raw challenge size in bytes (issued to clients as base64, 44 chars)
pub const CHALLENGE_SIZE: usize = 32;

/// Handshake challenge size on the tunnel (raw ASCII, not base64-wrapped)
pub const TUNNEL_CHALLENGE_SIZE: usize = 32;

/// Handshake ACK nonce size in bytes (opaque, reserved)
pub const ACK_NONCE_SIZE: usize = 16;

/// Session token length in ASCII characters
pub const TOKEN_LEN: usize = 64;

/// Challenge lifetime in seconds
pub const CHALLENGE_TTL_SECS: u64 = 60;

/// Session token lifetime in seconds (24 h)
pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Delegated / debug token lifetime in seconds (1 h)
pub const DELEGATED_TTL_SECS: u64 = 60 * 60;

/// Well-known loopback token available under DEBUG_MODE=Debug
pub const DEBUG_TOKEN: &str = "abyss";

/// ChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Per-direction nonce salt size in bytes
pub const NONCE_SALT_SIZE: usize = 4;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Frame length header size in bytes (big-endian u32)
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum plaintext chunk per frame (64 KiB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum on-wire frame payload: ciphertext + tag
pub const MAX_FRAME_PAYLOAD: usize = MAX_CHUNK_SIZE + TAG_SIZE;

/// HKDF-SHA256 labels for the tunnel key schedule
pub const HKDF_LABEL_KEY: &[u8] = b"Abyss-AEAD-Key";
pub const HKDF_LABEL_SALT_A: &[u8] = b"Abyss-Nonce-Salt-A";
pub const HKDF_LABEL_SALT_B: &[u8] = b"Abyss-Nonce-Salt-B";

/// Seed for the resource uid hash (XXH3-128 over the relative path)
pub const UID_HASH_SEED: u64 = 0x1145_1419;

/// Fixed TCP port for the encrypted tunnel listener
pub const PROXY_PORT: u16 = 4096;

/// Default CONNECT allow-list when ALLOWED_PORTS is unset
pub const DEFAULT_ALLOWED_PORT: u16 = 443;

/// Reserved subtrees under the media root, created at bootstrap
pub const RESERVED_DIRS: [&str; 4] = ["Tasks", "Live", "Videos", "Images"];

/// The root user's uuid; exists before any other user
pub const ROOT_UUID: i64 = 1;

/// Privilege assigned to root at bootstrap
pub const ROOT_PRIVILEGE: i64 = 1024;
