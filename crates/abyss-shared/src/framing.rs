use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::constants::{
    FRAME_HEADER_SIZE, MAX_CHUNK_SIZE, MAX_FRAME_PAYLOAD, NONCE_SALT_SIZE, NONCE_SIZE, TAG_SIZE,
};
use crate::error::AbyssError;

/// One direction of an established tunnel: ChaCha20-Poly1305 state plus a
/// monotonically increasing 64-bit frame counter. A nonce is
/// `salt || BE64(counter)` and is never reused under the same key; running
/// the counter out is fatal for the stream.
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    salt: [u8; NONCE_SALT_SIZE],
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: &[u8; 32], salt: [u8; NONCE_SALT_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            salt,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], AbyssError> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_SALT_SIZE].copy_from_slice(&self.salt);
        nonce[NONCE_SALT_SIZE..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(AbyssError::CounterExhausted)?;
        Ok(nonce)
    }

    /// Encrypt one plaintext chunk into a complete on-wire frame:
    /// `[BE32(ciphertext_len + 16)][ciphertext][tag]`.
    pub fn seal(&mut self, chunk: &[u8]) -> Result<Vec<u8>, AbyssError> {
        if chunk.len() > MAX_CHUNK_SIZE {
            return Err(AbyssError::Malformed(format!(
                "chunk of {} bytes exceeds frame limit",
                chunk.len()
            )));
        }
        let nonce = self.next_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| AbyssError::CryptoFailure)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt one frame payload (ciphertext || tag, header already
    /// stripped). Tag failure poisons the stream; the caller must close.
    pub fn open(&mut self, payload: &[u8]) -> Result<Vec<u8>, AbyssError> {
        if payload.len() < TAG_SIZE || payload.len() > MAX_FRAME_PAYLOAD {
            return Err(AbyssError::Malformed(format!(
                "frame payload of {} bytes out of range",
                payload.len()
            )));
        }
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| AbyssError::CryptoFailure)
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }
}

/// Parse and bounds-check a frame length header.
pub fn frame_len(header: [u8; FRAME_HEADER_SIZE]) -> Result<usize, AbyssError> {
    let len = u32::from_be_bytes(header) as usize;
    if !(TAG_SIZE..=MAX_FRAME_PAYLOAD).contains(&len) {
        return Err(AbyssError::Malformed(format!(
            "frame length {len} out of range"
        )));
    }
    Ok(len)
}
