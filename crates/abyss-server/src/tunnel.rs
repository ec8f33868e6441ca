//! Encrypted framed transport and HTTP-CONNECT forwarding proxy.
//!
//! Each accepted connection runs the X25519 + signature handshake, then
//! speaks length-prefixed ChaCha20-Poly1305 frames. The first request on
//! the encrypted channel must be `CONNECT host:port`; only the port is
//! honored and it must be on the allow-list. Everything else is refused.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use abyss_shared::constants::{
    ACK_NONCE_SIZE, ECDH_PUBKEY_SIZE, MAX_CHUNK_SIZE, SIGNATURE_SIZE, TUNNEL_CHALLENGE_SIZE,
};
use abyss_shared::error::AbyssError;
use abyss_shared::framing::{frame_len, FrameCipher};
use abyss_shared::handshake::{derive_session_keys, SessionKeys};
use abyss_shared::identity::Identity;

use crate::session::SessionService;

/// Upper bound on the buffered HTTP request head.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Secure stream halves
// ---------------------------------------------------------------------------

pub struct SecureReader<R> {
    inner: R,
    cipher: FrameCipher,
}

pub struct SecureWriter<W> {
    inner: W,
    cipher: FrameCipher,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Read and open one frame. `Ok(None)` on clean EOF at a frame
    /// boundary; any tamper or mid-frame EOF is an error and the stream
    /// must be dropped.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, AbyssError> {
        let mut header = [0u8; 4];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = frame_len(header)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Some(self.cipher.open(&payload)?))
    }
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    /// Seal and send, splitting into frame-sized chunks as needed.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), AbyssError> {
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            let frame = self.cipher.seal(chunk)?;
            self.inner.write_all(&frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// Split an established stream into per-direction secure halves, each with
/// its own cipher state and nonce counter.
pub fn secure_split<S>(
    stream: S,
    keys: &SessionKeys,
) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        SecureReader {
            inner: read_half,
            cipher: FrameCipher::new(&keys.key, keys.recv_salt),
        },
        SecureWriter {
            inner: write_half,
            cipher: FrameCipher::new(&keys.key, keys.send_salt),
        },
    )
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Server side of the tunnel handshake. On failure the connection is
/// abandoned without a diagnostic byte.
pub async fn server_handshake<S>(
    stream: &mut S,
    session: &SessionService,
) -> Result<SessionKeys, AbyssError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let local_public = PublicKey::from(&secret);

    stream.write_all(local_public.as_bytes()).await?;
    let mut peer_public = [0u8; ECDH_PUBKEY_SIZE];
    stream.read_exact(&mut peer_public).await?;

    // Bind the session to a registered identity: any stored key may sign.
    let challenge = random_ascii_bytes(TUNNEL_CHALLENGE_SIZE);
    stream.write_all(&challenge).await?;
    let mut signature = [0u8; SIGNATURE_SIZE];
    stream.read_exact(&mut signature).await?;
    if !session.verify_any(&challenge, &signature).await {
        return Err(AbyssError::AuthFailure);
    }

    let mut ack = [0u8; ACK_NONCE_SIZE];
    OsRng.fill_bytes(&mut ack);
    stream.write_all(&ack).await?;

    let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
    derive_session_keys(shared.as_bytes(), local_public.as_bytes(), &peer_public)
}

/// Client side of the handshake, signing the server's challenge with a
/// registered identity.
#[allow(dead_code)]
pub async fn client_handshake<S>(
    stream: &mut S,
    identity: &Identity,
) -> Result<SessionKeys, AbyssError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let local_public = PublicKey::from(&secret);

    stream.write_all(local_public.as_bytes()).await?;
    let mut peer_public = [0u8; ECDH_PUBKEY_SIZE];
    stream.read_exact(&mut peer_public).await?;

    let mut challenge = [0u8; TUNNEL_CHALLENGE_SIZE];
    stream.read_exact(&mut challenge).await?;
    let signature = identity.sign(&challenge);
    stream.write_all(&signature.to_bytes()).await?;

    let mut ack = [0u8; ACK_NONCE_SIZE];
    stream.read_exact(&mut ack).await?;

    let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
    derive_session_keys(shared.as_bytes(), local_public.as_bytes(), &peer_public)
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub async fn serve(
    listener: TcpListener,
    session: Arc<SessionService>,
    allowed_ports: Arc<Vec<u16>>,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Tunnel listener running");
    loop {
        let (stream, peer) = listener.accept().await?;
        let session = session.clone();
        let allowed_ports = allowed_ports.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "tunnel connection accepted");
            if let Err(e) = handle_connection(stream, &session, &allowed_ports).await {
                debug!(peer = %peer, error = %e, "tunnel connection closed");
            }
        });
    }
}

/// Drive one tunnel connection from handshake to EOF.
pub async fn handle_connection<S>(
    mut stream: S,
    session: &SessionService,
    allowed_ports: &[u16],
) -> Result<(), AbyssError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let keys = server_handshake(&mut stream, session).await?;
    let (mut reader, mut writer) = secure_split(stream, &keys);

    // Buffer decrypted bytes until the request head is complete.
    let mut head = Vec::new();
    let body_start = loop {
        if let Some(pos) = find_head_end(&head) {
            break pos + 4;
        }
        if head.len() > MAX_REQUEST_HEAD {
            return Err(AbyssError::Malformed("request head too large".into()));
        }
        match reader.recv().await? {
            Some(data) => head.extend_from_slice(&data),
            None => return Ok(()),
        }
    };
    let leftover = head.split_off(body_start);

    let request_line = std::str::from_utf8(&head)
        .ok()
        .and_then(|text| text.lines().next())
        .unwrap_or("")
        .to_string();
    let mut parts = request_line.split_whitespace();
    let (method, target) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));

    if method != "CONNECT" {
        warn!(method, "non-CONNECT request on tunnel");
        writer
            .send(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Ok(());
    }

    // Only the :port suffix of the target is honored.
    let port = match target.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
        Some(port) if allowed_ports.contains(&port) => port,
        _ => {
            warn!(target, "CONNECT refused by allow-list");
            writer.send(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
            return Ok(());
        }
    };

    let upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(port, error = %e, "upstream dial failed");
            writer.send(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };
    writer
        .send(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    debug!(port, "tunnel established");

    let (mut up_read, mut up_write) = upstream.into_split();
    if !leftover.is_empty() {
        up_write.write_all(&leftover).await?;
    }

    // One task per direction; the first EOF aborts the other so both
    // sides close together.
    let mut client_to_upstream = tokio::spawn(async move {
        while let Ok(Some(data)) = reader.recv().await {
            if up_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = up_write.shutdown().await;
    });
    let mut upstream_to_client = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            match up_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut client_to_upstream => upstream_to_client.abort(),
        _ = &mut upstream_to_client => client_to_upstream.abort(),
    }
    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn random_ascii_bytes(len: usize) -> Vec<u8> {
    OsRng.sample_iter(&Alphanumeric).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use abyss_store::Database;
    use tokio::io::duplex;

    use crate::Store;

    fn service_with_identity() -> (Arc<SessionService>, Identity) {
        let db = Database::open_in_memory().unwrap();
        let id = Identity::generate();
        db.insert_user("root", 1, &id.public_key_bytes(), 1024)
            .unwrap();
        let store: Store = Arc::new(tokio::sync::Mutex::new(db));
        (Arc::new(SessionService::new(store, false)), id)
    }

    async fn request_over_tunnel(
        request: &[u8],
        identity: &Identity,
        session: Arc<SessionService>,
        allowed_ports: Vec<u16>,
    ) -> Vec<u8> {
        let (client, server) = duplex(256 * 1024);
        let server_task = tokio::spawn(async move {
            let _ = handle_connection(server, &session, &allowed_ports).await;
        });

        let mut client = client;
        let keys = client_handshake(&mut client, identity).await.unwrap();
        let (mut reader, mut writer) = secure_split(client, &keys);
        writer.send(request).await.unwrap();

        let mut response = Vec::new();
        while let Ok(Some(data)) = reader.recv().await {
            response.extend_from_slice(&data);
            if find_head_end(&response).is_some() {
                break;
            }
        }
        let _ = server_task.await;
        response
    }

    #[tokio::test]
    async fn handshake_rejects_unregistered_identity() {
        let (session, _registered) = service_with_identity();
        let stranger = Identity::generate();

        let (client, server) = duplex(64 * 1024);
        let server_task =
            tokio::spawn(async move { handle_connection(server, &session, &[443]).await });

        let mut client = client;
        // The client-side handshake either errors outright or the server
        // closes before any frame arrives.
        match client_handshake(&mut client, &stranger).await {
            Err(_) => {}
            Ok(keys) => {
                let (mut reader, _writer) = secure_split(client, &keys);
                assert!(matches!(reader.recv().await, Ok(None) | Err(_)));
            }
        }
        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(AbyssError::AuthFailure)));
    }

    #[tokio::test]
    async fn non_connect_gets_405() {
        let (session, id) = service_with_identity();
        let response = request_over_tunnel(
            b"GET / HTTP/1.1\r\nHost: example\r\n\r\n",
            &id,
            session,
            vec![443],
        )
        .await;
        assert!(response.starts_with(b"HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn disallowed_port_gets_403() {
        let (session, id) = service_with_identity();
        let response = request_over_tunnel(
            b"CONNECT 127.0.0.1:9999 HTTP/1.1\r\n\r\n",
            &id,
            session,
            vec![443],
        )
        .await;
        assert!(response.starts_with(b"HTTP/1.1 403"));
    }

    #[tokio::test]
    async fn connect_tunnels_bytes_both_ways() {
        let (session, id) = service_with_identity();

        // Local echo upstream on an ephemeral port.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (client, server) = duplex(256 * 1024);
        let allowed = vec![port];
        tokio::spawn(async move {
            let _ = handle_connection(server, &session, &allowed).await;
        });

        let mut client = client;
        let keys = client_handshake(&mut client, &id).await.unwrap();
        let (mut reader, mut writer) = secure_split(client, &keys);

        writer
            .send(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let established = reader.recv().await.unwrap().unwrap();
        assert!(established.starts_with(b"HTTP/1.1 200"));

        let payload = b"echo through the abyss";
        writer.send(payload).await.unwrap();
        let echoed = reader.recv().await.unwrap().unwrap();
        assert_eq!(echoed, payload);
    }
}
