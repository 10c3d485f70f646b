use std::{net::SocketAddr, sync::Arc, time::Duration};

use sha2::{Digest, Sha256};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SwarmError},
    manifest::{ChunkDescriptor, Manifest, MANIFEST_NAME},
    messages::{
        read_body, read_header, read_message, write_data_header, write_message, Message,
        MessageType, MAX_CONTROL_FRAME,
    },
    net::{connect, serve, timed},
    store::{is_safe_name, ChunkStore},
};

const NOT_FOUND: &str = "not found";
const TRANSFER_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct PeerServerConfig {
    pub max_connections: usize,
    pub io_timeout: Duration,
}

impl Default for PeerServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Serves the artifacts of one [`ChunkStore`] to other peers.
pub struct PeerServer {
    listener: TcpListener,
    store: Arc<ChunkStore>,
    config: PeerServerConfig,
}

impl PeerServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        store: Arc<ChunkStore>,
        config: PeerServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            dir = %self.store.root().display(),
            "peer server listening"
        );
        let store = self.store;
        let timeout = self.config.io_timeout;
        serve(self.listener, self.config.max_connections, move |stream, addr| {
            let store = store.clone();
            async move { handle_connection(&store, stream, addr, timeout).await }
        })
        .await?;
        Ok(())
    }
}

async fn handle_connection(store: &ChunkStore, mut stream: TcpStream, addr: SocketAddr, timeout: Duration) {
    let peer = addr.to_string();
    let request = match timed(&peer, timeout, read_message(&mut stream)).await {
        Ok(request) => request,
        Err(e) => {
            warn!(%addr, error = %e, "malformed peer request");
            reply(&mut stream, &peer, timeout, Message::Error(format!("bad request: {e}"))).await;
            return;
        }
    };

    match request {
        Message::Fetch(name) => {
            if let Err(e) = send_artifact(store, &mut stream, &peer, timeout, &name).await {
                debug!(%addr, %name, error = %e, "artifact transfer aborted");
            }
        }
        Message::List => {
            let response = match store.list().await {
                Ok(names) => Message::Peers(names),
                Err(e) => Message::Error(format!("cannot list artifacts: {e}")),
            };
            reply(&mut stream, &peer, timeout, response).await;
        }
        other => {
            let response = Message::Error(format!("unsupported request {:?}", other.kind()));
            reply(&mut stream, &peer, timeout, response).await;
        }
    }
}

async fn reply(stream: &mut TcpStream, peer: &str, timeout: Duration, message: Message) {
    if let Err(e) = timed(peer, timeout, write_message(stream, &message)).await {
        debug!(%peer, error = %e, "failed to send reply");
    }
}

async fn send_artifact(
    store: &ChunkStore,
    stream: &mut TcpStream,
    peer: &str,
    timeout: Duration,
    name: &str,
) -> Result<()> {
    if !is_safe_name(name) {
        reply(stream, peer, timeout, Message::Error("invalid name".into())).await;
        return Ok(());
    }
    let (mut file, len) = match store.open_artifact(name).await {
        Ok(Some(artifact)) => artifact,
        Ok(None) => {
            debug!(%peer, %name, "requested artifact not held");
            reply(stream, peer, timeout, Message::Error(NOT_FOUND.into())).await;
            return Ok(());
        }
        Err(e) => {
            warn!(%name, error = %e, "cannot open artifact");
            reply(stream, peer, timeout, Message::Error("internal error".into())).await;
            return Ok(());
        }
    };

    timed(peer, timeout, write_data_header(stream, len)).await?;
    stream_file(&mut file, len, stream, peer, timeout).await?;
    timed(peer, timeout, async { Ok(stream.flush().await?) }).await?;
    debug!(%peer, %name, bytes = len, "artifact sent");
    Ok(())
}

/// Copies exactly `len` bytes, with the deadline applied to each write.
async fn stream_file(
    file: &mut File,
    len: u64,
    stream: &mut TcpStream,
    peer: &str,
    timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0_u8; TRANSFER_BUFFER];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(SwarmError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        timed(peer, timeout, async { Ok(stream.write_all(&buf[..n]).await?) }).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Requests artifacts from other peers' [`PeerServer`]s.
#[derive(Debug, Clone)]
pub struct PeerClient {
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Sends `FETCH name` and returns the stream positioned at the data.
    async fn open(&self, endpoint: &str, name: &str) -> Result<(TcpStream, u32)> {
        let mut stream = connect(endpoint, self.timeout).await?;
        let request = Message::Fetch(name.to_owned());
        let header = timed(endpoint, self.timeout, async {
            write_message(&mut stream, &request).await?;
            read_header(&mut stream).await
        })
        .await?;

        match header.kind {
            MessageType::Data => Ok((stream, header.len)),
            MessageType::Error => {
                let reason = match timed(endpoint, self.timeout, read_body(&mut stream, header)).await? {
                    Message::Error(reason) => reason,
                    _ => String::new(),
                };
                if reason == NOT_FOUND {
                    Err(SwarmError::NotFound {
                        endpoint: endpoint.to_owned(),
                        name: name.to_owned(),
                    })
                } else {
                    Err(SwarmError::Protocol(format!("{endpoint} refused {name}: {reason}")))
                }
            }
            kind => Err(SwarmError::Protocol(format!(
                "{endpoint} answered {kind:?} to a fetch"
            ))),
        }
    }

    pub async fn fetch_manifest(&self, endpoint: &str) -> Result<Manifest> {
        let (mut stream, len) = self.open(endpoint, MANIFEST_NAME).await?;
        if len > MAX_CONTROL_FRAME {
            return Err(SwarmError::Protocol(format!(
                "manifest of {len} bytes from {endpoint} is too large"
            )));
        }
        let mut text = vec![0_u8; len as usize];
        timed(endpoint, self.timeout, async {
            Ok(stream.read_exact(&mut text).await?)
        })
        .await?;
        let text = String::from_utf8(text)
            .map_err(|_| SwarmError::Manifest(format!("manifest from {endpoint} is not UTF-8")))?;
        Manifest::parse(&text)
    }

    /// Downloads one chunk into `store`, hashing while receiving.
    ///
    /// The chunk only becomes visible in the store if its hash matches the
    /// descriptor; otherwise the partial file is deleted. Returns the number
    /// of bytes received.
    pub async fn fetch_chunk(
        &self,
        endpoint: &str,
        chunk: &ChunkDescriptor,
        store: &ChunkStore,
    ) -> Result<u64> {
        let (mut stream, len) = self.open(endpoint, &chunk.name).await?;
        let len = u64::from(len);
        if let Some(expected) = chunk.size.filter(|size| *size != len) {
            return Err(SwarmError::Integrity {
                name: chunk.name.clone(),
                expected: format!("{expected} bytes"),
                actual: format!("{len} bytes"),
            });
        }

        let mut partial = store.create_partial(&chunk.name).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0_u8; TRANSFER_BUFFER];
        let mut remaining = len;
        let received: Result<()> = async {
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = timed(endpoint, self.timeout, async {
                    Ok(stream.read(&mut buf[..want]).await?)
                })
                .await?;
                if n == 0 {
                    return Err(SwarmError::network(
                        endpoint,
                        std::io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
                hasher.update(&buf[..n]);
                partial.write(&buf[..n]).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
        .await;
        if let Err(e) = received {
            partial.discard().await;
            return Err(e);
        }

        let actual = hex::encode(hasher.finalize());
        if actual != chunk.expected_hash {
            partial.discard().await;
            return Err(SwarmError::Integrity {
                name: chunk.name.clone(),
                expected: chunk.expected_hash.clone(),
                actual,
            });
        }
        partial.commit().await?;
        Ok(len)
    }

    /// Names of the artifacts `endpoint` currently holds.
    pub async fn list(&self, endpoint: &str) -> Result<Vec<String>> {
        let mut stream = connect(endpoint, self.timeout).await?;
        let response = timed(endpoint, self.timeout, async {
            write_message(&mut stream, &Message::List).await?;
            read_message(&mut stream).await
        })
        .await?;
        match response {
            Message::Peers(names) => Ok(names),
            Message::Error(reason) => Err(SwarmError::Protocol(reason)),
            other => Err(SwarmError::Protocol(format!(
                "{endpoint} answered {:?} to a list",
                other.kind()
            ))),
        }
    }
}
