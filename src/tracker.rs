use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SwarmError},
    messages::{read_message, write_message, Announcement, Message, Registration, TrackerStats},
    net::{connect, serve, timed},
    swarm::{validate_endpoint, Swarm},
};

#[derive(Debug, Clone)]
pub struct TrackerServerConfig {
    pub max_connections: usize,
    /// cap on endpoints returned by one DISCOVER
    pub discover_limit: usize,
    pub io_timeout: Duration,
}

impl Default for TrackerServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            discover_limit: 200,
            io_timeout: Duration::from_secs(10),
        }
    }
}

struct TrackerState {
    swarm: Arc<Swarm>,
    config: TrackerServerConfig,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
}

struct ActiveConnection<'a>(&'a AtomicU64);

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct TrackerServer {
    listener: TcpListener,
    state: Arc<TrackerState>,
}

impl TrackerServer {
    pub async fn bind(addr: impl ToSocketAddrs, config: TrackerServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(TrackerState {
                swarm: Arc::new(Swarm::new()),
                config,
                active_connections: AtomicU64::new(0),
                total_connections: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn swarm(&self) -> Arc<Swarm> {
        self.state.swarm.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "tracker listening");
        let state = self.state;
        let max_connections = state.config.max_connections;
        serve(self.listener, max_connections, move |stream, addr| {
            let state = state.clone();
            async move { state.handle_connection(stream, addr).await }
        })
        .await?;
        Ok(())
    }
}

impl TrackerState {
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveConnection(&self.active_connections);

        let peer = addr.to_string();
        let timeout = self.config.io_timeout;
        let response = match timed(&peer, timeout, read_message(&mut stream)).await {
            Ok(request) => {
                debug!(%addr, kind = ?request.kind(), "tracker request");
                self.handle(request)
            }
            Err(e) => {
                warn!(%addr, error = %e, "malformed tracker request");
                Message::Error(format!("bad request: {e}"))
            }
        };
        if let Err(e) = timed(&peer, timeout, write_message(&mut stream, &response)).await {
            debug!(%addr, error = %e, "failed to send tracker response");
        }
    }

    fn handle(&self, request: Message) -> Message {
        let swarm = &self.swarm;
        match request {
            Message::Discover => Message::Peers(swarm.discover(self.config.discover_limit)),
            Message::Register(Registration { endpoint, chunks }) => {
                if let Err(reason) = validate_endpoint(&endpoint) {
                    return Message::Error(reason);
                }
                if chunks.iter().any(|c| c.is_empty()) {
                    return Message::Error("empty chunk name".into());
                }
                let count = swarm.register(&endpoint, chunks);
                info!(%endpoint, chunks = count, "peer registered");
                Message::Ack(format!("registered {count} chunks"))
            }
            Message::Announce(Announcement { endpoint, chunk }) => {
                if let Err(reason) = validate_endpoint(&endpoint) {
                    return Message::Error(reason);
                }
                if chunk.is_empty() {
                    return Message::Error("empty chunk name".into());
                }
                swarm.announce(&endpoint, &chunk);
                debug!(%endpoint, %chunk, "chunk announced");
                Message::Ack(format!("announced {chunk}"))
            }
            Message::FindChunk(chunk) if chunk.is_empty() => {
                Message::Error("empty chunk name".into())
            }
            Message::FindChunk(chunk) => Message::Peers(swarm.find_chunk(&chunk)),
            Message::PeerChunks(endpoint) => match swarm.peer_chunks(&endpoint) {
                Some(chunks) => Message::Peers(chunks),
                None => Message::Error(format!("peer {endpoint} not found")),
            },
            Message::Stats => Message::StatsReport(self.stats()),
            other => Message::Error(format!("unsupported request {:?}", other.kind())),
        }
    }

    fn stats(&self) -> TrackerStats {
        let (registered_peers, total_chunks) = self.swarm.counts();
        TrackerStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            registered_peers,
            total_chunks,
        }
    }
}

/// Client side of the tracker protocol. Every call is one connection.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    addr: String,
    timeout: Duration,
}

impl TrackerClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn unavailable(&self, e: SwarmError) -> SwarmError {
        SwarmError::TrackerUnavailable {
            addr: self.addr.clone(),
            reason: e.to_string(),
        }
    }

    async fn request(&self, message: Message) -> Result<Message> {
        let mut stream = connect(&self.addr, self.timeout)
            .await
            .map_err(|e| self.unavailable(e))?;
        let response = timed(&self.addr, self.timeout, async {
            write_message(&mut stream, &message).await?;
            read_message(&mut stream).await
        })
        .await
        .map_err(|e| match e {
            SwarmError::Protocol(_) => e,
            e => self.unavailable(e),
        })?;
        match response {
            Message::Error(reason) => Err(SwarmError::Protocol(format!(
                "tracker rejected {:?}: {reason}",
                message.kind()
            ))),
            response => Ok(response),
        }
    }

    async fn peers(&self, message: Message) -> Result<Vec<String>> {
        match self.request(message).await? {
            Message::Peers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn ack(&self, message: Message) -> Result<String> {
        match self.request(message).await? {
            Message::Ack(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    pub async fn discover(&self) -> Result<Vec<String>> {
        self.peers(Message::Discover).await
    }

    pub async fn register(&self, endpoint: &str, chunks: Vec<String>) -> Result<String> {
        self.ack(Message::Register(Registration {
            endpoint: endpoint.to_owned(),
            chunks,
        }))
        .await
    }

    pub async fn announce(&self, endpoint: &str, chunk: &str) -> Result<String> {
        self.ack(Message::Announce(Announcement {
            endpoint: endpoint.to_owned(),
            chunk: chunk.to_owned(),
        }))
        .await
    }

    pub async fn find_chunk(&self, chunk: &str) -> Result<Vec<String>> {
        self.peers(Message::FindChunk(chunk.to_owned())).await
    }

    pub async fn peer_chunks(&self, endpoint: &str) -> Result<Vec<String>> {
        self.peers(Message::PeerChunks(endpoint.to_owned())).await
    }

    pub async fn stats(&self) -> Result<TrackerStats> {
        match self.request(Message::Stats).await? {
            Message::StatsReport(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(message: Message) -> SwarmError {
    SwarmError::Protocol(format!("unexpected response {:?}", message.kind()))
}
