use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tracing::{debug, warn};

use crate::error::{Result, SwarmError};

/// Accepts connections forever, running `handler` on its own task for each.
///
/// At most `max_connections` handlers run at once. The permit is taken before
/// `accept`, so clients beyond the limit wait in the listen backlog instead of
/// spawning more tasks.
pub async fn serve<H, Fut>(listener: TcpListener, max_connections: usize, handler: H) -> io::Result<()>
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let limit = Arc::new(Semaphore::new(max_connections.max(1)));
    let handler = Arc::new(handler);
    loop {
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection limiter closed"))?;
        let (stream, addr) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                // e.g. EMFILE; keep serving the connections we have
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        debug!(%addr, "connection accepted");
        let handler = handler.clone();
        tokio::spawn(async move {
            handler(stream, addr).await;
            drop(permit);
        });
    }
}

/// Runs `fut` under a deadline, classifying failures against `endpoint`.
pub async fn timed<T, F>(endpoint: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Err(SwarmError::Io(e))) => Err(SwarmError::network(endpoint, e)),
        Ok(result) => result,
        Err(_) => Err(SwarmError::Timeout(endpoint.to_owned())),
    }
}

pub async fn connect(endpoint: &str, limit: Duration) -> Result<TcpStream> {
    timed(endpoint, limit, async {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    })
    .await
}
