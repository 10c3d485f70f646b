use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use rand::seq::IteratorRandom;

/// `DISCOVER` never returns fewer endpoints than this, whatever the
/// configured cap, so a joining node always has several manifest candidates.
pub const MIN_DISCOVER_LIMIT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub endpoint: String,
    pub offered: BTreeSet<String>,
}

/// The tracker's registry of peers and the chunks they offer.
///
/// Every operation takes the single lock for its whole duration, so updates
/// for one endpoint are serialized and never lost to a concurrent update of
/// another. Records are never evicted.
#[derive(Debug, Default)]
pub struct Swarm {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

/// Checks the `host:port` shape of an advertised endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| format!("endpoint {endpoint:?} is not host:port"))?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(format!("endpoint {endpoint:?} has an invalid host"));
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(format!("endpoint {endpoint:?} has an invalid port")),
    }
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        // a panicking handler cannot leave a record half-written
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the offered set of `endpoint`. Returns the new set's size.
    pub fn register<I>(&self, endpoint: &str, chunks: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let offered: BTreeSet<String> = chunks.into_iter().collect();
        let count = offered.len();
        self.lock().insert(
            endpoint.to_owned(),
            PeerRecord {
                endpoint: endpoint.to_owned(),
                offered,
            },
        );
        count
    }

    /// Adds one chunk to `endpoint`'s offered set, keeping the rest.
    /// Returns false if it was already offered.
    pub fn announce(&self, endpoint: &str, chunk: &str) -> bool {
        self.lock()
            .entry(endpoint.to_owned())
            .or_insert_with(|| PeerRecord {
                endpoint: endpoint.to_owned(),
                offered: BTreeSet::new(),
            })
            .offered
            .insert(chunk.to_owned())
    }

    /// All known endpoints, or a random sample of `limit` of them when the
    /// swarm is larger. `limit` is raised to [`MIN_DISCOVER_LIMIT`].
    pub fn discover(&self, limit: usize) -> Vec<String> {
        let limit = limit.max(MIN_DISCOVER_LIMIT);
        let peers = self.lock();
        let mut endpoints: Vec<String> = if peers.len() <= limit {
            peers.keys().cloned().collect()
        } else {
            peers
                .keys()
                .cloned()
                .choose_multiple(&mut rand::thread_rng(), limit)
        };
        drop(peers);
        endpoints.sort();
        endpoints
    }

    pub fn find_chunk(&self, chunk: &str) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .lock()
            .values()
            .filter(|record| record.offered.contains(chunk))
            .map(|record| record.endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn peer_chunks(&self, endpoint: &str) -> Option<Vec<String>> {
        self.lock()
            .get(endpoint)
            .map(|record| record.offered.iter().cloned().collect())
    }

    pub fn get(&self, endpoint: &str) -> Option<PeerRecord> {
        self.lock().get(endpoint).cloned()
    }

    /// Registered peers and the total number of chunk offers, read together.
    pub fn counts(&self) -> (u64, u64) {
        let peers = self.lock();
        let offers = peers.values().map(|r| r.offered.len() as u64).sum();
        (peers.len() as u64, offers)
    }
}
