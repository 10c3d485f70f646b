use std::{
    collections::{BTreeSet, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{stream, StreamExt};
use rand::{seq::SliceRandom, Rng};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};

use crate::{
    breaker::{BreakerConfig, CircuitBreaker},
    digest::sha256_hex,
    error::{Result, SwarmError},
    manifest::{ChunkDescriptor, Manifest, MANIFEST_NAME},
    peers::PeerClient,
    store::ChunkStore,
    tracker::TrackerClient,
};

const MAX_WORKERS: usize = 16;
const WORKER_MARGIN: usize = 2;
const FALLBACK_FILE_NAME: &str = "download.bin";

/// `min(16, cores + 2)`
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores + WORKER_MARGIN).min(MAX_WORKERS)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tracker: String,
    /// `host:port` this node's peer server is reachable at
    pub endpoint: String,
    pub output_dir: PathBuf,
    /// overrides the manifest's original filename
    pub output_name: Option<String>,
    pub workers: usize,
    /// rounds over primary + alternatives before a chunk is given up
    pub retry_budget: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub io_timeout: Duration,
    /// delete the chunk store after a successful reconstruction
    pub cleanup: bool,
    pub breaker: BreakerConfig,
}

impl EngineConfig {
    pub fn new(tracker: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
            endpoint: endpoint.into(),
            output_dir: PathBuf::from("."),
            output_name: None,
            workers: default_workers(),
            retry_budget: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            cleanup: false,
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reconstructed(PathBuf),
    /// reconstruction refused, these indices have no verified chunk
    Incomplete { missing: Vec<u32> },
}

#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub manifest_source: String,
    pub total_chunks: usize,
    pub already_present: usize,
    /// chunks received over the network this session
    pub fetched: usize,
    pub bytes_fetched: u64,
    /// chunks that exhausted the retry budget
    pub failed: Vec<u32>,
    pub outcome: Outcome,
}

impl AcquisitionReport {
    pub fn into_result(self) -> Result<PathBuf> {
        match self.outcome {
            Outcome::Reconstructed(path) => Ok(path),
            Outcome::Incomplete { missing } => Err(SwarmError::PartialAcquisition { missing }),
        }
    }
}

enum ChunkResult {
    Fetched { bytes: u64 },
    Failed { index: u32 },
}

/// One request for one chunk to one peer.
enum Attempt {
    Fetched(u64),
    Failed,
    /// the peer's circuit is open, nothing was sent
    Skipped,
}

/// Downloads one distribution from the swarm into a local [`ChunkStore`].
pub struct AcquisitionEngine {
    config: EngineConfig,
    store: Arc<ChunkStore>,
    tracker: TrackerClient,
    peers: PeerClient,
    breaker: CircuitBreaker,
    progress: AtomicUsize,
}

impl AcquisitionEngine {
    pub fn new(config: EngineConfig, store: Arc<ChunkStore>) -> Self {
        Self {
            tracker: TrackerClient::new(config.tracker.clone(), config.io_timeout),
            peers: PeerClient::new(config.io_timeout),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            progress: AtomicUsize::new(0),
            config,
            store,
        }
    }

    pub async fn run(&self) -> Result<AcquisitionReport> {
        let peers = self.discover().await?;
        let (source, manifest) = self.locate_manifest(&peers).await?;
        self.store
            .write(MANIFEST_NAME, manifest.to_text().as_bytes())
            .await?;

        let total_chunks = manifest.chunks.len();
        let needed = self.diff(&manifest).await?;
        let already_present = total_chunks - needed.len();
        info!(
            total = total_chunks,
            present = already_present,
            needed = needed.len(),
            workers = self.config.workers,
            %source,
            "starting acquisition"
        );

        self.progress.store(already_present, Ordering::Relaxed);
        let results: Vec<ChunkResult> = stream::iter(needed)
            .map(|chunk| self.acquire(chunk, &source, total_chunks))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut fetched = 0;
        let mut bytes_fetched = 0;
        let mut failed = Vec::new();
        for result in results {
            match result {
                ChunkResult::Fetched { bytes } => {
                    fetched += 1;
                    bytes_fetched += bytes;
                }
                ChunkResult::Failed { index } => failed.push(index),
            }
        }
        failed.sort_unstable();

        let verified = self.verified(&manifest).await?;
        let names: Vec<String> = verified
            .iter()
            .map(|&index| manifest.chunks[index as usize].name.clone())
            .collect();
        self.tracker.register(&self.config.endpoint, names).await?;
        info!(chunks = verified.len(), "registered as a source");

        let missing: Vec<u32> = manifest
            .chunks
            .iter()
            .map(|c| c.index)
            .filter(|index| !verified.contains(index))
            .collect();
        let outcome = if missing.is_empty() {
            let file_name = self
                .config
                .output_name
                .as_deref()
                .or(manifest.original_filename.as_deref())
                .unwrap_or(FALLBACK_FILE_NAME);
            let path =
                reconstruct(&manifest, &self.store, &self.config.output_dir, file_name).await?;
            if self.config.cleanup {
                self.clear_store(&manifest).await;
            }
            Outcome::Reconstructed(path)
        } else {
            Outcome::Incomplete { missing }
        };

        let report = AcquisitionReport {
            manifest_source: source,
            total_chunks,
            already_present,
            fetched,
            bytes_fetched,
            failed,
            outcome,
        };
        match &report.outcome {
            Outcome::Reconstructed(path) => info!(
                fetched = report.fetched,
                present = report.already_present,
                bytes = report.bytes_fetched,
                output = %path.display(),
                "acquisition complete"
            ),
            Outcome::Incomplete { missing } => warn!(
                fetched = report.fetched,
                present = report.already_present,
                failed = ?report.failed,
                ?missing,
                "acquisition incomplete, file not reconstructed"
            ),
        }
        Ok(report)
    }

    /// Known peers other than this node, in random order so joiners do not
    /// all pick the same manifest source and primary.
    async fn discover(&self) -> Result<Vec<String>> {
        let mut peers: Vec<String> = self
            .tracker
            .discover()
            .await?
            .into_iter()
            .filter(|peer| *peer != self.config.endpoint)
            .collect();
        if peers.is_empty() {
            return Err(SwarmError::NoPeers);
        }
        peers.shuffle(&mut rand::thread_rng());
        info!(peers = peers.len(), "discovered peers");
        Ok(peers)
    }

    async fn locate_manifest(&self, peers: &[String]) -> Result<(String, Manifest)> {
        for peer in peers {
            match self.peers.fetch_manifest(peer).await {
                Ok(manifest) => {
                    info!(
                        %peer,
                        chunks = manifest.chunks.len(),
                        file = manifest.original_filename.as_deref().unwrap_or("?"),
                        "manifest obtained"
                    );
                    return Ok((peer.clone(), manifest));
                }
                Err(e) => debug!(%peer, error = %e, "no manifest from peer"),
            }
        }
        Err(SwarmError::NoManifestSource)
    }

    /// Chunks that are absent or fail verification. Invalid local copies
    /// are deleted so they are never served.
    async fn diff(&self, manifest: &Manifest) -> Result<Vec<ChunkDescriptor>> {
        let mut needed = Vec::new();
        for chunk in &manifest.chunks {
            if self.store.verify(chunk).await? {
                continue;
            }
            if self.store.contains(&chunk.name).await {
                warn!(chunk = %chunk.name, "local copy failed verification, discarding");
                self.store.remove(&chunk.name).await?;
            }
            needed.push(chunk.clone());
        }
        Ok(needed)
    }

    async fn verified(&self, manifest: &Manifest) -> Result<BTreeSet<u32>> {
        let mut verified = BTreeSet::new();
        for chunk in &manifest.chunks {
            if self.store.verify(chunk).await? {
                verified.insert(chunk.index);
            }
        }
        Ok(verified)
    }

    /// Fetches one chunk: primary first, then every alternative the tracker
    /// knows, repeated for `retry_budget` rounds.
    ///
    /// A round in which every source was behind an open circuit does not
    /// count while the chunk can still wait out the breaker's cooldown.
    async fn acquire(&self, chunk: ChunkDescriptor, primary: &str, total: usize) -> ChunkResult {
        let budget = self.config.retry_budget;
        let patience = self.config.breaker.cooldown.saturating_mul(budget.saturating_add(1));
        let started = Instant::now();
        let mut round = 0;
        while round < budget {
            if round > 0 {
                let pause = self.backoff(round);
                debug!(chunk = %chunk.name, round, ?pause, "retrying");
                tokio::time::sleep(pause).await;
            }

            let mut attempted = HashSet::new();
            let mut reached = false;
            match self.attempt(primary, &chunk, &mut attempted).await {
                Attempt::Fetched(bytes) => return self.completed(&chunk, primary, bytes, total).await,
                Attempt::Failed => reached = true,
                Attempt::Skipped => {}
            }

            let alternatives = match self.tracker.find_chunk(&chunk.name).await {
                Ok(alternatives) => alternatives,
                Err(e) => {
                    warn!(chunk = %chunk.name, error = %e, "cannot look up alternative sources");
                    Vec::new()
                }
            };
            for peer in alternatives {
                if peer == self.config.endpoint || attempted.contains(&peer) {
                    continue;
                }
                match self.attempt(&peer, &chunk, &mut attempted).await {
                    Attempt::Fetched(bytes) => {
                        return self.completed(&chunk, &peer, bytes, total).await
                    }
                    Attempt::Failed => reached = true,
                    Attempt::Skipped => {}
                }
            }

            if !reached && started.elapsed() < patience {
                let pause = self.backoff(1);
                debug!(chunk = %chunk.name, ?pause, "all sources behind open circuits, waiting");
                tokio::time::sleep(pause).await;
                continue;
            }
            round += 1;
            warn!(chunk = %chunk.name, round, "no source delivered the chunk");
        }

        warn!(
            chunk = %chunk.name,
            rounds = budget,
            "retry budget exhausted, giving up"
        );
        ChunkResult::Failed { index: chunk.index }
    }

    async fn attempt(
        &self,
        peer: &str,
        chunk: &ChunkDescriptor,
        attempted: &mut HashSet<String>,
    ) -> Attempt {
        attempted.insert(peer.to_owned());
        if !self.breaker.allows(peer) {
            debug!(%peer, chunk = %chunk.name, "circuit open, skipping peer");
            return Attempt::Skipped;
        }
        match self.peers.fetch_chunk(peer, chunk, &self.store).await {
            Ok(bytes) => {
                self.breaker.record_success(peer);
                Attempt::Fetched(bytes)
            }
            Err(e) if e.is_peer_fault() => {
                self.breaker.record_failure(peer);
                warn!(%peer, chunk = %chunk.name, error = %e, "fetch failed");
                Attempt::Failed
            }
            Err(e) => {
                // the peer answered; a missing or corrupt copy is about this chunk only
                self.breaker.record_success(peer);
                if matches!(e, SwarmError::Integrity { .. }) {
                    warn!(%peer, chunk = %chunk.name, error = %e, "peer served a corrupt copy");
                } else {
                    debug!(%peer, chunk = %chunk.name, error = %e, "fetch failed");
                }
                Attempt::Failed
            }
        }
    }

    async fn completed(
        &self,
        chunk: &ChunkDescriptor,
        peer: &str,
        bytes: u64,
        total: usize,
    ) -> ChunkResult {
        let done = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
        info!(chunk = %chunk.name, %peer, bytes, "chunk verified ({done}/{total})");
        if let Err(e) = self
            .tracker
            .announce(&self.config.endpoint, &chunk.name)
            .await
        {
            warn!(chunk = %chunk.name, error = %e, "incremental announce failed");
        }
        ChunkResult::Fetched { bytes }
    }

    fn backoff(&self, round: u32) -> Duration {
        let base = self.config.backoff_base;
        let exponential = base
            .saturating_mul(1_u32 << (round - 1).min(16))
            .min(self.config.backoff_max);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exponential + Duration::from_millis(jitter)
    }

    async fn clear_store(&self, manifest: &Manifest) {
        for name in manifest
            .chunks
            .iter()
            .map(|c| c.name.as_str())
            .chain([MANIFEST_NAME])
        {
            if let Err(e) = self.store.remove(name).await {
                warn!(%name, error = %e, "failed to remove artifact");
            }
        }
        if let Err(e) = self.tracker.register(&self.config.endpoint, Vec::new()).await {
            warn!(error = %e, "failed to withdraw offered chunks");
        }
        info!(dir = %self.store.root().display(), "chunk store cleared");
    }
}

/// Claims `name`, or `stem_1.ext`, `stem_2.ext`, ... if taken, by creating
/// an empty file there. Creation is exclusive, so two claims never return
/// the same path.
pub async fn claim_path(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());
    let extension = as_path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 0_u32;
    loop {
        let candidate = match (n, &extension) {
            (0, _) => dir.join(name),
            (n, Some(ext)) => dir.join(format!("{stem}_{n}.{ext}")),
            (n, None) => dir.join(format!("{stem}_{n}")),
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_owned())
}

/// Concatenates the manifest's chunks in index order into a new file in
/// `output_dir`.
///
/// Every chunk is re-verified as it is copied; a missing or mismatching
/// chunk aborts the whole reconstruction and leaves no output behind.
pub async fn reconstruct(
    manifest: &Manifest,
    store: &ChunkStore,
    output_dir: &Path,
    file_name: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).await?;
    let file_name = sanitize_file_name(file_name);
    let tmp = output_dir.join(format!(".{file_name}.partial"));

    let mut chunks: Vec<&ChunkDescriptor> = manifest.chunks.iter().collect();
    chunks.sort_by_key(|c| c.index);

    let written: Result<()> = async {
        let mut out = File::create(&tmp).await?;
        for chunk in chunks {
            let data = store
                .read(&chunk.name)
                .await?
                .ok_or_else(|| SwarmError::PartialAcquisition {
                    missing: vec![chunk.index],
                })?;
            let actual = sha256_hex(&data);
            if actual != chunk.expected_hash {
                return Err(SwarmError::Integrity {
                    name: chunk.name.clone(),
                    expected: chunk.expected_hash.clone(),
                    actual,
                });
            }
            out.write_all(&data).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    let target = match claim_path(output_dir, &file_name).await {
        Ok(target) => target,
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
    };
    // replaces only the placeholder claimed above
    if let Err(e) = fs::rename(&tmp, &target).await {
        let _ = fs::remove_file(&tmp).await;
        let _ = fs::remove_file(&target).await;
        return Err(e.into());
    }
    Ok(target)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        breaker::CircuitState,
        digest::sha256_hex,
        peers::{PeerServer, PeerServerConfig},
        splitter::ContentSplitter,
        swarm::Swarm,
        tracker::{TrackerServer, TrackerServerConfig},
    };

    const CHUNK: usize = 4096;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 13) as u8).collect()
    }

    async fn start_tracker() -> (String, Arc<Swarm>) {
        let server = TrackerServer::bind("127.0.0.1:0", TrackerServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let swarm = server.swarm();
        tokio::spawn(server.run());
        (addr, swarm)
    }

    async fn start_peer(dir: &Path) -> (String, Arc<ChunkStore>) {
        let store = Arc::new(ChunkStore::open(dir).await.unwrap());
        let server = PeerServer::bind("127.0.0.1:0", store.clone(), PeerServerConfig::default())
            .await
            .unwrap();
        let endpoint = server.local_addr().unwrap().to_string();
        tokio::spawn(server.run());
        (endpoint, store)
    }

    /// Splits `data` into a fresh seeder and registers it with the tracker.
    async fn start_seeder(tracker: &str, dir: &Path, data: &[u8]) -> (String, Arc<ChunkStore>, Manifest) {
        let source = dir.join("source.bin");
        std::fs::write(&source, data).unwrap();
        let (endpoint, store) = start_peer(&dir.join("seed")).await;
        let manifest = ContentSplitter::with_chunk_size(CHUNK)
            .unwrap()
            .split(&source, &store)
            .await
            .unwrap();
        let names = manifest.chunks.iter().map(|c| c.name.clone()).collect();
        TrackerClient::new(tracker, Duration::from_secs(5))
            .register(&endpoint, names)
            .await
            .unwrap();
        (endpoint, store, manifest)
    }

    async fn dead_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);
        endpoint
    }

    /// Accepts connections and never answers them.
    async fn stalled_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        endpoint
    }

    fn hidden_files(store: &ChunkStore) -> Vec<String> {
        std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    fn config(tracker: &str, endpoint: &str, output_dir: &Path) -> EngineConfig {
        EngineConfig {
            output_dir: output_dir.to_path_buf(),
            workers: 4,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            io_timeout: Duration::from_secs(5),
            ..EngineConfig::new(tracker, endpoint)
        }
    }

    #[tokio::test]
    async fn downloads_and_reconstructs_from_a_seeder() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, swarm) = start_tracker().await;
        let data = sample(50_000);
        let (_, _, manifest) = start_seeder(&tracker, dir.path(), &data).await;
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;

        let out = dir.path().join("out");
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store.clone());
        let report = engine.run().await.unwrap();

        assert_eq!(report.total_chunks, 13);
        assert_eq!(report.fetched, 13);
        assert_eq!(report.bytes_fetched, 50_000);
        assert!(report.failed.is_empty());
        let path = report.into_result().unwrap();
        assert_eq!(path, out.join("source.bin"));
        assert_eq!(sha256_hex(&std::fs::read(&path).unwrap()), sha256_hex(&data));

        for chunk in &manifest.chunks {
            assert!(store.verify(chunk).await.unwrap());
        }
        assert!(store.contains(MANIFEST_NAME).await);
        let offered = swarm.peer_chunks(&endpoint).unwrap();
        assert_eq!(offered.len(), 13);
    }

    #[tokio::test]
    async fn second_run_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let data = sample(20_000);
        start_seeder(&tracker, dir.path(), &data).await;
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let out = dir.path().join("out");

        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store.clone());
        let first = engine.run().await.unwrap();
        assert_eq!(first.fetched, 5);

        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store);
        let second = engine.run().await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.already_present, 5);
        let path = second.into_result().unwrap();
        assert_eq!(path, out.join("source_1.bin"));
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn fails_over_when_the_primary_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let client = TrackerClient::new(&tracker, Duration::from_secs(5));

        let p1 = dead_endpoint().await;
        let (p2, p2_store) = start_peer(&dir.path().join("p2")).await;
        p2_store.write("part_0", b"chunk zero").await.unwrap();
        client.register(&p1, Vec::new()).await.unwrap();
        client.register(&p2, vec!["part_0".into()]).await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, dir.path()), store.clone());
        let chunk = ChunkDescriptor::new(0, sha256_hex(b"chunk zero"), 10);

        let result = engine.acquire(chunk.clone(), &p1, 1).await;
        assert!(matches!(result, ChunkResult::Fetched { bytes: 10 }));
        assert!(store.verify(&chunk).await.unwrap());
    }

    #[tokio::test]
    async fn fails_over_when_the_primary_serves_a_corrupt_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let client = TrackerClient::new(&tracker, Duration::from_secs(5));

        let (p1, p1_store) = start_peer(&dir.path().join("p1")).await;
        let (p2, p2_store) = start_peer(&dir.path().join("p2")).await;
        p1_store.write("part_0", b"chunk zerO").await.unwrap();
        p2_store.write("part_0", b"chunk zero").await.unwrap();
        client.register(&p1, vec!["part_0".into()]).await.unwrap();
        client.register(&p2, vec!["part_0".into()]).await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let cfg = EngineConfig {
            retry_budget: 1,
            ..config(&tracker, &endpoint, dir.path())
        };
        let engine = AcquisitionEngine::new(cfg, store.clone());
        let chunk = ChunkDescriptor::new(0, sha256_hex(b"chunk zero"), 10);

        let result = engine.acquire(chunk.clone(), &p1, 1).await;
        assert!(matches!(result, ChunkResult::Fetched { bytes: 10 }));
        assert_eq!(store.read("part_0").await.unwrap().unwrap(), b"chunk zero");
        assert!(hidden_files(&store).is_empty());
        assert_eq!(engine.breaker.state(&p1), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fails_over_when_the_primary_never_answers() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let client = TrackerClient::new(&tracker, Duration::from_secs(5));

        let p1 = stalled_endpoint().await;
        let (p2, p2_store) = start_peer(&dir.path().join("p2")).await;
        p2_store.write("part_0", b"chunk zero").await.unwrap();
        client.register(&p1, vec!["part_0".into()]).await.unwrap();
        client.register(&p2, vec!["part_0".into()]).await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let cfg = EngineConfig {
            retry_budget: 1,
            io_timeout: Duration::from_millis(300),
            ..config(&tracker, &endpoint, dir.path())
        };
        let engine = AcquisitionEngine::new(cfg, store.clone());
        let chunk = ChunkDescriptor::new(0, sha256_hex(b"chunk zero"), 10);

        let result = engine.acquire(chunk.clone(), &p1, 1).await;
        assert!(matches!(result, ChunkResult::Fetched { bytes: 10 }));
        assert!(store.verify(&chunk).await.unwrap());
        assert!(hidden_files(&store).is_empty());
    }

    #[tokio::test]
    async fn corrupt_chunk_does_not_fail_the_rest_of_its_seeder() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let data = sample(6 * CHUNK);
        let (seed, seed_store, _) = start_seeder(&tracker, dir.path(), &data).await;
        seed_store.write("part_1", &vec![0xAA; CHUNK]).await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let cfg = EngineConfig {
            output_dir: dir.path().join("out"),
            workers: 1,
            ..EngineConfig::new(&tracker, &endpoint)
        };
        let engine = AcquisitionEngine::new(cfg, store);
        let report = engine.run().await.unwrap();

        assert_eq!(report.fetched, 5);
        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.outcome, Outcome::Incomplete { missing: vec![1] });
        assert_eq!(engine.breaker.state(&seed), CircuitState::Closed);
    }

    #[tokio::test]
    async fn several_corrupt_chunks_fail_only_themselves() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let data = sample(20 * CHUNK);
        let (_, seed_store, _) = start_seeder(&tracker, dir.path(), &data).await;
        for name in ["part_1", "part_4", "part_5", "part_13"] {
            seed_store.write(name, &vec![0x55; CHUNK]).await.unwrap();
        }

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let engine = AcquisitionEngine::new(
            config(&tracker, &endpoint, &dir.path().join("out")),
            store,
        );
        let report = engine.run().await.unwrap();
        assert_eq!(report.failed, vec![1, 4, 5, 13]);
        assert_eq!(report.fetched, 16);
    }

    #[tokio::test]
    async fn waits_out_an_open_circuit_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let (seed, seed_store) = start_peer(&dir.path().join("seed")).await;
        seed_store.write("part_0", b"zero").await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let cfg = EngineConfig {
            retry_budget: 1,
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(200),
            },
            ..config(&tracker, &endpoint, dir.path())
        };
        let engine = AcquisitionEngine::new(cfg, store);
        engine.breaker.record_failure(&seed);
        assert_eq!(engine.breaker.state(&seed), CircuitState::Open);

        let chunk = ChunkDescriptor::new(0, sha256_hex(b"zero"), 4);
        assert!(matches!(
            engine.acquire(chunk, &seed, 1).await,
            ChunkResult::Fetched { bytes: 4 }
        ));
        assert_eq!(engine.breaker.state(&seed), CircuitState::Closed);
    }

    #[tokio::test]
    async fn discovered_peers_are_shuffled() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let client = TrackerClient::new(&tracker, Duration::from_secs(5));
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        client.register(&endpoint, Vec::new()).await.unwrap();
        let mut expected: Vec<String> = (0..8).map(|i| format!("127.0.0.1:{}", 9001 + i)).collect();
        for peer in &expected {
            client.register(peer, Vec::new()).await.unwrap();
        }
        expected.sort();

        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, dir.path()), store);
        let mut firsts = HashSet::new();
        for _ in 0..20 {
            let mut peers = engine.discover().await.unwrap();
            firsts.insert(peers[0].clone());
            peers.sort();
            assert_eq!(peers, expected);
        }
        assert!(firsts.len() > 1, "{firsts:?}");
    }

    #[tokio::test]
    async fn full_run_skips_an_unreachable_registered_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let data = sample(10_000);
        start_seeder(&tracker, dir.path(), &data).await;
        let dead = dead_endpoint().await;
        TrackerClient::new(&tracker, Duration::from_secs(5))
            .register(&dead, vec!["part_0".into(), "part_1".into()])
            .await
            .unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let out = dir.path().join("out");
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store);
        let path = engine.run().await.unwrap().into_result().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn incremental_announce_keeps_earlier_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, swarm) = start_tracker().await;
        let (seed, seed_store) = start_peer(&dir.path().join("seed")).await;
        seed_store.write("part_0", b"zero").await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        TrackerClient::new(&tracker, Duration::from_secs(5))
            .register(&endpoint, vec!["part_7".into()])
            .await
            .unwrap();

        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, dir.path()), store);
        let chunk = ChunkDescriptor::new(0, sha256_hex(b"zero"), 4);
        assert!(matches!(
            engine.acquire(chunk, &seed, 1).await,
            ChunkResult::Fetched { .. }
        ));
        assert_eq!(
            swarm.peer_chunks(&endpoint),
            Some(vec!["part_0".to_string(), "part_7".to_string()])
        );
    }

    #[tokio::test]
    async fn corrupted_chunk_is_retried_then_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, swarm) = start_tracker().await;
        let data = sample(3 * CHUNK);
        let (_, seed_store, _) = start_seeder(&tracker, dir.path(), &data).await;
        seed_store.write("part_1", &vec![0xAA; CHUNK]).await.unwrap();

        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        let out = dir.path().join("out");
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store.clone());
        let report = engine.run().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, vec![1]);
        assert_eq!(report.outcome, Outcome::Incomplete { missing: vec![1] });
        assert!(!store.contains("part_1").await);
        assert!(!out.exists() || std::fs::read_dir(&out).unwrap().count() == 0);
        let leftovers = hidden_files(&store);
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert_eq!(
            swarm.peer_chunks(&endpoint),
            Some(vec!["part_0".to_string(), "part_2".to_string()])
        );
        assert!(matches!(
            report.into_result(),
            Err(SwarmError::PartialAcquisition { missing }) if missing == vec![1]
        ));
    }

    #[tokio::test]
    async fn invalid_local_chunk_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = start_tracker().await;
        let data = sample(2 * CHUNK);
        start_seeder(&tracker, dir.path(), &data).await;
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;
        store.write("part_0", b"stale").await.unwrap();

        let out = dir.path().join("out");
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, &out), store);
        let report = engine.run().await.unwrap();
        assert_eq!(report.already_present, 0);
        assert_eq!(report.fetched, 2);
        assert_eq!(std::fs::read(report.into_result().unwrap()).unwrap(), data);
    }

    #[tokio::test]
    async fn cleanup_clears_the_store_and_withdraws_offers() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, swarm) = start_tracker().await;
        let data = sample(CHUNK + 1);
        start_seeder(&tracker, dir.path(), &data).await;
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;

        let cfg = EngineConfig {
            cleanup: true,
            output_name: Some("renamed.dat".into()),
            ..config(&tracker, &endpoint, &dir.path().join("out"))
        };
        let path = AcquisitionEngine::new(cfg, store.clone())
            .run()
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert!(path.ends_with("renamed.dat"));
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(swarm.peer_chunks(&endpoint), Some(Vec::new()));
    }

    #[tokio::test]
    async fn structural_failures_abort_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, store) = start_peer(&dir.path().join("leech")).await;

        let dead = dead_endpoint().await;
        let engine = AcquisitionEngine::new(config(&dead, &endpoint, dir.path()), store.clone());
        assert!(matches!(
            engine.run().await,
            Err(SwarmError::TrackerUnavailable { .. })
        ));

        let (tracker, _) = start_tracker().await;
        let client = TrackerClient::new(&tracker, Duration::from_secs(5));
        client.register(&endpoint, Vec::new()).await.unwrap();
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, dir.path()), store.clone());
        assert!(matches!(engine.run().await, Err(SwarmError::NoPeers)));

        let (empty_peer, _) = start_peer(&dir.path().join("empty")).await;
        client.register(&empty_peer, Vec::new()).await.unwrap();
        let engine = AcquisitionEngine::new(config(&tracker, &endpoint, dir.path()), store);
        assert!(matches!(engine.run().await, Err(SwarmError::NoManifestSource)));
    }

    #[tokio::test]
    async fn reconstruction_follows_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks")).await.unwrap();
        let parts: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];
        for (index, part) in parts.iter().enumerate().rev() {
            store
                .write(&crate::manifest::chunk_name(index as u32), part)
                .await
                .unwrap();
        }
        let manifest = Manifest {
            original_filename: Some("../../escape.txt".into()),
            chunks: parts
                .iter()
                .enumerate()
                .map(|(i, p)| ChunkDescriptor::new(i as u32, sha256_hex(p), p.len() as u64))
                .collect(),
        };

        let out = dir.path().join("out");
        let name = manifest.original_filename.clone().unwrap();
        let path = reconstruct(&manifest, &store, &out, &name).await.unwrap();
        assert_eq!(path, out.join("escape.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"alpha-beta-gamma");

        store.remove("part_1").await.unwrap();
        assert!(matches!(
            reconstruct(&manifest, &store, &out, &name).await,
            Err(SwarmError::PartialAcquisition { .. })
        ));
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn claim_path_appends_a_counter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_1.tar"), b"keep").unwrap();
        assert_eq!(claim_path(dir.path(), "a.tar").await.unwrap(), dir.path().join("a.tar"));
        assert_eq!(claim_path(dir.path(), "a.tar").await.unwrap(), dir.path().join("a_2.tar"));
        assert_eq!(std::fs::read(dir.path().join("a_1.tar")).unwrap(), b"keep");
        std::fs::write(dir.path().join("noext"), b"").unwrap();
        assert_eq!(claim_path(dir.path(), "noext").await.unwrap(), dir.path().join("noext_1"));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let claims = futures::future::join_all(
            (0..8).map(|_| claim_path(dir.path(), "out.bin")),
        )
        .await;
        let claimed: HashSet<PathBuf> = claims.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(claimed.len(), 8);
        assert!(claimed.contains(&dir.path().join("out.bin")));
    }

    #[tokio::test]
    async fn backoff_grows_and_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let engine_config = EngineConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(300),
            ..EngineConfig::new("127.0.0.1:1", "127.0.0.1:2")
        };
        let store = Arc::new(ChunkStore::open(dir.path()).await.unwrap());
        let engine = AcquisitionEngine::new(engine_config, store);
        let first = engine.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = engine.backoff(3);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(350));
        assert!(default_workers() >= 1 && default_workers() <= MAX_WORKERS);
    }
}
