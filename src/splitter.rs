use std::path::Path;

use tokio::{fs::File, io::AsyncReadExt};
use tracing::info;

use crate::{
    error::{Result, SwarmError},
    manifest::{chunk_name, ChunkDescriptor, Manifest, MANIFEST_NAME},
    messages::MAX_DATA_FRAME,
    store::ChunkStore,
};

pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Cuts a file into fixed-size chunks inside a [`ChunkStore`].
#[derive(Debug, Clone)]
pub struct ContentSplitter {
    chunk_size: usize,
}

impl ContentSplitter {
    pub fn with_chunk_size(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size as u64 > MAX_DATA_FRAME as u64 {
            return Err(SwarmError::Config(format!(
                "chunk size must be between 1 and {MAX_DATA_FRAME} bytes, got {chunk_size}"
            )));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }

    /// Writes every chunk of `source` into `store`, then the manifest.
    ///
    /// Hashes are taken from the chunk files as stored, and the manifest is
    /// only written once every chunk it names has been committed.
    pub async fn split(&self, source: &Path, store: &ChunkStore) -> Result<Manifest> {
        let mut file = File::open(source).await?;
        let file_size = file.metadata().await?.len();
        info!(
            source = %source.display(),
            file_size,
            chunk_size = self.chunk_size,
            chunks = self.chunk_count(file_size),
            "splitting file"
        );

        let mut chunks = Vec::new();
        let mut buf = vec![0_u8; self.chunk_size];
        loop {
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            let index = u32::try_from(chunks.len())
                .map_err(|_| SwarmError::Config("too many chunks for this chunk size".into()))?;
            let name = chunk_name(index);
            store.write(&name, &buf[..n]).await?;
            let expected_hash = store.hash(&name).await?.ok_or_else(|| {
                SwarmError::Io(std::io::Error::other(format!("{name} vanished after write")))
            })?;
            chunks.push(ChunkDescriptor::new(index, expected_hash, n as u64));
            if n < buf.len() {
                break;
            }
        }

        let manifest = Manifest {
            original_filename: source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            chunks,
        };
        store.write(MANIFEST_NAME, manifest.to_text().as_bytes()).await?;
        info!(chunks = manifest.chunks.len(), "manifest published");
        Ok(manifest)
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
