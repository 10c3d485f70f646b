use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;

use crate::{digest::hash_file, manifest::ChunkDescriptor};

/// A node's on-disk chunk directory.
///
/// Files only ever appear under their final name through a rename of a fully
/// flushed partial file, so a reader that can open `part_N` always sees the
/// complete chunk. Partial files are hidden (leading dot) and never served.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

/// Rejects anything that could escape the store directory or name a partial.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && name != ".."
}

fn invalid_name(name: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("invalid artifact name {name:?}"))
}

impl ChunkStore {
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}.partial"))
    }

    pub async fn contains(&self, name: &str) -> bool {
        is_safe_name(name)
            && fs::metadata(self.path(name))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
    }

    pub async fn create_partial(&self, name: &str) -> io::Result<PartialChunk> {
        if !is_safe_name(name) {
            return Err(invalid_name(name));
        }
        let tmp = self.partial_path(name);
        let file = File::create(&tmp).await?;
        Ok(PartialChunk {
            tmp,
            target: self.path(name),
            file,
        })
    }

    /// Atomically replaces `name` with `data`.
    pub async fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut partial = self.create_partial(name).await?;
        if let Err(e) = partial.write(data).await {
            partial.discard().await;
            return Err(e);
        }
        partial.commit().await
    }

    /// Opens a complete artifact for reading, with its length.
    pub async fn open_artifact(&self, name: &str) -> io::Result<Option<(File, u64)>> {
        if !is_safe_name(name) {
            return Err(invalid_name(name));
        }
        match File::open(self.path(name)).await {
            Ok(file) => {
                let meta = file.metadata().await?;
                if !meta.is_file() {
                    return Ok(None);
                }
                Ok(Some((file, meta.len())))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        if !is_safe_name(name) {
            return Err(invalid_name(name));
        }
        match fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn hash(&self, name: &str) -> io::Result<Option<String>> {
        if !self.contains(name).await {
            return Ok(None);
        }
        match hash_file(&self.path(name)).await {
            Ok(hash) => Ok(Some(hash)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True when the stored chunk exists and matches its expected hash.
    pub async fn verify(&self, chunk: &ChunkDescriptor) -> io::Result<bool> {
        Ok(self.hash(&chunk.name).await?.as_deref() == Some(chunk.expected_hash.as_str()))
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        if !is_safe_name(name) {
            return Err(invalid_name(name));
        }
        match fs::remove_file(self.path(name)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Names of all complete artifacts, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_safe_name(name) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A chunk being written. Dropping it without `commit` leaves only the
/// hidden partial file behind, which the next write of the same name
/// truncates.
pub struct PartialChunk {
    tmp: PathBuf,
    target: PathBuf,
    file: File,
}

impl PartialChunk {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    pub async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.tmp, &self.target).await?;
        debug!(path = %self.target.display(), "artifact committed");
        Ok(())
    }

    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.tmp).await {
            debug!(path = %self.tmp.display(), error = %e, "failed to remove partial file");
        }
    }
}
