use std::fmt::Write as _;

use crate::{
    digest::is_sha256_hex,
    error::{Result, SwarmError},
};

/// Name under which every node stores and serves the manifest.
pub const MANIFEST_NAME: &str = "manifest.txt";

const ORIGINAL_FILENAME: &str = "ORIGINAL_FILENAME";
const CHUNK_PREFIX: &str = "part_";

pub fn chunk_name(index: u32) -> String {
    format!("{CHUNK_PREFIX}{index}")
}

pub fn chunk_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(CHUNK_PREFIX)?;
    // "part_01" would alias "part_1"
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub name: String,
    /// lowercase hex SHA-256 of the stored chunk bytes
    pub expected_hash: String,
    /// absent only in manifests written without the size column
    pub size: Option<u64>,
}

impl ChunkDescriptor {
    pub fn new(index: u32, expected_hash: String, size: u64) -> Self {
        Self {
            index,
            name: chunk_name(index),
            expected_hash,
            size: Some(size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub original_filename: Option<String>,
    /// sorted by index, indices are exactly 0..len
    pub chunks: Vec<ChunkDescriptor>,
}

/// The value of an `ORIGINAL_FILENAME <name>` line. The keyword must be a
/// whole token.
fn filename_header(line: &str) -> Option<&str> {
    let (token, rest) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    (token == ORIGINAL_FILENAME).then_some(rest)
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();

        let mut original_filename = None;
        if let Some(rest) = lines.peek().copied().and_then(filename_header) {
            let name = rest.trim();
            if name.is_empty() {
                return Err(SwarmError::Manifest("empty original filename".into()));
            }
            original_filename = Some(name.to_owned());
            lines.next();
        }

        let mut chunks = Vec::new();
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (name, hash, size) = match fields.as_slice() {
                [name, hash] => (*name, *hash, None),
                [name, hash, size] => {
                    let size = size
                        .parse::<u64>()
                        .map_err(|_| SwarmError::Manifest(format!("bad size in line {line:?}")))?;
                    (*name, *hash, Some(size))
                }
                _ => return Err(SwarmError::Manifest(format!("malformed line {line:?}"))),
            };
            let index = chunk_index(name)
                .ok_or_else(|| SwarmError::Manifest(format!("bad chunk name {name:?}")))?;
            if !is_sha256_hex(hash) {
                return Err(SwarmError::Manifest(format!("bad hash for {name}")));
            }
            chunks.push(ChunkDescriptor {
                index,
                name: name.to_owned(),
                expected_hash: hash.to_ascii_lowercase(),
                size,
            });
        }

        chunks.sort_by_key(|c| c.index);
        if let Some((position, chunk)) = chunks
            .iter()
            .enumerate()
            .find(|(position, c)| c.index as usize != *position)
        {
            return Err(SwarmError::Manifest(format!(
                "chunk indices not contiguous: expected {position}, found {}",
                chunk.index
            )));
        }

        Ok(Self {
            original_filename,
            chunks,
        })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if let Some(name) = &self.original_filename {
            let _ = writeln!(out, "{ORIGINAL_FILENAME} {name}");
        }
        for chunk in &self.chunks {
            match chunk.size {
                Some(size) => {
                    let _ = writeln!(out, "{} {} {}", chunk.name, chunk.expected_hash, size);
                }
                None => {
                    let _ = writeln!(out, "{} {}", chunk.name, chunk.expected_hash);
                }
            }
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<&ChunkDescriptor> {
        chunk_index(name).and_then(|i| self.chunks.get(i as usize))
    }

    pub fn total_size(&self) -> Option<u64> {
        self.chunks.iter().map(|c| c.size).sum()
    }
}
