//! Splitting binaries into chunks.
//!
//! A [`Chunker`] turns any [`Read`] into an iterator of owned chunks. With
//! [`Chunker::WholeFile`] the entire stream is one chunk. With
//! [`Chunker::RollingHash`] boundaries are content-defined: a Rabin–Karp hash
//! over the last 48 bytes is checked against a mask after every byte, so an
//! insertion early in a file only disturbs the chunks around it and identical
//! regions in different files produce identical chunks.
//!
//! Concatenating the chunks always reproduces the input exactly. An empty
//! input yields exactly one empty chunk.

pub mod error;
mod rolling;

pub use crate::rolling::{SEED, WINDOW};
use crate::error::{ErrorKind, Result};
use crate::rolling::RollingHash;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

const READ_SIZE: usize = 64 * 1024;

/// Content-defined chunking parameters.
///
/// The expected distance between boundaries after `min_size` is
/// `2^mask_bits` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingHashParams {
    /// No boundary is cut before a chunk reaches this many bytes. Values
    /// below [`WINDOW`] are raised to it.
    pub min_size: usize,
    /// Number of low hash bits that must all be set to cut a boundary.
    pub mask_bits: u32,
    /// A boundary is forced once a chunk reaches this many bytes.
    pub max_size: usize,
}

impl Default for RollingHashParams {
    fn default() -> Self {
        Self {
            min_size: 64 * 1024,
            mask_bits: 20,
            max_size: 4 * 1024 * 1024,
        }
    }
}

impl RollingHashParams {
    pub fn validate(&self) -> Result<()> {
        if !(1..=48).contains(&self.mask_bits) {
            exn::bail!(ErrorKind::InvalidParameters(format!("mask_bits must be 1..=48, got {}", self.mask_bits)));
        }
        if self.max_size < self.effective_min_size() {
            exn::bail!(ErrorKind::InvalidParameters(format!(
                "max_size ({}) is below min_size ({})",
                self.max_size,
                self.effective_min_size()
            )));
        }
        Ok(())
    }

    fn effective_min_size(&self) -> usize {
        self.min_size.max(WINDOW)
    }

    fn mask(&self) -> u64 {
        (1u64 << self.mask_bits) - 1
    }
}

/// Strategy for splitting a binary's byte stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Chunker {
    /// The whole stream is a single chunk.
    #[default]
    WholeFile,
    /// Content-defined boundaries from a rolling hash.
    RollingHash(RollingHashParams),
}

impl Chunker {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::WholeFile => Ok(()),
            Self::RollingHash(params) => params.validate(),
        }
    }

    /// Lazily split `reader` into chunks.
    pub fn chunks<R: Read>(&self, reader: R) -> Chunks<R> {
        let boundary = match self {
            Self::WholeFile => None,
            Self::RollingHash(params) => Some(Boundary {
                min_size: params.effective_min_size(),
                max_size: params.max_size.max(params.effective_min_size()),
                mask: params.mask(),
                hash: RollingHash::new(),
            }),
        };
        Chunks {
            reader,
            boundary,
            buffer: vec![0; READ_SIZE].into_boxed_slice(),
            position: 0,
            filled: 0,
            finished: false,
            yielded: false,
        }
    }
}

struct Boundary {
    min_size: usize,
    max_size: usize,
    mask: u64,
    hash: RollingHash,
}

impl Boundary {
    /// Feed one byte; `true` when the chunk should end after it.
    fn cut_after(&mut self, byte: u8, chunk_len: usize) -> bool {
        let hash = self.hash.roll(byte);
        chunk_len >= self.max_size || (chunk_len >= self.min_size && hash & self.mask == self.mask)
    }
}

/// Iterator over the chunks of a stream. See [`Chunker::chunks`].
pub struct Chunks<R> {
    reader: R,
    boundary: Option<Boundary>,
    buffer: Box<[u8]>,
    position: usize,
    filled: usize,
    finished: bool,
    yielded: bool,
}

impl<R: Read> Chunks<R> {
    /// Returns `false` at end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        loop {
            match self.reader.read(&mut self.buffer) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.position = 0;
                    self.filled = n;
                    return Ok(true);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut chunk = Vec::new();
        if let Some(boundary) = self.boundary.as_mut() {
            boundary.hash.reset();
        }
        loop {
            if self.position == self.filled {
                match self.fill() {
                    Ok(true) => {},
                    Ok(false) => {
                        self.finished = true;
                        // Flush whatever is left; an empty stream still has one (empty) chunk.
                        if chunk.is_empty() && self.yielded {
                            return None;
                        }
                        self.yielded = true;
                        return Some(Ok(chunk));
                    },
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e).or_raise(|| ErrorKind::Io));
                    },
                }
            }
            let available = &self.buffer[self.position..self.filled];
            match self.boundary.as_mut() {
                None => {
                    chunk.extend_from_slice(available);
                    self.position = self.filled;
                },
                Some(boundary) => {
                    for (i, &byte) in available.iter().enumerate() {
                        if boundary.cut_after(byte, chunk.len() + i + 1) {
                            chunk.extend_from_slice(&available[..=i]);
                            self.position += i + 1;
                            self.yielded = true;
                            tracing::trace!(size = chunk.len(), "chunk boundary");
                            return Some(Ok(chunk));
                        }
                    }
                    chunk.extend_from_slice(available);
                    self.position = self.filled;
                },
            }
        }
    }
}
