//! Fixed and content-defined chunkers.
//!
//! A chunker is a finite, restartable lazy sequence of [`Blob`]s over an
//! in-memory buffer, driven by `next()` + `chunk()`. Concatenating every
//! produced chunk reproduces the input byte-for-byte.

use bytes::Bytes;

use crate::blob::Blob;
use crate::config::{ChunkingMethod, StorageConfig};
use crate::error::Result;
use crate::signature::HashAlgorithm;

/// Bytes covered by the rolling hash window.
pub const WINDOW_SIZE: usize = 48;

/// Rabin-Karp multiplier.
pub const HASH_PRIME: u64 = 31;

pub enum Chunker {
    Fixed(FixedChunker),
    Variable(RabinChunker),
}

impl Chunker {
    /// Builds a chunker over `data` according to the storage configuration.
    /// The configuration is validated first; an invalid block geometry or an
    /// unknown method never produces a chunker.
    pub fn new(data: impl Into<Bytes>, config: &StorageConfig) -> Result<Chunker> {
        config.validate()?;
        let data = data.into();
        Ok(match config.chunking {
            ChunkingMethod::Fixed => Chunker::Fixed(FixedChunker {
                data,
                alg: config.hashing,
                block_size: config.block_size,
                min_block_size: config.min_block_size,
                offset: 0,
                current: None,
            }),
            ChunkingMethod::Variable => {
                let mut window_pow = 1u64;
                for _ in 1..WINDOW_SIZE {
                    window_pow = window_pow.wrapping_mul(HASH_PRIME);
                }
                Chunker::Variable(RabinChunker {
                    data,
                    alg: config.hashing,
                    block_size: config.block_size,
                    min_block_size: config.min_block_size,
                    max_block_size: config.max_block_size,
                    window_pow,
                    offset: 0,
                    current: None,
                })
            }
        })
    }

    /// Advances to the next chunk; `false` ends the iteration.
    pub fn next(&mut self) -> bool {
        match self {
            Chunker::Fixed(c) => c.advance(),
            Chunker::Variable(c) => c.advance(),
        }
    }

    /// The chunk selected by the last successful `next()`.
    pub fn chunk(&self) -> Option<Blob> {
        let (data, alg, span) = match self {
            Chunker::Fixed(c) => (&c.data, c.alg, c.current?),
            Chunker::Variable(c) => (&c.data, c.alg, c.current?),
        };
        Some(Blob::new(data.slice(span.0..span.1), alg))
    }

    /// Restarts the sequence from offset zero.
    pub fn reset(&mut self) {
        match self {
            Chunker::Fixed(c) => {
                c.offset = 0;
                c.current = None;
            }
            Chunker::Variable(c) => {
                c.offset = 0;
                c.current = None;
            }
        }
    }

    /// Target block size for fixed chunking, the upper bound for variable.
    pub fn block_size(&self) -> usize {
        match self {
            Chunker::Fixed(c) => c.block_size,
            Chunker::Variable(c) => c.max_block_size,
        }
    }

    /// Consumes the chunker into an iterator of blobs.
    pub fn blobs(self) -> Blobs {
        Blobs { chunker: self }
    }
}

/// Iterator adapter over a [`Chunker`].
pub struct Blobs {
    chunker: Chunker,
}

impl Iterator for Blobs {
    type Item = Blob;

    fn next(&mut self) -> Option<Blob> {
        if self.chunker.next() {
            self.chunker.chunk()
        } else {
            None
        }
    }
}

/// Emits contiguous `block_size` slices. A tail shorter than
/// `min_block_size` is merged into the previous slice, so the last chunk
/// may grow up to `block_size + min_block_size - 1`.
pub struct FixedChunker {
    data: Bytes,
    alg: HashAlgorithm,
    block_size: usize,
    min_block_size: usize,
    offset: usize,
    current: Option<(usize, usize)>,
}

impl FixedChunker {
    fn advance(&mut self) -> bool {
        if self.offset >= self.data.len() {
            self.current = None;
            return false;
        }
        let mut end = (self.offset + self.block_size).min(self.data.len());
        let tail = self.data.len() - end;
        if tail > 0 && tail < self.min_block_size {
            end = self.data.len();
        }
        self.current = Some((self.offset, end));
        self.offset = end;
        true
    }
}

/// Content-defined chunker: a Rabin-Karp rolling hash over a fixed window
/// emits a cut wherever the hash matches the block mask, never before
/// `min_block_size` and forced at `max_block_size`. Cut decisions depend
/// only on window content, so a prepend of bytes shifts at most one chunk
/// boundary before the sequence realigns.
pub struct RabinChunker {
    data: Bytes,
    alg: HashAlgorithm,
    block_size: usize,
    min_block_size: usize,
    max_block_size: usize,
    /// HASH_PRIME^(WINDOW_SIZE-1), for removing the outgoing byte.
    window_pow: u64,
    offset: usize,
    current: Option<(usize, usize)>,
}

impl RabinChunker {
    fn advance(&mut self) -> bool {
        if self.offset >= self.data.len() {
            self.current = None;
            return false;
        }
        let end = self.cut_point(self.offset);
        self.current = Some((self.offset, end));
        self.offset = end;
        true
    }

    /// Finds the cut for the chunk starting at `start`.
    fn cut_point(&self, start: usize) -> usize {
        let len = self.data.len();
        let max_end = (start + self.max_block_size).min(len);
        let min_end = start + self.min_block_size;
        if min_end >= max_end {
            return max_end;
        }

        let modulus = self.block_size as u64;
        let window_start = min_end.saturating_sub(WINDOW_SIZE);
        let mut hash = 0u64;
        for &byte in &self.data[window_start..min_end] {
            hash = hash.wrapping_mul(HASH_PRIME).wrapping_add(byte as u64);
        }

        let mut pos = min_end;
        loop {
            if hash % modulus == modulus - 1 {
                return pos;
            }
            if pos >= max_end {
                return max_end;
            }
            let incoming = self.data[pos] as u64;
            let outgoing = if pos >= WINDOW_SIZE {
                (self.data[pos - WINDOW_SIZE] as u64).wrapping_mul(self.window_pow)
            } else {
                0
            };
            hash = hash
                .wrapping_sub(outgoing)
                .wrapping_mul(HASH_PRIME)
                .wrapping_add(incoming);
            pos += 1;
        }
    }
}
