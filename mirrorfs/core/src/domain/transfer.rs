// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Differential Transfer Protocol - pure state
//!
//! A download is hash-gated: the receiver sends the digest of its local copy,
//! and the sender streams nothing when its own digest matches. Otherwise the
//! file body travels as offset-addressed [`Chunk`]s of [`BLOCK_SIZE`] bytes,
//! each stamped with the total size of the file at the time the transfer began.
//!
//! [`ChunkAssembler`] tracks the receiver side and enforces the completion
//! rule: the bytes received across all chunks must equal the first announced
//! `total_size`, otherwise the transfer fails with `SizeMismatch`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Protocol rules shared by the sending and receiving sides

use super::error::FsError;

/// Fixed chunk payload size.
pub const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub offset: u64,
    pub total_size: u64,
}

/// Offsets and lengths the sender reads for a file of `total_size` bytes.
///
/// An empty file still yields a single zero-length chunk so that a receiver
/// with stale content learns it must truncate.
pub fn chunk_plan(total_size: u64) -> impl Iterator<Item = (u64, usize)> {
    let block = BLOCK_SIZE as u64;
    let count = if total_size == 0 {
        1
    } else {
        total_size.div_ceil(block)
    };
    (0..count).map(move |i| {
        let offset = i * block;
        let len = total_size.saturating_sub(offset).min(block) as usize;
        (offset, len)
    })
}

/// Outcome of a completed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Hashes matched; the local copy was left untouched.
    NoChange,
    /// The local copy was rewritten to `total_size` bytes.
    Updated { total_size: u64 },
}

/// Receiver-side bookkeeping for one download.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    expected: Option<u64>,
    received: u64,
    chunks: u64,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for `chunk` and return the offset it must be written at.
    ///
    /// A chunk extending past the first announced total size is rejected
    /// immediately instead of being written.
    pub fn accept(&mut self, chunk: &Chunk) -> Result<u64, FsError> {
        let expected = *self.expected.get_or_insert(chunk.total_size);
        let len = chunk.data.len() as u64;

        if chunk.offset.saturating_add(len) > expected {
            return Err(FsError::SizeMismatch {
                expected,
                received: self.received.saturating_add(len),
            });
        }

        self.received += len;
        self.chunks += 1;
        Ok(chunk.offset)
    }

    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Close the transfer. Zero chunks means the sender reported no change.
    pub fn finish(self) -> Result<TransferOutcome, FsError> {
        match self.expected {
            None => Ok(TransferOutcome::NoChange),
            Some(expected) if expected == self.received => {
                Ok(TransferOutcome::Updated { total_size: expected })
            }
            Some(expected) => Err(FsError::SizeMismatch {
                expected,
                received: self.received,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, len: usize, total_size: u64) -> Chunk {
        Chunk {
            data: vec![7; len],
            offset,
            total_size,
        }
    }

    #[test]
    fn test_plan_covers_file_exactly() {
        let total = (BLOCK_SIZE * 2 + 10) as u64;
        let plan: Vec<_> = chunk_plan(total).collect();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2], ((BLOCK_SIZE * 2) as u64, 10));
        let sum: usize = plan.iter().map(|(_, len)| len).sum();
        assert_eq!(sum as u64, total);
    }

    #[test]
    fn test_plan_for_empty_file_has_one_empty_chunk() {
        let plan: Vec<_> = chunk_plan(0).collect();
        assert_eq!(plan, vec![(0, 0)]);
    }

    #[test]
    fn test_zero_chunks_is_no_change() {
        assert_eq!(ChunkAssembler::new().finish().unwrap(), TransferOutcome::NoChange);
    }

    #[test]
    fn test_complete_transfer() {
        let mut assembler = ChunkAssembler::new();
        assembler.accept(&chunk(0, 4, 6)).unwrap();
        assembler.accept(&chunk(4, 2, 6)).unwrap();
        assert_eq!(
            assembler.finish().unwrap(),
            TransferOutcome::Updated { total_size: 6 }
        );
    }

    #[test]
    fn test_short_transfer_is_size_mismatch() {
        let mut assembler = ChunkAssembler::new();
        assembler.accept(&chunk(0, 4, 6)).unwrap();
        assert!(matches!(
            assembler.finish(),
            Err(FsError::SizeMismatch { expected: 6, received: 4 })
        ));
    }

    #[test]
    fn test_overlong_chunk_is_rejected() {
        let mut assembler = ChunkAssembler::new();
        assembler.accept(&chunk(0, 4, 6)).unwrap();
        assert!(matches!(
            assembler.accept(&chunk(4, 4, 6)),
            Err(FsError::SizeMismatch { expected: 6, .. })
        ));
    }

    #[test]
    fn test_later_total_size_is_ignored() {
        let mut assembler = ChunkAssembler::new();
        assembler.accept(&chunk(0, 2, 4)).unwrap();
        assembler.accept(&chunk(2, 2, 99)).unwrap();
        assert_eq!(assembler.expected(), Some(4));
        assert!(assembler.finish().is_ok());
    }
}
