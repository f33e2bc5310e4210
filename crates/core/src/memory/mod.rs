// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

/// A contiguous run of firmware bytes destined for one flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexChunk {
    pub base: u64,
    pub data: Vec<u8>,
}

impl HexChunk {
    pub fn new(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address covered by this chunk.
    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

/// Ordered chunks of one firmware file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    /// Start address record, if the file carried one.
    pub entry_point: Option<u32>,
    pub chunks: Vec<HexChunk>,
}

impl ProgramImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` at `addr`, extending the last chunk when the bytes
    /// follow on directly and opening a new chunk otherwise.
    pub fn append(&mut self, addr: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.chunks.last_mut() {
            Some(last) if last.end() == addr => last.data.extend_from_slice(data),
            _ => self.chunks.push(HexChunk::new(addr, data.to_vec())),
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(HexChunk::len).sum()
    }
}
