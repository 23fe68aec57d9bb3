// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Owned part payloads and the growable buffer that accumulates them

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

/// A cheaply cloneable, ordered collection of [`Bytes`] forming one part
#[derive(Debug, Clone, Default)]
pub struct PartPayload(Arc<[Bytes]>);

impl PartPayload {
    /// Total number of bytes in this payload
    pub fn content_length(&self) -> u64 {
        self.0.iter().map(|b| b.len() as u64).sum()
    }

    /// Whether the payload holds no bytes
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| b.is_empty())
    }

    /// Iterate the payload's chunks
    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }
}

impl From<Bytes> for PartPayload {
    fn from(value: Bytes) -> Self {
        Self(Arc::new([value]))
    }
}

impl From<Vec<u8>> for PartPayload {
    fn from(value: Vec<u8>) -> Self {
        Bytes::from(value).into()
    }
}

impl<'a> IntoIterator for &'a PartPayload {
    type Item = &'a Bytes;
    type IntoIter = std::slice::Iter<'a, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Accumulates produced bytes into chunks until a part boundary is crossed
///
/// Bytes are copied once into fixed-capacity chunks; [`freeze`](Self::freeze)
/// hands the chunks to a [`PartPayload`] without further copying, so a
/// frozen part can be retried or inspected cheaply.
#[derive(Debug)]
pub struct PartBuffer {
    len: u64,
    completed: Vec<Bytes>,
    in_progress: Vec<u8>,
    chunk_size: usize,
}

impl Default for PartBuffer {
    fn default() -> Self {
        Self::with_chunk_size(64 * 1024)
    }
}

impl PartBuffer {
    /// Create a buffer allocating in `chunk_size` increments
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            len: 0,
            completed: vec![],
            in_progress: vec![],
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of bytes buffered so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `data`, copying it into the current chunk
    pub fn extend_from_slice(&mut self, mut data: &[u8]) {
        self.len += data.len() as u64;
        while !data.is_empty() {
            if self.in_progress.capacity() == self.in_progress.len() {
                let full = std::mem::replace(
                    &mut self.in_progress,
                    Vec::with_capacity(self.chunk_size.max(data.len())),
                );
                if !full.is_empty() {
                    self.completed.push(full.into());
                }
            }
            let room = self.in_progress.capacity() - self.in_progress.len();
            let taken = room.min(data.len());
            self.in_progress.extend_from_slice(&data[..taken]);
            data = &data[taken..];
        }
    }

    /// Append an owned chunk without copying
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len() as u64;
        if !self.in_progress.is_empty() {
            let partial = std::mem::take(&mut self.in_progress);
            self.completed.push(partial.into());
        }
        self.completed.push(data);
    }

    /// Take the buffered bytes as an immutable payload, leaving the
    /// buffer empty
    pub fn freeze(&mut self) -> PartPayload {
        let mut chunks = std::mem::take(&mut self.completed);
        let tail = std::mem::take(&mut self.in_progress);
        if !tail.is_empty() {
            chunks.push(tail.into());
        }
        self.len = 0;
        PartPayload(chunks.into())
    }

    /// Take exactly the first `count` buffered bytes as a payload
    ///
    /// # Panics
    ///
    /// If fewer than `count` bytes are buffered.
    pub fn split_to(&mut self, count: u64) -> PartPayload {
        assert!(count <= self.len, "buffer holds {} of {count} bytes", self.len);

        let mut chunks: VecDeque<Bytes> = std::mem::take(&mut self.completed).into();
        let tail = std::mem::take(&mut self.in_progress);
        if !tail.is_empty() {
            chunks.push_back(tail.into());
        }

        let mut taken = Vec::new();
        let mut remaining = count as usize;
        while remaining > 0 {
            let mut chunk = chunks.pop_front().expect("buffer holds enough bytes");
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                taken.push(chunk);
            } else {
                taken.push(chunk.split_to(remaining));
                remaining = 0;
                chunks.push_front(chunk);
            }
        }

        self.completed = chunks.into_iter().collect();
        self.len -= count;
        PartPayload(taken.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_accumulates_across_chunks() {
        let mut buffer = PartBuffer::with_chunk_size(4);
        buffer.extend_from_slice(b"hello");
        buffer.extend_from_slice(b" ");
        buffer.push(Bytes::from_static(b"world"));
        assert_eq!(buffer.len(), 11);

        let payload = buffer.freeze();
        assert!(buffer.is_empty());
        assert_eq!(payload.content_length(), 11);

        let flat: Vec<u8> = payload.iter().flatten().copied().collect();
        assert_eq!(flat, b"hello world");
    }

    #[test]
    fn freeze_empty_buffer() {
        let mut buffer = PartBuffer::default();
        let payload = buffer.freeze();
        assert!(payload.is_empty());
        assert_eq!(payload.content_length(), 0);
    }

    #[test]
    fn split_takes_exact_prefix() {
        let mut buffer = PartBuffer::with_chunk_size(4);
        let data: Vec<u8> = (0..30u8).collect();
        buffer.extend_from_slice(&data);

        let first: Vec<u8> = buffer.split_to(11).iter().flatten().copied().collect();
        assert_eq!(first, data[..11]);
        assert_eq!(buffer.len(), 19);

        let second: Vec<u8> = buffer.split_to(19).iter().flatten().copied().collect();
        assert_eq!(second, data[11..]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn large_write_exceeding_chunk() {
        let mut buffer = PartBuffer::with_chunk_size(8);
        let data: Vec<u8> = (0..100u8).collect();
        buffer.extend_from_slice(&data);
        let flat: Vec<u8> = buffer.freeze().iter().flatten().copied().collect();
        assert_eq!(flat, data);
    }
}
