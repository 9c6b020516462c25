//! Bounded output queue for one connection.
//!
//! # Design Decisions
//! - Copied bytes count against `capacity`; adopted chunks do not, they are
//!   slices of another connection's input and already accounted there
//! - Adopted chunks are tracked separately so a proxy segment only completes
//!   once its borrowed bytes have reached the socket

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug)]
enum Chunk {
    Copied(BytesMut),
    Adopted(Bytes),
}

impl Chunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Copied(b) => b,
            Chunk::Adopted(b) => b,
        }
    }
}

#[derive(Debug)]
pub struct OutBuffer {
    chunks: VecDeque<Chunk>,
    capacity: usize,
    copied: usize,
    adopted: usize,
    adoptable: bool,
}

impl OutBuffer {
    /// `adoptable` enables zero-copy relaying into this buffer.
    pub fn new(capacity: usize, adoptable: bool) -> Self {
        Self {
            chunks: VecDeque::new(),
            capacity,
            copied: 0,
            adopted: 0,
            adoptable,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left for copied bytes.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.copied)
    }

    /// Bytes waiting to be written, copied and adopted.
    pub fn used(&self) -> usize {
        self.copied + self.adopted
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_adoptable(&self) -> bool {
        self.adoptable
    }

    /// Adopted bytes not yet written.
    pub fn adopted_in_flight(&self) -> usize {
        self.adopted
    }

    /// Copy as much of `data` as fits; the stored prefix is removed from `data`.
    pub fn store(&mut self, data: &mut Bytes) -> usize {
        let n = data.len().min(self.free());
        if n > 0 {
            self.push_copy(&data[..n]);
            data.advance(n);
        }
        n
    }

    /// Copy up to `max` bytes from the front of `src`.
    pub fn copy_from(&mut self, src: &mut BytesMut, max: usize) -> usize {
        let n = src.len().min(max).min(self.free());
        if n > 0 {
            self.push_copy(&src[..n]);
            src.advance(n);
        }
        n
    }

    /// Queue a chunk by reference.
    pub fn adopt(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.adopted += chunk.len();
        self.chunks.push_back(Chunk::Adopted(chunk));
    }

    /// The next contiguous bytes to write.
    pub fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(Chunk::as_slice)
    }

    /// Mark `n` bytes from the front as written.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                return;
            };
            let (len, step) = match front {
                Chunk::Copied(b) => {
                    let step = n.min(b.len());
                    b.advance(step);
                    self.copied -= step;
                    (b.len(), step)
                }
                Chunk::Adopted(b) => {
                    let step = n.min(b.len());
                    b.advance(step);
                    self.adopted -= step;
                    (b.len(), step)
                }
            };
            if len == 0 {
                self.chunks.pop_front();
            }
            n -= step;
        }
    }

    fn push_copy(&mut self, data: &[u8]) {
        self.copied += data.len();
        if let Some(Chunk::Copied(last)) = self.chunks.back_mut() {
            last.extend_from_slice(data);
        } else {
            self.chunks.push_back(Chunk::Copied(BytesMut::from(data)));
        }
    }
}
