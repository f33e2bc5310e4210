// BoardLink - Emulated Board Host Bridge
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Fixed-capacity single-producer/single-consumer byte ring.
//!
//! Cursors run freely and wrap on `usize` overflow; the slot index is the
//! cursor masked by `capacity - 1`. Fill level is `write - read`, so a ring
//! of capacity N holds exactly N bytes when full.

use crate::{BoardError, BoardResult};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct ByteRing {
    slots: Box<[UnsafeCell<u8>]>,
    mask: usize,
    read: AtomicUsize,
    write: AtomicUsize,
}

// Slots are only written by the producer at `write` and only read by the
// consumer at `read`; the cursors publish them with release/acquire.
unsafe impl Sync for ByteRing {}

impl ByteRing {
    pub fn new(capacity: usize) -> BoardResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(BoardError::Config(format!(
                "ring capacity must be a non-zero power of two, got {}",
                capacity
            )));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            mask: capacity - 1,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        })
    }

    /// Splits the ring into its only producer and its only consumer.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let ring = Arc::new(self);
        (
            RingProducer { ring: ring.clone() },
            RingConsumer { ring },
        )
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        // Read first: a later `write` can only be ahead of it, never behind.
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

impl fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Write half of a [`ByteRing`].
#[derive(Debug)]
pub struct RingProducer {
    ring: Arc<ByteRing>,
}

impl RingProducer {
    /// Appends `byte`. A full ring refuses the write and returns `false`;
    /// queued bytes are never overwritten.
    pub fn write(&mut self, byte: u8) -> bool {
        let ring = &*self.ring;
        let write = ring.write.load(Ordering::Relaxed);
        let read = ring.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) == ring.capacity() {
            return false;
        }
        unsafe {
            *ring.slots[write & ring.mask].get() = byte;
        }
        ring.write.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

/// Read half of a [`ByteRing`].
#[derive(Debug)]
pub struct RingConsumer {
    ring: Arc<ByteRing>,
}

impl RingConsumer {
    pub fn read(&mut self) -> Option<u8> {
        let ring = &*self.ring;
        let read = ring.read.load(Ordering::Relaxed);
        let write = ring.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let byte = unsafe { *ring.slots[read & ring.mask].get() };
        ring.read.store(read.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Moves up to `buf.len()` queued bytes into `buf` and returns the count.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.read() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Drops every queued byte and returns how many were discarded.
    pub fn discard_all(&mut self) -> usize {
        let mut n = 0;
        while self.read().is_some() {
            n += 1;
        }
        n
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_four_scenario() {
        let (mut tx, mut rx) = ByteRing::new(4).unwrap().split();
        assert!(rx.is_empty());

        for b in 1..=4 {
            assert!(tx.write(b));
        }
        assert!(tx.is_full());
        assert!(rx.is_full());

        let got: Vec<u8> = (0..4).map(|_| rx.read().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
        assert!(rx.is_empty());
        assert_eq!(rx.read(), None);
    }

    #[test]
    fn test_full_ring_refuses_without_overwrite() {
        let (mut tx, mut rx) = ByteRing::new(2).unwrap().split();
        assert!(tx.write(0xAA));
        assert!(tx.write(0xBB));
        assert!(!tx.write(0xCC));
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.read(), Some(0xAA));
        assert_eq!(rx.read(), Some(0xBB));
        assert_eq!(rx.read(), None);
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let (mut tx, mut rx) = ByteRing::new(8).unwrap().split();
        let mut expected = Vec::new();
        let mut got = Vec::new();
        let mut next = 0u8;

        // Uneven write/read batches walk the cursors around the ring many times.
        for round in 0..200 {
            for _ in 0..(round % 7) + 1 {
                if tx.write(next) {
                    expected.push(next);
                    next = next.wrapping_add(1);
                }
            }
            for _ in 0..(round % 5) + 1 {
                if let Some(b) = rx.read() {
                    got.push(b);
                }
            }
            assert!(rx.len() <= rx.capacity());
        }
        while let Some(b) = rx.read() {
            got.push(b);
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_read_into_and_discard() {
        let (mut tx, mut rx) = ByteRing::new(16).unwrap().split();
        for b in b"bridge" {
            assert!(tx.write(*b));
        }

        let mut buf = [0u8; 4];
        assert_eq!(rx.read_into(&mut buf), 4);
        assert_eq!(&buf, b"brid");
        assert_eq!(rx.discard_all(), 2);
        assert!(tx.is_empty());
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(ByteRing::new(0).is_err());
        assert!(ByteRing::new(12).is_err());
        assert_eq!(ByteRing::new(1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_cross_thread_transfer_keeps_order() {
        let (mut tx, mut rx) = ByteRing::new(64).unwrap().split();
        const TOTAL: usize = 100_000;

        let producer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < TOTAL {
                if tx.write((sent % 251) as u8) {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0;
        while received < TOTAL {
            match rx.read() {
                Some(b) => {
                    assert_eq!(b, (received % 251) as u8);
                    received += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }
}
