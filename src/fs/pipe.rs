//! pipefs: kernel ring buffers behind `pipe()` descriptors.
//!
//! Buffers live in the dedicated pipe region when the VMM is up (the
//! usual case); before that, and on the test host, they fall back to
//! heap storage. Readers block while the ring is empty, writers while
//! it is full; both sleeps are interruptible. A write with no readers
//! left raises SIGPIPE in the caller.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::memory::paging::PteFlags;

pub const PIPE_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
enum Storage {
    Heap(Vec<u8>),
    Region { va: u64 },
}

impl Storage {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Heap(v) => v.as_mut_slice(),
            Storage::Region { va } => unsafe {
                core::slice::from_raw_parts_mut(*va as *mut u8, PIPE_BUFFER_SIZE)
            },
        }
    }
}

#[derive(Debug)]
struct PipeRing {
    storage: Storage,
    read_pos: usize,
    write_pos: usize,
    readers: usize,
    writers: usize,
}

#[derive(Debug)]
pub struct Pipe {
    ring: Mutex<PipeRing>,
}

impl Pipe {
    /// A fresh pipe with one reader and one writer endpoint.
    pub fn new() -> Arc<Pipe> {
        let storage = match crate::memory::try_kernel_space() {
            Some(space) => {
                let mut space = space.lock();
                let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
                match crate::memory::regions::PIPE_REGION.alloc_and_map(
                    PIPE_BUFFER_SIZE as u64,
                    false,
                    PteFlags::WRITABLE,
                    &mut space,
                    &mut *pmm,
                ) {
                    Some((va, _)) => Storage::Region { va },
                    None => Storage::Heap(vec![0; PIPE_BUFFER_SIZE]),
                }
            }
            None => Storage::Heap(vec![0; PIPE_BUFFER_SIZE]),
        };
        Arc::new(Pipe {
            ring: Mutex::new(PipeRing {
                storage,
                read_pos: 0,
                write_pos: 0,
                readers: 1,
                writers: 1,
            }),
        })
    }

    /// Channel keys for sleeping readers / writers.
    pub fn read_channel(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    pub fn write_channel(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize + 1
    }

    pub fn add_reader(&self) {
        self.ring.lock().readers += 1;
    }

    pub fn add_writer(&self) {
        self.ring.lock().writers += 1;
    }

    pub fn drop_reader(&self) {
        let mut ring = self.ring.lock();
        ring.readers = ring.readers.saturating_sub(1);
    }

    pub fn drop_writer(&self) {
        let mut ring = self.ring.lock();
        ring.writers = ring.writers.saturating_sub(1);
    }

    pub fn readers(&self) -> usize {
        self.ring.lock().readers
    }

    pub fn writers(&self) -> usize {
        self.ring.lock().writers
    }

    pub fn is_empty(&self) -> bool {
        let ring = self.ring.lock();
        ring.read_pos == ring.write_pos
    }

    pub fn is_full(&self) -> bool {
        let ring = self.ring.lock();
        (ring.write_pos + 1) % PIPE_BUFFER_SIZE == ring.read_pos
    }

    /// Drain up to `buf.len()` bytes; returns the count (0 when empty).
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut ring = self.ring.lock();
        let mut n = 0;
        while n < buf.len() && ring.read_pos != ring.write_pos {
            let pos = ring.read_pos;
            buf[n] = ring.storage.as_mut_slice()[pos];
            ring.read_pos = (pos + 1) % PIPE_BUFFER_SIZE;
            n += 1;
        }
        n
    }

    /// Stuff up to `buf.len()` bytes; returns the count (0 when full).
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut ring = self.ring.lock();
        let mut n = 0;
        loop {
            let next = (ring.write_pos + 1) % PIPE_BUFFER_SIZE;
            if n >= buf.len() || next == ring.read_pos {
                break;
            }
            let pos = ring.write_pos;
            ring.storage.as_mut_slice()[pos] = buf[n];
            ring.write_pos = next;
            n += 1;
        }
        n
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let ring = self.ring.get_mut();
        if let Storage::Region { va } = ring.storage {
            if let Some(space) = crate::memory::try_kernel_space() {
                let mut space = space.lock();
                let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
                crate::memory::regions::PIPE_REGION.unmap_and_free(
                    va,
                    PIPE_BUFFER_SIZE as u64,
                    &mut space,
                    &mut *pmm,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_roundtrip() {
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"hello"), 5);
        let mut buf = [0u8; 3];
        assert_eq!(pipe.read(&mut buf), 3);
        assert_eq!(&buf, b"hel");
        let mut rest = [0u8; 8];
        assert_eq!(pipe.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"lo");
        assert!(pipe.is_empty());
    }

    #[test]
    fn ring_capacity_is_one_less_than_size() {
        let pipe = Pipe::new();
        let big = vec![7u8; PIPE_BUFFER_SIZE * 2];
        let written = pipe.write(&big);
        assert_eq!(written, PIPE_BUFFER_SIZE - 1);
        assert!(pipe.is_full());

        // Draining frees space for more.
        let mut buf = [0u8; 100];
        assert_eq!(pipe.read(&mut buf), 100);
        assert_eq!(pipe.write(&big), 100);
    }

    #[test]
    fn endpoint_counts_signal_eof_and_epipe() {
        let pipe = Pipe::new();
        assert_eq!(pipe.readers(), 1);
        assert_eq!(pipe.writers(), 1);
        pipe.drop_writer();
        // No writers + empty ring = EOF for readers.
        assert_eq!(pipe.writers(), 0);
        assert!(pipe.is_empty());
        pipe.drop_reader();
        // No readers = SIGPIPE for writers.
        assert_eq!(pipe.readers(), 0);
    }

    #[test]
    fn wraparound_preserves_bytes() {
        let pipe = Pipe::new();
        let chunk = vec![1u8; PIPE_BUFFER_SIZE - 10];
        pipe.write(&chunk);
        let mut sink = vec![0u8; chunk.len()];
        pipe.read(&mut sink);

        // Now positioned near the end; this write wraps.
        let data: Vec<u8> = (0..64u8).collect();
        assert_eq!(pipe.write(&data), 64);
        let mut out = [0u8; 64];
        assert_eq!(pipe.read(&mut out), 64);
        assert_eq!(&out[..], &data[..]);
    }
}
