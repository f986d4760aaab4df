use bit_field::BitField;
use x86_64::PhysAddr;

use super::PAGE_SIZE;

/// Ceiling of physical memory managed by the bitmap. Frames above this
/// (if any) are left to MMIO mappings.
pub const MAX_PHYS_MEM: u64 = 1 << 30;
pub const MAX_FRAMES: usize = (MAX_PHYS_MEM / PAGE_SIZE) as usize;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Bitmap allocator over installed RAM plus the per-frame share counters
/// used by copy-on-write.
///
/// Invariant: a frame with `shares[f] == 0` is free or was never handed
/// out; the sum of all share counters equals the number of live mapped
/// references to RAM frames.
pub struct FrameAllocator {
    /// One bit per frame; set = in use (or not RAM).
    bitmap: [u64; BITMAP_WORDS],
    /// Mapped-reference counter per frame.
    shares: [u8; MAX_FRAMES],
    /// Highest usable frame index + 1.
    limit: usize,
    /// Next-fit scan position.
    cursor: usize,
    used: usize,
}

impl FrameAllocator {
    /// All frames start reserved; `init` opens up the RAM ranges.
    pub const fn new() -> Self {
        FrameAllocator {
            bitmap: [!0u64; BITMAP_WORDS],
            shares: [0; MAX_FRAMES],
            limit: 0,
            cursor: 0,
            used: 0,
        }
    }

    /// Mark the given RAM ranges free, keeping everything below
    /// `reserved_end` (kernel image, MBI, low memory) allocated.
    pub fn init(&mut self, ram: &[crate::boot::RamRange], reserved_end: u64) {
        for range in ram {
            let first = (range.start + PAGE_SIZE - 1) / PAGE_SIZE;
            let last = range.end / PAGE_SIZE;
            for frame in first..last {
                if frame as usize >= MAX_FRAMES {
                    break;
                }
                if (frame * PAGE_SIZE) < reserved_end {
                    continue;
                }
                self.set_used(frame as usize, false);
                if frame as usize >= self.limit {
                    self.limit = frame as usize + 1;
                }
            }
        }
        self.cursor = 0;
    }

    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64].get_bit(frame % 64)
    }

    fn set_used(&mut self, frame: usize, used: bool) {
        self.bitmap[frame / 64].set_bit(frame % 64, used);
    }

    /// Allocate a single frame. Returns `None` on exhaustion; callers
    /// must handle it.
    pub fn alloc_block(&mut self) -> Option<PhysAddr> {
        self.alloc_blocks(1)
    }

    /// Allocate `count` physically contiguous frames (single run).
    pub fn alloc_blocks(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || self.limit == 0 {
            return None;
        }

        // Next-fit from the cursor, then once more from the start.
        let found = self
            .scan_run(self.cursor, self.limit, count)
            .or_else(|| self.scan_run(0, self.cursor, count))?;

        for frame in found..found + count {
            self.set_used(frame, true);
            self.shares[frame] = 1;
        }
        self.cursor = found + count;
        self.used += count;
        Some(PhysAddr::new(found as u64 * PAGE_SIZE))
    }

    fn scan_run(&self, from: usize, to: usize, count: usize) -> Option<usize> {
        let mut run = 0usize;
        for frame in from..to {
            if self.is_used(frame) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(frame + 1 - count);
                }
            }
        }
        None
    }

    pub fn free_block(&mut self, addr: PhysAddr) {
        self.free_blocks(addr, 1);
    }

    pub fn free_blocks(&mut self, addr: PhysAddr, count: usize) {
        let first = (addr.as_u64() / PAGE_SIZE) as usize;
        for frame in first..first + count {
            if frame >= MAX_FRAMES || !self.is_used(frame) {
                continue;
            }
            self.set_used(frame, false);
            self.shares[frame] = 0;
            self.used -= 1;
        }
    }

    /// One more mapping now references `addr`.
    pub fn inc_frame_shares(&mut self, addr: PhysAddr) {
        let frame = (addr.as_u64() / PAGE_SIZE) as usize;
        if frame < MAX_FRAMES {
            self.shares[frame] = self.shares[frame].saturating_add(1);
        }
    }

    /// A mapping of `addr` went away. Returns the previous share count;
    /// when it was 1 the frame is also freed.
    pub fn dec_frame_shares(&mut self, addr: PhysAddr) -> u8 {
        let frame = (addr.as_u64() / PAGE_SIZE) as usize;
        if frame >= MAX_FRAMES {
            return 0;
        }
        let old = self.shares[frame];
        match old {
            0 => 0,
            1 => {
                self.free_blocks(addr, 1);
                1
            }
            n => {
                self.shares[frame] = n - 1;
                n
            }
        }
    }

    pub fn frame_shares(&self, addr: PhysAddr) -> u8 {
        let frame = (addr.as_u64() / PAGE_SIZE) as usize;
        if frame < MAX_FRAMES {
            self.shares[frame]
        } else {
            0
        }
    }

    pub fn used_frames(&self) -> usize {
        self.used
    }

    pub fn free_frames(&self) -> usize {
        let mut free = 0;
        for frame in 0..self.limit {
            if !self.is_used(frame) {
                free += 1;
            }
        }
        free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::RamRange;

    fn allocator_with_ram(frames: u64) -> Box<FrameAllocator> {
        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(
            &[RamRange {
                start: 0,
                end: frames * PAGE_SIZE,
            }],
            0,
        );
        pmm
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut pmm = allocator_with_ram(64);
        let a = pmm.alloc_block().unwrap();
        let b = pmm.alloc_block().unwrap();
        assert_ne!(a, b);
        assert_eq!(pmm.used_frames(), 2);
        pmm.free_block(a);
        pmm.free_block(b);
        assert_eq!(pmm.used_frames(), 0);
    }

    #[test]
    fn contiguous_run_is_contiguous() {
        let mut pmm = allocator_with_ram(64);
        let run = pmm.alloc_blocks(4).unwrap();
        // All four frames belong to one run.
        for i in 0..4u64 {
            assert_eq!(pmm.frame_shares(run + i * PAGE_SIZE), 1);
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pmm = allocator_with_ram(4);
        for _ in 0..4 {
            assert!(pmm.alloc_block().is_some());
        }
        assert!(pmm.alloc_block().is_none());
    }

    #[test]
    fn contiguous_skips_fragmented_gaps() {
        let mut pmm = allocator_with_ram(8);
        let a = pmm.alloc_block().unwrap();
        let _b = pmm.alloc_block().unwrap();
        pmm.free_block(a);
        // One-frame hole at the front; the 4-run must come from the tail.
        let run = pmm.alloc_blocks(4).unwrap();
        assert!(run.as_u64() >= 2 * PAGE_SIZE);
    }

    #[test]
    fn shares_gate_the_free() {
        let mut pmm = allocator_with_ram(16);
        let frame = pmm.alloc_block().unwrap();
        pmm.inc_frame_shares(frame); // now 2
        assert_eq!(pmm.dec_frame_shares(frame), 2);
        assert_eq!(pmm.used_frames(), 1); // still allocated
        assert_eq!(pmm.dec_frame_shares(frame), 1);
        assert_eq!(pmm.used_frames(), 0); // last reference freed it
    }

    #[test]
    fn reserved_prefix_is_not_handed_out() {
        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(
            &[RamRange {
                start: 0,
                end: 16 * PAGE_SIZE,
            }],
            4 * PAGE_SIZE,
        );
        let first = pmm.alloc_block().unwrap();
        assert!(first.as_u64() >= 4 * PAGE_SIZE);
    }
}
