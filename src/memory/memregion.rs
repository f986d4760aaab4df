//! Per-task memory regions (VMAs) and the fork-time address-space clone.

use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::PhysAddr;

use crate::errno::{Errno, KResult};

use super::paging::{AddressSpace, FrameProvider, PteFlags};
use super::PAGE_SIZE;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const PRIVATE = 1 << 0;
        const SHARED = 1 << 1;
        const USER = 1 << 2;
        const KERNEL = 1 << 3;
        /// Pages appear on first touch instead of at map time.
        const DEMAND = 1 << 4;
        /// Stack-style region: faults just below `start` extend it.
        const GROWS_DOWN = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Text,
    Data,
    Stack,
    Shmem,
    Kernel,
}

/// Content source for file-backed regions. The VFS node type implements
/// this; tests substitute fixed buffers.
pub trait BackingStore: Send + Sync {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> KResult<usize>;
}

/// One mapped range of a task's address space. `[start, end)` is
/// page-aligned.
#[derive(Clone)]
pub struct MemRegion {
    pub start: u64,
    pub end: u64,
    pub prot: Prot,
    pub flags: RegionFlags,
    pub rtype: RegionType,
    pub backing: Option<Arc<dyn BackingStore>>,
    pub file_off: u64,
    pub refs: usize,
}

impl MemRegion {
    pub fn anon(start: u64, end: u64, prot: Prot, flags: RegionFlags, rtype: RegionType) -> Self {
        MemRegion {
            start,
            end,
            prot,
            flags,
            rtype,
            backing: None,
            file_off: 0,
            refs: 1,
        }
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.start && va < self.end
    }

    pub fn pages(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Leaf PTE flags this region's pages are mapped with.
    pub fn pte_flags(&self) -> PteFlags {
        let mut f = PteFlags::PRESENT;
        if self.prot.contains(Prot::WRITE) {
            f |= PteFlags::WRITABLE;
        }
        if self.flags.contains(RegionFlags::USER) {
            f |= PteFlags::USER;
        }
        f
    }
}

/// A task's memory map: the ordered VMA list plus the heap extents.
/// Shared between the threads of a task group behind one mutex.
pub struct TaskMem {
    pub regions: Vec<MemRegion>,
    pub heap_start: u64,
    pub heap_end: u64,
}

impl TaskMem {
    pub fn new() -> Self {
        TaskMem {
            regions: Vec::new(),
            heap_start: 0,
            heap_end: 0,
        }
    }

    /// Insert keeping the list sorted by start. Overlap is an error.
    pub fn insert(&mut self, region: MemRegion) -> KResult<()> {
        if region.start >= region.end
            || region.start % PAGE_SIZE != 0
            || region.end % PAGE_SIZE != 0
        {
            return Err(Errno::EINVAL);
        }
        let pos = self
            .regions
            .iter()
            .position(|r| r.start >= region.end)
            .unwrap_or(self.regions.len());
        if pos > 0 {
            if self.regions[pos - 1].end > region.start {
                return Err(Errno::EINVAL);
            }
        }
        self.regions.insert(pos, region);
        Ok(())
    }

    pub fn region_containing(&self, va: u64) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(va))
    }

    pub fn region_containing_mut(&mut self, va: u64) -> Option<&mut MemRegion> {
        self.regions.iter_mut().find(|r| r.contains(va))
    }

    /// Kernel-chosen placement for an `mmap(NULL, ...)`.
    pub fn find_free_range(&self, len: u64, floor: u64, ceiling: u64) -> Option<u64> {
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut candidate = floor;
        for r in &self.regions {
            if r.end <= candidate {
                continue;
            }
            if r.start >= candidate + len {
                break;
            }
            candidate = r.end;
        }
        if candidate + len <= ceiling {
            Some(candidate)
        } else {
            None
        }
    }

    /// Drop every user region record. The pages must already have been
    /// released via `free_user_pages`.
    pub fn clear_user(&mut self) {
        self.regions.retain(|r| r.flags.contains(RegionFlags::KERNEL));
        self.heap_start = 0;
        self.heap_end = 0;
    }
}

/// Clone `parent_space` into `child_space` for fork.
///
/// Kernel regions are shared by construction (the kernel half of the
/// tree is common). For user pages, private mappings and writable
/// mappings under `cow` are downgraded to read-only + CoW on *both*
/// sides and the frame share count is bumped; shared mappings alias the
/// frame directly.
///
/// After this returns, every writable private page is either uniquely
/// owned (`share == 1`) or CoW-marked in all mappings.
pub fn clone_address_space(
    mem: &TaskMem,
    parent_space: &mut AddressSpace,
    child_space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
    cow: bool,
) -> Option<TaskMem> {
    child_space.copy_kernel_half_from(parent_space);

    for region in &mem.regions {
        if region.flags.contains(RegionFlags::KERNEL) {
            continue;
        }
        let shared = region.flags.contains(RegionFlags::SHARED);
        let private = region.flags.contains(RegionFlags::PRIVATE);

        // Collect the present pages first; the parent walk and the child
        // mapping both need the provider.
        let mut present: Vec<(u64, PhysAddr, PteFlags)> = Vec::new();
        parent_space.for_each_present(region.start, region.end, frames, |va, e| {
            present.push((va, e.frame(), e.flags()));
        });

        for (va, phys, flags) in present {
            let mark_cow = !shared && (private || (flags.contains(PteFlags::WRITABLE) && cow));
            let child_flags = if mark_cow {
                let downgraded = (flags | PteFlags::COW) - PteFlags::WRITABLE;
                // Downgrade the parent too, then drop its stale TLB entry
                // everywhere the mapping may be live.
                if let Some(e) = parent_space.entry(va, false, frames) {
                    if e.flags() != downgraded {
                        e.set_flags(downgraded);
                        super::paging::flush_tlb_entry(va);
                        super::tlb_shootdown(va);
                    }
                }
                downgraded
            } else {
                flags
            };
            child_space.map_page(va, phys, child_flags, frames)?;
            frames.inc_share(phys);
        }
    }

    let mut child = TaskMem::new();
    child.regions = mem.regions.clone();
    child.heap_start = mem.heap_start;
    child.heap_end = mem.heap_end;
    Some(child)
}

/// Release every user page of `mem` from `space`: drop frame references
/// (the last one frees the frame), clear the PTEs and flush. Leaf-table
/// frames are freed separately by `free_user_tables`.
pub fn free_user_pages(mem: &mut TaskMem, space: &mut AddressSpace, frames: &mut dyn FrameProvider) {
    for region in &mem.regions {
        if region.flags.contains(RegionFlags::KERNEL) {
            continue;
        }
        let mut present: Vec<u64> = Vec::new();
        space.for_each_present(region.start, region.end, frames, |va, _| present.push(va));
        for va in present {
            if let Some(old) = space.unmap_page(va, frames) {
                frames.dec_share(old.frame());
                super::tlb_shootdown(va);
            }
        }
    }
    mem.clear_user();
}

#[cfg(test)]
mod tests {
    use super::super::paging::test_support::TestFrames;
    use super::*;

    fn user_region(start: u64, pages: u64) -> MemRegion {
        MemRegion::anon(
            start,
            start + pages * PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            RegionFlags::PRIVATE | RegionFlags::USER,
            RegionType::Data,
        )
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        let mut mem = TaskMem::new();
        mem.insert(user_region(0x40_0000, 2)).unwrap();
        mem.insert(user_region(0x10_0000, 1)).unwrap();
        mem.insert(user_region(0x80_0000, 4)).unwrap();
        let starts: Vec<u64> = mem.regions.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0x10_0000, 0x40_0000, 0x80_0000]);

        // Overlapping insert is rejected.
        assert_eq!(
            mem.insert(user_region(0x40_1000, 1)),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn unaligned_region_rejected() {
        let mut mem = TaskMem::new();
        let mut r = user_region(0x40_0000, 1);
        r.end += 7;
        assert_eq!(mem.insert(r), Err(Errno::EINVAL));
    }

    #[test]
    fn find_free_range_respects_existing() {
        let mut mem = TaskMem::new();
        mem.insert(user_region(0x40_0000, 1)).unwrap();
        let got = mem
            .find_free_range(PAGE_SIZE, 0x40_0000, 0x7fff_0000)
            .unwrap();
        assert_eq!(got, 0x40_1000);
    }

    #[test]
    fn fork_marks_both_sides_cow() {
        let mut frames = TestFrames::new();
        let mut parent = AddressSpace::new(&mut frames).unwrap();
        let mut child = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        mem.insert(user_region(va, 1)).unwrap();

        let (phys, _) = frames.alloc_frames(1).unwrap();
        parent
            .map_page(va, phys, PteFlags::WRITABLE | PteFlags::USER, &mut frames)
            .unwrap();

        clone_address_space(&mem, &mut parent, &mut child, &mut frames, true).unwrap();

        let pe = *parent.entry(va, false, &mut frames).unwrap();
        let ce = *child.entry(va, false, &mut frames).unwrap();
        assert!(pe.flags().contains(PteFlags::COW));
        assert!(!pe.flags().contains(PteFlags::WRITABLE));
        assert!(ce.flags().contains(PteFlags::COW));
        assert!(!ce.flags().contains(PteFlags::WRITABLE));
        assert_eq!(pe.frame(), ce.frame());
        assert_eq!(frames.share_count(phys), 2);
    }

    #[test]
    fn shared_regions_alias_without_cow() {
        let mut frames = TestFrames::new();
        let mut parent = AddressSpace::new(&mut frames).unwrap();
        let mut child = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        let mut r = user_region(va, 1);
        r.flags = RegionFlags::SHARED | RegionFlags::USER;
        mem.insert(r).unwrap();

        let (phys, _) = frames.alloc_frames(1).unwrap();
        parent
            .map_page(va, phys, PteFlags::WRITABLE | PteFlags::USER, &mut frames)
            .unwrap();

        clone_address_space(&mem, &mut parent, &mut child, &mut frames, true).unwrap();

        let pe = *parent.entry(va, false, &mut frames).unwrap();
        let ce = *child.entry(va, false, &mut frames).unwrap();
        assert!(pe.flags().contains(PteFlags::WRITABLE));
        assert!(ce.flags().contains(PteFlags::WRITABLE));
        assert!(!ce.flags().contains(PteFlags::COW));
        assert_eq!(frames.share_count(phys), 2);
    }

    #[test]
    fn free_user_pages_drops_shares() {
        let mut frames = TestFrames::new();
        let mut parent = AddressSpace::new(&mut frames).unwrap();
        let mut child = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        mem.insert(user_region(va, 1)).unwrap();

        let (phys, _) = frames.alloc_frames(1).unwrap();
        parent
            .map_page(va, phys, PteFlags::WRITABLE | PteFlags::USER, &mut frames)
            .unwrap();

        let mut child_mem =
            clone_address_space(&mem, &mut parent, &mut child, &mut frames, true).unwrap();

        free_user_pages(&mut child_mem, &mut child, &mut frames);
        assert_eq!(frames.share_count(phys), 1);
        assert!(child_mem.regions.is_empty());

        free_user_pages(&mut mem, &mut parent, &mut frames);
        assert_eq!(frames.share_count(phys), 0);
    }
}
