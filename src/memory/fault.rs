//! Page-fault resolution.
//!
//! The architectural handler in `interrupts` decodes CR2 and the error
//! code, then hands the decision to `handle_user_fault`, which is plain
//! logic over the address space, the VMA list and the frame provider.

use super::memregion::{MemRegion, Prot, RegionFlags, TaskMem};
use super::paging::{AddressSpace, FrameProvider, PteFlags};
use super::PAGE_SIZE;

/// Furthest a stack may be grown below its current base by a single
/// faulting access (guards against wild pointers "extending" the stack).
const STACK_SLOP: u64 = 32 * PAGE_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub addr: u64,
    /// Error code bit 1: the access was a write.
    pub write: bool,
    /// Error code bit 0: the PTE was present (protection fault).
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping fixed up; retry the access.
    Resolved,
    /// Deliver SIGSEGV with `si_addr` = faulting address.
    Segv,
    OutOfMemory,
}

/// Resolve a user-space fault. Caller holds the task's memory mutex.
pub fn handle_user_fault(
    fault: PageFault,
    mem: &mut TaskMem,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
    stack_limit: u64,
) -> FaultOutcome {
    let page = fault.addr & !(PAGE_SIZE - 1);

    if mem.region_containing(fault.addr).is_none() {
        if !try_extend_stack(fault.addr, mem, stack_limit) {
            return FaultOutcome::Segv;
        }
    }

    let region = match mem.region_containing(fault.addr) {
        Some(r) => r.clone(),
        None => return FaultOutcome::Segv,
    };

    if fault.present {
        return protection_fault(fault, page, &region, space, frames);
    }

    demand_page(page, &region, space, frames)
}

/// A fault just below a GROWS_DOWN region extends it, provided the
/// region stays within the stack rlimit.
fn try_extend_stack(addr: u64, mem: &mut TaskMem, stack_limit: u64) -> bool {
    let page = addr & !(PAGE_SIZE - 1);
    let stack = match mem
        .regions
        .iter_mut()
        .find(|r| r.flags.contains(RegionFlags::GROWS_DOWN) && r.start > addr)
    {
        Some(r) => r,
        None => return false,
    };
    if stack.start - page > STACK_SLOP {
        return false;
    }
    if stack.end - page > stack_limit {
        return false;
    }
    stack.start = page;
    true
}

fn protection_fault(
    fault: PageFault,
    page: u64,
    region: &MemRegion,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
) -> FaultOutcome {
    if !fault.write {
        // Present + read fault: the access itself was illegal.
        return FaultOutcome::Segv;
    }

    let entry = match space.entry(page, false, frames) {
        Some(e) => *e,
        None => return FaultOutcome::Segv,
    };

    if !entry.flags().contains(PteFlags::COW) {
        // Write to a genuinely read-only page.
        return FaultOutcome::Segv;
    }

    let old_frame = entry.frame();
    if frames.share_count(old_frame) == 1 {
        // Sole owner: take the page back instead of copying.
        if let Some(e) = space.entry(page, false, frames) {
            e.remove_flags(PteFlags::COW);
            e.insert_flags(PteFlags::WRITABLE);
        }
        super::paging::flush_tlb_entry(page);
        return FaultOutcome::Resolved;
    }

    // Shared: copy, retarget this mapping, drop one reference to the old
    // frame. Other mappings keep their CoW view.
    let (new_frame, new_ptr) = match frames.alloc_frames(1) {
        Some(v) => v,
        None => return FaultOutcome::OutOfMemory,
    };
    unsafe {
        let src = frames.frame_ptr(old_frame);
        core::ptr::copy_nonoverlapping(src, new_ptr, PAGE_SIZE as usize);
    }
    if space.map_page(page, new_frame, region.pte_flags(), frames).is_none() {
        frames.free_frames(new_frame, 1);
        return FaultOutcome::OutOfMemory;
    }
    frames.dec_share(old_frame);
    super::paging::flush_tlb_entry(page);
    super::tlb_shootdown(page);
    FaultOutcome::Resolved
}

fn demand_page(
    page: u64,
    region: &MemRegion,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
) -> FaultOutcome {
    let (frame, ptr) = match frames.alloc_frames(1) {
        Some(v) => v,
        None => return FaultOutcome::OutOfMemory,
    };

    if let Some(backing) = &region.backing {
        let off = region.file_off + (page - region.start);
        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE as usize) };
        if backing.read_at(off, buf).is_err() {
            frames.free_frames(frame, 1);
            return FaultOutcome::Segv;
        }
        // Short reads past EOF leave the tail zeroed (bss).
    }

    if space.map_page(page, frame, region.pte_flags(), frames).is_none() {
        frames.free_frames(frame, 1);
        return FaultOutcome::OutOfMemory;
    }
    super::paging::flush_tlb_entry(page);
    FaultOutcome::Resolved
}

/// Faults against demand-paged kernel regions (pipe, pcache, ...) are
/// fixed by allocating on the fly; anything else in kernel space is a
/// bug, reported for the panic path.
pub fn handle_kernel_fault(
    addr: u64,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
) -> bool {
    let in_region = super::regions::ALL_REGIONS
        .iter()
        .any(|r| addr >= r.start && addr < r.end);
    if !in_region {
        return false;
    }
    let page = addr & !(PAGE_SIZE - 1);
    let (frame, _) = match frames.alloc_frames(1) {
        Some(v) => v,
        None => return false,
    };
    if space
        .map_page(page, frame, PteFlags::WRITABLE, frames)
        .is_none()
    {
        frames.free_frames(frame, 1);
        return false;
    }
    super::paging::flush_tlb_entry(page);
    true
}

#[cfg(test)]
mod tests {
    use super::super::memregion::{clone_address_space, BackingStore, MemRegion, RegionType};
    use super::super::paging::test_support::TestFrames;
    use super::*;
    use crate::errno::KResult;
    use alloc::sync::Arc;

    fn rw_region(start: u64, pages: u64) -> MemRegion {
        MemRegion::anon(
            start,
            start + pages * PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            RegionFlags::PRIVATE | RegionFlags::USER,
            RegionType::Data,
        )
    }

    fn write_fault(addr: u64) -> PageFault {
        PageFault {
            addr,
            write: true,
            present: true,
        }
    }

    fn miss_fault(addr: u64) -> PageFault {
        PageFault {
            addr,
            write: false,
            present: false,
        }
    }

    #[test]
    fn segv_outside_any_region() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        assert_eq!(
            handle_user_fault(miss_fault(0x1234_5678), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Segv
        );
    }

    #[test]
    fn demand_page_is_zero_filled() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        mem.insert(rw_region(va, 1)).unwrap();

        assert_eq!(
            handle_user_fault(miss_fault(va + 8), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Resolved
        );
        let phys = space.translate(va, &mut frames).unwrap();
        let ptr = frames.frame_ptr(phys);
        let page = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
        assert!(page.iter().all(|&b| b == 0));
    }

    struct PatternFile;
    impl BackingStore for PatternFile {
        fn read_at(&self, off: u64, buf: &mut [u8]) -> KResult<usize> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = ((off as usize + i) % 251) as u8;
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn demand_page_reads_backing_at_region_offset() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        let mut region = rw_region(va, 2);
        region.backing = Some(Arc::new(PatternFile));
        region.file_off = 0x2000;
        mem.insert(region).unwrap();

        let fault_va = va + PAGE_SIZE; // second page of the region
        assert_eq!(
            handle_user_fault(miss_fault(fault_va), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Resolved
        );
        let phys = space.translate(fault_va, &mut frames).unwrap();
        let ptr = frames.frame_ptr(phys);
        let page = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
        // Expected file offset: 0x2000 + PAGE_SIZE.
        assert_eq!(page[0], (((0x2000 + PAGE_SIZE) as usize) % 251) as u8);
    }

    #[test]
    fn write_to_readonly_region_is_segv() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x40_0000u64;
        let mut region = rw_region(va, 1);
        region.prot = Prot::READ;
        mem.insert(region).unwrap();

        // Fault it in, then attempt a write.
        handle_user_fault(miss_fault(va), &mut mem, &mut space, &mut frames, 1 << 23);
        assert_eq!(
            handle_user_fault(write_fault(va), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Segv
        );
    }

    /// Scenario: parent writes "A", forks, writes "B"; the child still
    /// reads "A", and each side keeps its own page afterwards.
    #[test]
    fn cow_write_isolation_after_fork() {
        let mut frames = TestFrames::new();
        let mut parent = AddressSpace::new(&mut frames).unwrap();
        let mut child = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let va = 0x1_0000u64;
        mem.insert(rw_region(va, 1)).unwrap();

        // Parent faults the page in and writes 'A'.
        handle_user_fault(miss_fault(va), &mut mem, &mut parent, &mut frames, 1 << 23);
        let parent_phys = parent.translate(va, &mut frames).unwrap();
        unsafe { *frames.frame_ptr(parent_phys) = b'A' };

        let mut child_mem =
            clone_address_space(&mem, &mut parent, &mut child, &mut frames, true).unwrap();

        // Parent writes 'B': CoW fault copies the page for the parent.
        assert_eq!(
            handle_user_fault(write_fault(va), &mut mem, &mut parent, &mut frames, 1 << 23),
            FaultOutcome::Resolved
        );
        let new_parent_phys = parent.translate(va, &mut frames).unwrap();
        assert_ne!(new_parent_phys, parent_phys);
        unsafe { *frames.frame_ptr(new_parent_phys) = b'B' };

        // Child still sees 'A' through the original frame.
        let child_phys = child.translate(va, &mut frames).unwrap();
        assert_eq!(child_phys, parent_phys);
        assert_eq!(unsafe { *frames.frame_ptr(child_phys) }, b'A');

        // Child's own write now finds itself sole owner and flips the
        // bit in place rather than copying.
        assert_eq!(
            handle_user_fault(write_fault(va), &mut child_mem, &mut child, &mut frames, 1 << 23),
            FaultOutcome::Resolved
        );
        assert_eq!(child.translate(va, &mut frames).unwrap(), child_phys);
        let e = child.entry(va, false, &mut frames).unwrap();
        assert!(e.flags().contains(PteFlags::WRITABLE));
        assert!(!e.flags().contains(PteFlags::COW));
        assert_eq!(unsafe { *frames.frame_ptr(child_phys) }, b'A');
    }

    #[test]
    fn stack_extends_down_within_limit() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let stack_top = 0x7ff0_0000u64;
        let mut stack = rw_region(stack_top - 4 * PAGE_SIZE, 4);
        stack.flags |= RegionFlags::GROWS_DOWN;
        stack.rtype = RegionType::Stack;
        mem.insert(stack).unwrap();

        let below = stack_top - 6 * PAGE_SIZE;
        assert_eq!(
            handle_user_fault(miss_fault(below), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Resolved
        );
        assert_eq!(mem.regions[0].start, below & !(PAGE_SIZE - 1));

        // Far below the slop window: refused.
        let way_below = stack_top - 200 * PAGE_SIZE;
        assert_eq!(
            handle_user_fault(miss_fault(way_below), &mut mem, &mut space, &mut frames, 1 << 23),
            FaultOutcome::Segv
        );
    }
}
