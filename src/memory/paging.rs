//! Page-table plumbing.
//!
//! Every non-leaf table is a two-frame unit: the first frame holds the
//! entries the MMU walks, the second holds the kernel-virtual pointers of
//! the child tables so the kernel can descend the tree without a
//! recursive self-mapping. Leaf tables are a single frame; the parent's
//! shadow slot records their kernel pointer.

use bit_field::BitField;
use x86_64::PhysAddr;

use super::PAGE_SIZE;

pub const ENTRY_COUNT: usize = 512;

/// Start of the kernel half of the address space (PML4 slot 256).
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// The kernel window: `KERNEL_BASE + phys` maps the first GiB of RAM.
pub fn phys_to_ptr(phys: PhysAddr) -> *mut u8 {
    (KERNEL_BASE + phys.as_u64()) as *mut u8
}

pub fn is_user_addr(va: u64) -> bool {
    va < KERNEL_BASE
}

bitflags::bitflags! {
    /// Architectural PTE bits plus the software CoW marker (bit 9 is
    /// ignored by the MMU).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const COW = 1 << 9;
    }
}

const FLAG_MASK: u64 = 0xFFF | (1 << 9);

/// A page-table or page-directory entry: frame number plus flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(u64);

impl PtEntry {
    pub const fn empty() -> Self {
        PtEntry(0)
    }

    pub fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        let mut e = PtEntry(0);
        e.set_frame(frame);
        e.set_flags(flags);
        e
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.0.get_bits(12..52) << 12)
    }

    pub fn set_frame(&mut self, frame: PhysAddr) {
        self.0.set_bits(12..52, frame.as_u64() >> 12);
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !FLAG_MASK) | flags.bits();
    }

    pub fn insert_flags(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove_flags(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// MMU-visible half of a table unit.
#[repr(C, align(4096))]
pub struct EntryHalf {
    pub entries: [PtEntry; ENTRY_COUNT],
}

/// Kernel-only half: virtual pointers of the child tables, parallel to
/// the entries of the first half.
#[repr(C, align(4096))]
pub struct ShadowHalf {
    pub children: [usize; ENTRY_COUNT],
}

/// A non-leaf table: two consecutive physical frames.
#[repr(C)]
pub struct TableUnit {
    pub mmu: EntryHalf,
    pub shadow: ShadowHalf,
}

/// A leaf page table: one frame of PTEs.
#[repr(C, align(4096))]
pub struct LeafTable {
    pub entries: [PtEntry; ENTRY_COUNT],
}

/// Supplies zeroed frames, kernel-visible views of them and the CoW
/// share counters. The kernel implementation sits on the bitmap PMM and
/// the physical window; tests inject a host-memory provider.
pub trait FrameProvider {
    /// Allocate `count` contiguous zeroed frames; returns the physical
    /// address and a kernel-visible pointer to the first frame. The new
    /// frames start with a share count of 1.
    fn alloc_frames(&mut self, count: usize) -> Option<(PhysAddr, *mut u8)>;
    fn free_frames(&mut self, phys: PhysAddr, count: usize);
    /// Kernel-visible view of an already-allocated frame.
    fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8;
    /// Another mapping now references `phys`.
    fn inc_share(&mut self, phys: PhysAddr);
    /// A mapping of `phys` went away; returns the previous share count
    /// and frees the frame when it was the last reference.
    fn dec_share(&mut self, phys: PhysAddr) -> u8;
    fn share_count(&self, phys: PhysAddr) -> u8;
}

impl FrameProvider for super::frame_allocator::FrameAllocator {
    fn alloc_frames(&mut self, count: usize) -> Option<(PhysAddr, *mut u8)> {
        let phys = self.alloc_blocks(count)?;
        let ptr = phys_to_ptr(phys);
        unsafe {
            core::ptr::write_bytes(ptr, 0, count * PAGE_SIZE as usize);
        }
        Some((phys, ptr))
    }

    fn free_frames(&mut self, phys: PhysAddr, count: usize) {
        self.free_blocks(phys, count);
    }

    fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8 {
        phys_to_ptr(phys)
    }

    fn inc_share(&mut self, phys: PhysAddr) {
        self.inc_frame_shares(phys);
    }

    fn dec_share(&mut self, phys: PhysAddr) -> u8 {
        self.dec_frame_shares(phys)
    }

    fn share_count(&self, phys: PhysAddr) -> u8 {
        self.frame_shares(phys)
    }
}

/// Invalidate one TLB entry on the local CPU.
pub fn flush_tlb_entry(va: u64) {
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    #[cfg(test)]
    let _ = va;
}

pub fn flush_tlb_all() {
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush_all();
}

/// One 4-level address space rooted at a two-frame PML4 unit.
pub struct AddressSpace {
    root_phys: PhysAddr,
    root: *mut TableUnit,
}

// The raw root pointer is only dereferenced under the owner's lock.
unsafe impl Send for AddressSpace {}

fn table_indices(va: u64) -> [usize; 4] {
    [
        (va as usize >> 39) & 0x1FF,
        (va as usize >> 30) & 0x1FF,
        (va as usize >> 21) & 0x1FF,
        (va as usize >> 12) & 0x1FF,
    ]
}

impl AddressSpace {
    /// Allocate an empty top-level unit.
    pub fn new(provider: &mut dyn FrameProvider) -> Option<AddressSpace> {
        let (phys, ptr) = provider.alloc_frames(2)?;
        Some(AddressSpace {
            root_phys: phys,
            root: ptr as *mut TableUnit,
        })
    }

    /// The CR3 value for this space.
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Load this space onto the current CPU.
    ///
    /// # Safety
    /// The space must map the kernel half the CPU is executing from.
    #[cfg(not(test))]
    pub unsafe fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let frame = PhysFrame::containing_address(self.root_phys);
        Cr3::write(frame, Cr3Flags::empty());
    }

    /// Walk to the leaf PTE for `va`. With `create`, missing intermediate
    /// tables are allocated (zeroed, user-flagged iff `va` is in the
    /// user half).
    pub fn entry(
        &mut self,
        va: u64,
        create: bool,
        provider: &mut dyn FrameProvider,
    ) -> Option<&mut PtEntry> {
        let idx = table_indices(va);
        let dir_flags = if is_user_addr(va) {
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER
        } else {
            PteFlags::PRESENT | PteFlags::WRITABLE
        };

        let mut unit = self.root;
        for level in 0..3 {
            let slot = idx[level];
            let child_frames = if level < 2 { 2 } else { 1 };
            unsafe {
                let e = &mut (*unit).mmu.entries[slot];
                if !e.is_present() {
                    if !create {
                        return None;
                    }
                    let (phys, ptr) = provider.alloc_frames(child_frames)?;
                    *e = PtEntry::new(phys, dir_flags);
                    (*unit).shadow.children[slot] = ptr as usize;
                }
                let child = (*unit).shadow.children[slot];
                if level < 2 {
                    unit = child as *mut TableUnit;
                } else {
                    let leaf = child as *mut LeafTable;
                    return Some(&mut (*leaf).entries[idx[3]]);
                }
            }
        }
        unreachable!()
    }

    /// Map one page. Any previous mapping of `va` is replaced.
    pub fn map_page(
        &mut self,
        va: u64,
        phys: PhysAddr,
        flags: PteFlags,
        provider: &mut dyn FrameProvider,
    ) -> Option<()> {
        let e = self.entry(va, true, provider)?;
        *e = PtEntry::new(phys, flags | PteFlags::PRESENT);
        Some(())
    }

    /// Clear the mapping for `va`, returning the old entry if one was
    /// present.
    pub fn unmap_page(&mut self, va: u64, provider: &mut dyn FrameProvider) -> Option<PtEntry> {
        let e = self.entry(va, false, provider)?;
        if e.is_unused() {
            return None;
        }
        let old = *e;
        e.clear();
        flush_tlb_entry(va);
        Some(old)
    }

    /// Translate a virtual address, preserving the sub-page offset.
    pub fn translate(&mut self, va: u64, provider: &mut dyn FrameProvider) -> Option<PhysAddr> {
        let page = va & !(PAGE_SIZE - 1);
        let e = self.entry(page, false, provider)?;
        if !e.is_present() {
            return None;
        }
        Some(e.frame() + (va - page))
    }

    /// Share the kernel half of `other` into this space. Kernel tables
    /// are common to all address spaces by construction.
    pub fn copy_kernel_half_from(&mut self, other: &AddressSpace) {
        unsafe {
            for slot in ENTRY_COUNT / 2..ENTRY_COUNT {
                (*self.root).mmu.entries[slot] = (*other.root).mmu.entries[slot];
                (*self.root).shadow.children[slot] = (*other.root).shadow.children[slot];
            }
        }
    }

    /// Visit every present leaf PTE in `[start, end)`, skipping holes a
    /// whole table at a time.
    pub fn for_each_present(
        &mut self,
        start: u64,
        end: u64,
        provider: &mut dyn FrameProvider,
        mut f: impl FnMut(u64, &mut PtEntry),
    ) {
        let mut va = start & !(PAGE_SIZE - 1);
        while va < end {
            match self.entry(va, false, provider) {
                Some(e) => {
                    if e.is_present() {
                        f(va, e);
                    }
                    va += PAGE_SIZE;
                }
                None => {
                    // No leaf table here; skip to the next 2 MiB boundary.
                    va = (va + (1 << 21)) & !((1 << 21) - 1);
                }
            }
        }
    }

    /// Free every table in the user half (the mappings themselves must
    /// already be gone). Data frames are untouched.
    pub fn free_user_tables(&mut self, provider: &mut dyn FrameProvider) {
        unsafe {
            for slot in 0..ENTRY_COUNT / 2 {
                let e = (*self.root).mmu.entries[slot];
                if !e.is_present() {
                    continue;
                }
                let pdpt = (*self.root).shadow.children[slot] as *mut TableUnit;
                for s2 in 0..ENTRY_COUNT {
                    let e2 = (*pdpt).mmu.entries[s2];
                    if !e2.is_present() {
                        continue;
                    }
                    let pd = (*pdpt).shadow.children[s2] as *mut TableUnit;
                    for s3 in 0..ENTRY_COUNT {
                        let e3 = (*pd).mmu.entries[s3];
                        if e3.is_present() {
                            provider.free_frames(e3.frame(), 1);
                        }
                    }
                    provider.free_frames(e2.frame(), 2);
                }
                provider.free_frames(e.frame(), 2);
                (*self.root).mmu.entries[slot].clear();
                (*self.root).shadow.children[slot] = 0;
            }
        }
    }

    /// Tear the space down: user tables plus the root unit. The kernel
    /// half is shared and is left alone.
    pub fn destroy(mut self, provider: &mut dyn FrameProvider) {
        self.free_user_tables(provider);
        provider.free_frames(self.root_phys, 2);
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};
    use std::collections::HashMap;

    /// Host-memory frame provider: physical addresses are synthetic keys
    /// into a map of page-aligned host allocations.
    pub struct TestFrames {
        chunks: HashMap<u64, *mut u8>,
        shares: HashMap<u64, u8>,
        next_phys: u64,
        pub live: usize,
    }

    impl TestFrames {
        pub fn new() -> Self {
            TestFrames {
                chunks: HashMap::new(),
                shares: HashMap::new(),
                next_phys: 0x10_0000,
                live: 0,
            }
        }
    }

    impl FrameProvider for TestFrames {
        fn alloc_frames(&mut self, count: usize) -> Option<(PhysAddr, *mut u8)> {
            let layout =
                Layout::from_size_align(count * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            let phys = self.next_phys;
            self.next_phys += (count as u64) * PAGE_SIZE;
            for i in 0..count as u64 {
                self.chunks
                    .insert(phys + i * PAGE_SIZE, unsafe { ptr.add((i * PAGE_SIZE) as usize) });
                self.shares.insert(phys + i * PAGE_SIZE, 1);
            }
            self.live += count;
            Some((PhysAddr::new(phys), ptr))
        }

        fn free_frames(&mut self, phys: PhysAddr, count: usize) {
            for i in 0..count as u64 {
                self.chunks.remove(&(phys.as_u64() + i * PAGE_SIZE));
                self.shares.remove(&(phys.as_u64() + i * PAGE_SIZE));
            }
            self.live -= count;
        }

        fn frame_ptr(&mut self, phys: PhysAddr) -> *mut u8 {
            let base = phys.as_u64() & !(PAGE_SIZE - 1);
            let off = (phys.as_u64() - base) as usize;
            unsafe { self.chunks[&base].add(off) }
        }

        fn inc_share(&mut self, phys: PhysAddr) {
            if let Some(s) = self.shares.get_mut(&phys.as_u64()) {
                *s += 1;
            }
        }

        fn dec_share(&mut self, phys: PhysAddr) -> u8 {
            match self.shares.get(&phys.as_u64()).copied() {
                None | Some(0) => 0,
                Some(1) => {
                    self.free_frames(phys, 1);
                    1
                }
                Some(n) => {
                    self.shares.insert(phys.as_u64(), n - 1);
                    n
                }
            }
        }

        fn share_count(&self, phys: PhysAddr) -> u8 {
            self.shares.get(&phys.as_u64()).copied().unwrap_or(0)
        }
    }
}
