//! Named reservations inside kernel virtual address space.
//!
//! Each region owns a `[start, end)` window, a running cursor and a
//! lock. Allocation is bump-then-scan: advance the cursor looking for an
//! empty PTE, wrap to the start on exhaustion, and rescan what was
//! skipped before giving up.

use spin::Mutex;
use x86_64::PhysAddr;

use super::paging::{AddressSpace, FrameProvider, PtEntry, PteFlags};
use super::PAGE_SIZE;

const REGION_BASE: u64 = 0xffff_9000_0000_0000;
const REGION_STRIDE: u64 = 0x100_0000_0000; // 1 TiB apart
const REGION_LEN: u64 = 1 << 30; // 1 GiB each

/// Static bounds of the kernel heap (managed by `kheap`, not scanned).
pub const KHEAP_START: u64 = 0xffff_a000_0000_0000;
pub const KHEAP_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    PageTable,
    KStack,
    KModule,
    VbeFrontBuf,
    VbeBackBuf,
    Pipe,
    PCache,
    Dma,
    Acpi,
    Mmio,
}

/// A named kernel virtual-address region.
pub struct KernelRegion {
    pub kind: RegionKind,
    pub name: &'static str,
    pub start: u64,
    pub end: u64,
    cursor: Mutex<u64>,
}

macro_rules! region {
    ($kind:expr, $name:expr, $idx:expr) => {
        KernelRegion {
            kind: $kind,
            name: $name,
            start: REGION_BASE + $idx * REGION_STRIDE,
            end: REGION_BASE + $idx * REGION_STRIDE + REGION_LEN,
            cursor: Mutex::new(REGION_BASE + $idx * REGION_STRIDE),
        }
    };
}

pub static PAGETABLE_REGION: KernelRegion = region!(RegionKind::PageTable, "pagetable", 0);
pub static KSTACK_REGION: KernelRegion = region!(RegionKind::KStack, "kstack", 1);
pub static KMODULE_REGION: KernelRegion = region!(RegionKind::KModule, "kmodule", 2);
pub static VBE_FRONTBUF_REGION: KernelRegion = region!(RegionKind::VbeFrontBuf, "vbe-frontbuf", 3);
pub static VBE_BACKBUF_REGION: KernelRegion = region!(RegionKind::VbeBackBuf, "vbe-backbuf", 4);
pub static PIPE_REGION: KernelRegion = region!(RegionKind::Pipe, "pipe", 5);
pub static PCACHE_REGION: KernelRegion = region!(RegionKind::PCache, "pcache", 6);
pub static DMA_REGION: KernelRegion = region!(RegionKind::Dma, "dma", 7);
pub static ACPI_REGION: KernelRegion = region!(RegionKind::Acpi, "acpi", 8);
pub static MMIO_REGION: KernelRegion = region!(RegionKind::Mmio, "mmio", 9);

/// All named regions, for diagnostics (`/proc/meminfo` et al.).
pub static ALL_REGIONS: [&KernelRegion; 10] = [
    &PAGETABLE_REGION,
    &KSTACK_REGION,
    &KMODULE_REGION,
    &VBE_FRONTBUF_REGION,
    &VBE_BACKBUF_REGION,
    &PIPE_REGION,
    &PCACHE_REGION,
    &DMA_REGION,
    &ACPI_REGION,
    &MMIO_REGION,
];

impl KernelRegion {
    /// A region with explicit bounds; the statics cover the fixed map,
    /// tests build small ones.
    pub const fn with_bounds(kind: RegionKind, name: &'static str, start: u64, end: u64) -> Self {
        KernelRegion {
            kind,
            name,
            start,
            end,
            cursor: Mutex::new(start),
        }
    }

    /// Allocate one physical frame and map it at the next free page of
    /// the region. Returns the chosen virtual address.
    pub fn get_next_addr(
        &self,
        flags: PteFlags,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) -> Option<u64> {
        let (phys, _) = frames.alloc_frames(1)?;
        match self.place_phys(phys, flags, space, frames) {
            Some(va) => Some(va),
            None => {
                frames.free_frames(phys, 1);
                None
            }
        }
    }

    /// Map an existing physical frame at the next free page. This is the
    /// single-page `phys_to_virt` used for MMIO registers and the like.
    pub fn place_phys(
        &self,
        phys: PhysAddr,
        flags: PteFlags,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) -> Option<u64> {
        let mut cursor = self.cursor.lock();
        if *cursor >= self.end {
            *cursor = self.start;
        }

        let first_pass_start = *cursor;
        let mut va = first_pass_start;
        let mut end = self.end;
        loop {
            while va < end {
                let e = space.entry(va, true, frames)?;
                if e.is_unused() {
                    *e = PtEntry::new(phys, flags | PteFlags::PRESENT);
                    *cursor = va + PAGE_SIZE;
                    super::paging::flush_tlb_entry(va);
                    return Some(va);
                }
                va += PAGE_SIZE;
            }
            // Wrap once: rescan what sits before the original cursor,
            // someone may have freed a page there.
            if end == self.end && first_pass_start != self.start {
                end = first_pass_start;
                va = self.start;
            } else {
                return None;
            }
        }
    }

    /// Allocate and map `ceil(sz / PAGE_SIZE)` consecutive virtual pages.
    /// With `contiguous`, the physical frames form one run (page
    /// directories need this); otherwise each page gets its own frame.
    /// Returns `(virt, first_phys)`.
    pub fn alloc_and_map(
        &self,
        sz: u64,
        contiguous: bool,
        flags: PteFlags,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) -> Option<(u64, PhysAddr)> {
        let pages = ((sz + PAGE_SIZE - 1) / PAGE_SIZE) as usize;
        if pages == 0 {
            return None;
        }

        let mut cursor = self.cursor.lock();
        let addr = self.find_free_run(pages, space, frames)?;

        let first_phys;
        if contiguous {
            let (phys, _) = frames.alloc_frames(pages)?;
            first_phys = phys;
            for i in 0..pages as u64 {
                match space.entry(addr + i * PAGE_SIZE, true, frames) {
                    Some(e) => {
                        *e = PtEntry::new(phys + i * PAGE_SIZE, flags | PteFlags::PRESENT);
                        super::paging::flush_tlb_entry(addr + i * PAGE_SIZE);
                    }
                    None => {
                        for j in 0..i {
                            space.unmap_page(addr + j * PAGE_SIZE, frames);
                        }
                        frames.free_frames(phys, pages);
                        return None;
                    }
                }
            }
        } else {
            let mut mapped = 0usize;
            let mut first = PhysAddr::new(0);
            for i in 0..pages as u64 {
                let phys = match frames.alloc_frames(1) {
                    Some((p, _)) => p,
                    None => break,
                };
                if i == 0 {
                    first = phys;
                }
                // The run was free under the cursor lock; entry() cannot fail
                // here unless table allocation does.
                match space.entry(addr + i * PAGE_SIZE, true, frames) {
                    Some(e) => {
                        *e = PtEntry::new(phys, flags | PteFlags::PRESENT);
                        super::paging::flush_tlb_entry(addr + i * PAGE_SIZE);
                        mapped += 1;
                    }
                    None => {
                        frames.free_frames(phys, 1);
                        break;
                    }
                }
            }
            if mapped != pages {
                // Roll back the partial mapping.
                for i in 0..mapped as u64 {
                    if let Some(old) = space.unmap_page(addr + i * PAGE_SIZE, frames) {
                        frames.free_frames(old.frame(), 1);
                    }
                }
                return None;
            }
            first_phys = first;
        }

        *cursor = addr + pages as u64 * PAGE_SIZE;
        Some((addr, first_phys))
    }

    /// Map the physical range `[pstart, pend)` at consecutive virtual
    /// pages, preserving `pstart`'s sub-page offset in the result.
    pub fn phys_to_virt_off(
        &self,
        pstart: PhysAddr,
        pend: PhysAddr,
        flags: PteFlags,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) -> Option<u64> {
        let page_off = pstart.as_u64() & (PAGE_SIZE - 1);
        let first_page = pstart.as_u64() - page_off;
        let span = pend.as_u64() - first_page;
        let pages = ((span + PAGE_SIZE - 1) / PAGE_SIZE) as usize;

        let _cursor = self.cursor.lock();
        let addr = self.find_free_run(pages, space, frames)?;

        for i in 0..pages as u64 {
            let e = space.entry(addr + i * PAGE_SIZE, true, frames)?;
            *e = PtEntry::new(
                PhysAddr::new(first_page + i * PAGE_SIZE),
                flags | PteFlags::PRESENT,
            );
            super::paging::flush_tlb_entry(addr + i * PAGE_SIZE);
        }

        Some(addr + page_off)
    }

    /// Unmap `ceil(sz / PAGE_SIZE)` pages starting at `va`, dropping the
    /// frame references.
    pub fn unmap_and_free(
        &self,
        va: u64,
        sz: u64,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) {
        let pages = (sz + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            if let Some(old) = space.unmap_page(va + i * PAGE_SIZE, frames) {
                frames.dec_share(old.frame());
            }
        }
    }

    /// First run of `pages` consecutive empty PTEs, scanning the whole
    /// region from its start. Caller holds the cursor lock.
    fn find_free_run(
        &self,
        pages: usize,
        space: &mut AddressSpace,
        frames: &mut dyn FrameProvider,
    ) -> Option<u64> {
        let mut run = 0usize;
        let mut va = self.start;
        while va < self.end {
            let e = space.entry(va, true, frames)?;
            if e.is_unused() {
                run += 1;
                if run == pages {
                    return Some(va - (pages as u64 - 1) * PAGE_SIZE);
                }
            } else {
                run = 0;
            }
            va += PAGE_SIZE;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::paging::test_support::TestFrames;
    use super::super::paging::KERNEL_BASE;
    use super::*;

    fn small_region(pages: u64) -> KernelRegion {
        KernelRegion::with_bounds(
            RegionKind::Pipe,
            "test",
            KERNEL_BASE + 0x4000_0000,
            KERNEL_BASE + 0x4000_0000 + pages * PAGE_SIZE,
        )
    }

    #[test]
    fn next_addr_advances_and_wraps() {
        let region = small_region(3);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        let a = region
            .get_next_addr(PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        let b = region
            .get_next_addr(PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        let c = region
            .get_next_addr(PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        assert_eq!(c, b + PAGE_SIZE);

        // Region is full now.
        assert!(region
            .get_next_addr(PteFlags::WRITABLE, &mut space, &mut frames)
            .is_none());

        // Free the middle page; the wrap-around rescan must find it.
        let old = space.unmap_page(b, &mut frames).unwrap();
        frames.free_frames(old.frame(), 1);
        let again = region
            .get_next_addr(PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn alloc_and_map_contiguous_run() {
        let region = small_region(8);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        let (va, phys) = region
            .alloc_and_map(3 * PAGE_SIZE, true, PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        for i in 0..3u64 {
            assert_eq!(
                space.translate(va + i * PAGE_SIZE, &mut frames),
                Some(phys + i * PAGE_SIZE)
            );
        }
    }

    #[test]
    fn alloc_and_map_rounds_size_up() {
        let region = small_region(8);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        let (va, _) = region
            .alloc_and_map(PAGE_SIZE + 1, false, PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        assert!(space.translate(va + PAGE_SIZE, &mut frames).is_some());
    }

    #[test]
    fn alloc_and_map_needs_a_consecutive_run() {
        let region = small_region(4);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        // Occupy page 1 to split the region into runs of 1 and 2.
        let base = region.start;
        space
            .map_page(base + PAGE_SIZE, PhysAddr::new(0x7000), PteFlags::WRITABLE, &mut frames)
            .unwrap();

        assert!(region
            .alloc_and_map(3 * PAGE_SIZE, false, PteFlags::WRITABLE, &mut space, &mut frames)
            .is_none());
        let (va, _) = region
            .alloc_and_map(2 * PAGE_SIZE, false, PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        assert_eq!(va, base + 2 * PAGE_SIZE);
    }

    #[test]
    fn phys_to_virt_off_keeps_sub_page_offset() {
        let region = small_region(4);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        let va = region
            .phys_to_virt_off(
                PhysAddr::new(0x9_0123),
                PhysAddr::new(0x9_3000),
                PteFlags::NO_CACHE,
                &mut space,
                &mut frames,
            )
            .unwrap();
        assert_eq!(va & (PAGE_SIZE - 1), 0x123);
        assert_eq!(
            space.translate(va, &mut frames),
            Some(PhysAddr::new(0x9_0123))
        );
    }

    #[test]
    fn unmap_and_free_clears_the_run() {
        let region = small_region(4);
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();

        let (va, _) = region
            .alloc_and_map(2 * PAGE_SIZE, false, PteFlags::WRITABLE, &mut space, &mut frames)
            .unwrap();
        region.unmap_and_free(va, 2 * PAGE_SIZE, &mut space, &mut frames);
        assert_eq!(space.translate(va, &mut frames), None);
        assert_eq!(space.translate(va + PAGE_SIZE, &mut frames), None);
    }
}
