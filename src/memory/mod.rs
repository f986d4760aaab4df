pub mod fault;
pub mod frame_allocator;
pub mod kheap;
pub mod memregion;
pub mod paging;
pub mod regions;

use frame_allocator::FrameAllocator;
use paging::{AddressSpace, PteFlags};
use spin::{Mutex, Once};

pub const PAGE_SIZE: u64 = 4096;

/// Physical memory below this is considered claimed by the kernel image,
/// the MBI and legacy low memory.
const RESERVED_LOW: u64 = 16 * 1024 * 1024;

pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// The kernel's own address space (shared kernel half of every task).
pub fn kernel_space() -> &'static Mutex<AddressSpace> {
    KERNEL_SPACE.get().expect("memory::init not called")
}

/// `None` before `init` has run (early boot, host tests).
pub fn try_kernel_space() -> Option<&'static Mutex<AddressSpace>> {
    KERNEL_SPACE.get()
}

static SHOOTDOWN_HOOK: Once<fn(u64)> = Once::new();

/// Install the cross-CPU invalidation routine once SMP is up. Before
/// that (and on uniprocessor boots) shootdowns are local flushes only.
pub fn set_shootdown_hook(hook: fn(u64)) {
    SHOOTDOWN_HOOK.call_once(|| hook);
}

/// Invalidate `va` on every core that may hold it. Safe to call early;
/// turns into a no-op until the hook is installed.
pub fn tlb_shootdown(va: u64) {
    if let Some(hook) = SHOOTDOWN_HOOK.get() {
        hook(va);
    }
}

/// Bring up physical memory, the kernel address space and the heap.
///
/// Runs before the heap exists, so the MBI memory map is walked without
/// allocating.
///
/// # Safety
/// `mbi_addr` must point at the multiboot information structure.
pub unsafe fn init(mbi_addr: usize) {
    let info = multiboot2::BootInformation::load(mbi_addr as *const _)
        .expect("invalid multiboot2 information structure");
    let map = info.memory_map_tag().expect("memory map tag required");

    let mut ranges = [crate::boot::RamRange { start: 0, end: 0 }; 32];
    let mut count = 0;
    for area in map.memory_areas() {
        if area.typ() == multiboot2::MemoryAreaType::Available && count < ranges.len() {
            ranges[count] = crate::boot::RamRange {
                start: area.start_address(),
                end: area.end_address(),
            };
            count += 1;
        }
    }

    let mut pmm = FRAME_ALLOCATOR.lock();
    pmm.init(&ranges[..count], RESERVED_LOW);
    crate::log_info!(
        "pmm: {} frames free below the {} MiB window",
        pmm.free_frames(),
        frame_allocator::MAX_PHYS_MEM >> 20
    );

    // Build the kernel space: the physical window plus nothing else;
    // kernel regions grow their tables on demand.
    let mut space = AddressSpace::new(&mut *pmm).expect("no frames for the kernel directory");
    let mut phys = 0u64;
    while phys < frame_allocator::MAX_PHYS_MEM {
        space
            .map_page(
                paging::KERNEL_BASE + phys,
                x86_64::PhysAddr::new(phys),
                PteFlags::WRITABLE,
                &mut *pmm,
            )
            .expect("mapping the physical window cannot fail");
        phys += PAGE_SIZE;
    }

    // Map and hand over the heap window.
    let mut addr = regions::KHEAP_START;
    while addr < regions::KHEAP_START + regions::KHEAP_SIZE {
        let frame = pmm.alloc_block().expect("no frames for the kernel heap");
        space
            .map_page(addr, frame, PteFlags::WRITABLE, &mut *pmm)
            .expect("mapping the kernel heap cannot fail");
        addr += PAGE_SIZE;
    }

    #[cfg(not(test))]
    space.activate();
    paging::flush_tlb_all();

    kheap::ALLOCATOR.init(
        regions::KHEAP_START as usize,
        regions::KHEAP_SIZE as usize,
    );

    KERNEL_SPACE.call_once(|| Mutex::new(space));
    drop(pmm);

    crate::log_info!("vmm: kernel space and heap online");
}

/// `/proc/meminfo` numbers.
pub fn meminfo() -> (usize, usize, usize, usize) {
    let pmm = FRAME_ALLOCATOR.lock();
    let (heap_used, heap_total) = kheap::ALLOCATOR.stats();
    (pmm.used_frames(), pmm.free_frames(), heap_used, heap_total)
}
