//! Local APIC access: EOI, IPIs and the per-CPU timer.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::PhysAddr;

use crate::memory::paging::PteFlags;
use crate::memory::regions::MMIO_REGION;

pub const TLB_IPI_VECTOR: u8 = 124;
pub const HALT_IPI_VECTOR: u8 = 126;
pub const TIMER_VECTOR: u8 = 48;

const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ERR_STATUS: u64 = 0x280;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_DIV: u64 = 0x3E0;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_ASSERT: u32 = 1 << 14;
const ICR_ALL_EXCL_SELF: u32 = 3 << 18;
const ICR_INIT: u32 = 5 << 8;
const ICR_STARTUP: u32 = 6 << 8;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// Kernel-virtual base of the LAPIC register window; 0 until mapped.
static LAPIC_VIRT: AtomicU64 = AtomicU64::new(0);

fn reg(offset: u64) -> *mut u32 {
    (LAPIC_VIRT.load(Ordering::Acquire) + offset) as *mut u32
}

fn read(offset: u64) -> u32 {
    unsafe { core::ptr::read_volatile(reg(offset)) }
}

fn write(offset: u64, value: u32) {
    unsafe { core::ptr::write_volatile(reg(offset), value) }
}

pub fn is_mapped() -> bool {
    LAPIC_VIRT.load(Ordering::Acquire) != 0
}

/// Map the LAPIC register page and enable the APIC with a spurious
/// vector.
pub fn init(lapic_phys: u64) {
    let mut space = crate::memory::kernel_space().lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    let virt = MMIO_REGION
        .phys_to_virt_off(
            PhysAddr::new(lapic_phys),
            PhysAddr::new(lapic_phys + 0x1000),
            PteFlags::WRITABLE | PteFlags::NO_CACHE,
            &mut space,
            &mut *pmm,
        )
        .expect("no room to map the LAPIC");
    LAPIC_VIRT.store(virt, Ordering::Release);

    write(REG_SPURIOUS, 0x100 | 0xFF);
}

pub fn id() -> u32 {
    read(REG_ID) >> 24
}

pub fn eoi() {
    write(REG_EOI, 0);
}

fn wait_delivery() {
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Fixed IPI to every CPU but the caller.
pub fn broadcast_ipi(vector: u8) {
    if !is_mapped() {
        return;
    }
    write(REG_ERR_STATUS, 0);
    write(REG_ICR_HIGH, 0);
    write(
        REG_ICR_LOW,
        (read(REG_ICR_LOW) & 0xFFF0_0000) | ICR_ALL_EXCL_SELF | vector as u32,
    );
    wait_delivery();
}

/// Fixed IPI to one CPU by LAPIC id.
pub fn send_ipi(lapic_id: u32, vector: u8) {
    if !is_mapped() {
        return;
    }
    write(REG_ERR_STATUS, 0);
    write(REG_ICR_HIGH, lapic_id << 24);
    write(REG_ICR_LOW, ICR_ASSERT | vector as u32);
    wait_delivery();
}

/// INIT IPI half of the AP wakeup protocol.
pub fn send_init(lapic_id: u32) {
    write(REG_ERR_STATUS, 0);
    write(REG_ICR_HIGH, lapic_id << 24);
    write(REG_ICR_LOW, ICR_INIT | ICR_ASSERT);
    wait_delivery();
}

/// STARTUP IPI pointing the AP at `trampoline_phys` (must be below 1 MiB
/// and page-aligned).
pub fn send_startup(lapic_id: u32, trampoline_phys: u64) {
    write(REG_ERR_STATUS, 0);
    write(REG_ICR_HIGH, lapic_id << 24);
    write(
        REG_ICR_LOW,
        ICR_STARTUP | ICR_ASSERT | ((trampoline_phys >> 12) & 0xFF) as u32,
    );
    wait_delivery();
}

/// Program the local timer to fire `TIMER_VECTOR` periodically.
pub fn start_timer(initial_count: u32) {
    write(REG_TIMER_DIV, 0x3); // divide by 16
    write(REG_LVT_TIMER, TIMER_VECTOR as u32 | LVT_TIMER_PERIODIC);
    write(REG_TIMER_INIT, initial_count);
}
