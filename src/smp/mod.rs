//! SMP bringup and cross-core coordination.
//!
//! The BSP parses the MADT for the other cores, parks the AP bootstrap
//! blob at 0x8000, then walks the INIT + double-STARTUP dance per AP.
//! Each AP finishes its own transition in `ap_main`: GS base, IDT, LAPIC
//! timer, then the idle loop.

pub mod lapic;
pub mod percpu;
pub mod shootdown;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use shootdown::{handle_tlb_ipi, tlb_shootdown};

/// One detected processor, from the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub acpi_id: u8,
    pub lapic_id: u8,
    pub enabled: bool,
}

/// Physical address the AP bootstrap blob is parked at. Must stay below
/// 1 MiB so a STARTUP IPI can point at it.
pub const TRAMPOLINE_PHYS: u64 = 0x8000;

/// Marker patched with the shared kernel PML4 physical address inside
/// the bootstrap blob.
const TRAMPOLINE_PD_MARKER: u32 = 0x7777_7777;

/// Flipped by each AP when it reaches the scheduler; the BSP waits on it
/// before waking the next one.
static AP_STARTUP_FLAG: AtomicBool = AtomicBool::new(false);

/// Index of the AP currently being started (its kernel stack and GDT are
/// staged under this id).
static AP_CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Parse the body of an MADT (bytes after the 44-byte table header is
/// included; pass the whole table). Returns the LAPIC base and the
/// processor records.
pub fn parse_madt(table: &[u8]) -> Option<(u64, Vec<CpuInfo>)> {
    if table.len() < 44 || &table[0..4] != b"APIC" {
        return None;
    }
    let length = u32::from_le_bytes(table[4..8].try_into().ok()?) as usize;
    if length > table.len() {
        return None;
    }

    let lapic_base = u32::from_le_bytes(table[36..40].try_into().ok()?) as u64;
    let mut cpus = Vec::new();

    let mut off = 44;
    while off + 2 <= length {
        let entry_type = table[off];
        let entry_len = table[off + 1] as usize;
        if entry_len < 2 || off + entry_len > length {
            break;
        }
        if entry_type == 0 && entry_len >= 8 {
            let flags = u32::from_le_bytes(table[off + 4..off + 8].try_into().ok()?);
            cpus.push(CpuInfo {
                acpi_id: table[off + 2],
                lapic_id: table[off + 3],
                enabled: flags & 1 != 0,
            });
        }
        off += entry_len;
    }

    Some((lapic_base, cpus))
}

/// Patch the page-directory marker inside a copied bootstrap blob.
/// Returns false when the marker is absent (blob mismatch).
pub fn patch_trampoline(blob: &mut [u8], pd_phys: u32) -> bool {
    if blob.len() < 4 {
        return false;
    }
    for i in 0..blob.len() - 3 {
        let word = u32::from_le_bytes([blob[i], blob[i + 1], blob[i + 2], blob[i + 3]]);
        if word == TRAMPOLINE_PD_MARKER {
            blob[i..i + 4].copy_from_slice(&pd_phys.to_le_bytes());
            return true;
        }
    }
    false
}

#[cfg(not(test))]
extern "C" {
    static __ap_bootstrap_start: u8;
    static __ap_bootstrap_end: u8;
}

/// Wake every AP the MADT reported. The BSP must already be online with
/// its LAPIC mapped.
#[cfg(not(test))]
pub fn init(boot: &crate::boot::BootInfo) {
    use crate::memory::paging::{phys_to_ptr, PteFlags};
    use crate::memory::PAGE_SIZE;
    use x86_64::PhysAddr;

    percpu::install(0);
    crate::memory::set_shootdown_hook(tlb_shootdown);

    let madt = match find_madt(boot.rsdp_addr) {
        Some(m) => m,
        None => {
            crate::log_warn!("smp: no MADT; staying uniprocessor");
            return;
        }
    };
    let (lapic_base, cpus) = match parse_madt(madt) {
        Some(v) => v,
        None => {
            crate::log_warn!("smp: malformed MADT; staying uniprocessor");
            return;
        }
    };

    lapic::init(lapic_base);
    percpu::CPUS[0].lapic_id.store(lapic::id(), Ordering::Release);

    if boot.cmdline.nosmp {
        crate::log_info!("smp: disabled via the kernel commandline");
        return;
    }

    let usable: Vec<CpuInfo> = cpus
        .into_iter()
        .filter(|c| c.enabled)
        .take(percpu::MAX_CPUS)
        .collect();
    crate::log_info!("smp: found {} core(s)", usable.len());
    if usable.len() <= 1 {
        return;
    }

    // Identity-map the trampoline page so the AP still finds its code
    // the instant it enables paging, and park the patched blob there.
    {
        let mut space = crate::memory::kernel_space().lock();
        let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
        space
            .map_page(
                TRAMPOLINE_PHYS,
                PhysAddr::new(TRAMPOLINE_PHYS),
                PteFlags::WRITABLE,
                &mut *pmm,
            )
            .expect("cannot identity-map the trampoline page");

        let blob_len = unsafe {
            (&__ap_bootstrap_end as *const u8 as usize)
                - (&__ap_bootstrap_start as *const u8 as usize)
        };
        let blob = unsafe {
            core::slice::from_raw_parts_mut(
                phys_to_ptr(PhysAddr::new(TRAMPOLINE_PHYS)),
                blob_len.min(PAGE_SIZE as usize),
            )
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                &__ap_bootstrap_start as *const u8,
                blob.as_mut_ptr(),
                blob.len(),
            );
        }
        let pd_phys = space.root_phys().as_u64() as u32;
        if !patch_trampoline(blob, pd_phys) {
            crate::log_error!("smp: trampoline marker missing; APs stay parked");
            return;
        }
    }

    let my_lapic = lapic::id();
    for (cpu_index, info) in usable.iter().enumerate() {
        if info.lapic_id as u32 == my_lapic {
            continue;
        }

        // Stage the AP's kernel stack before it exists.
        let stack_top = {
            let mut space = crate::memory::kernel_space().lock();
            let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
            let (base, _) = crate::memory::regions::KSTACK_REGION
                .alloc_and_map(4 * PAGE_SIZE, false, PteFlags::WRITABLE, &mut space, &mut *pmm)
                .expect("no room for an AP kernel stack");
            base + 4 * PAGE_SIZE
        };
        crate::interrupts::gdt::stage_ap(cpu_index, stack_top);

        AP_STARTUP_FLAG.store(false, Ordering::Release);
        AP_CURRENT.store(cpu_index, Ordering::Release);
        percpu::CPUS[cpu_index]
            .lapic_id
            .store(info.lapic_id as u32, Ordering::Release);

        crate::log_info!("smp: waking core {} (lapic {})", cpu_index, info.lapic_id);
        lapic::send_init(info.lapic_id as u32);
        busy_wait_ms(10);
        for _ in 0..2 {
            lapic::send_startup(info.lapic_id as u32, TRAMPOLINE_PHYS);
            busy_wait_ms(1);
        }

        while !AP_STARTUP_FLAG.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    crate::log_info!("smp: {} core(s) online", percpu::online_count());
}

/// Entered from the bootstrap blob once the AP runs 64-bit code on the
/// shared kernel directory.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn ap_main() -> ! {
    let cpu = AP_CURRENT.load(Ordering::Acquire);

    percpu::install(cpu);
    crate::interrupts::gdt::load_ap(cpu);
    crate::interrupts::idt::load();

    let root = crate::memory::kernel_space().lock().root_phys().as_u64();
    percpu::CPUS[cpu].active_pd.store(root, Ordering::Release);

    lapic::start_timer(10_000_000);
    crate::log_info!("smp[{}]: online, entering idle", cpu);

    AP_STARTUP_FLAG.store(true, Ordering::Release);
    crate::scheduler::idle_loop();
}

/// Stop every other core dead (panic path).
pub fn halt_other_cores() {
    #[cfg(not(test))]
    if lapic::is_mapped() && percpu::online_count() > 1 {
        lapic::broadcast_ipi(lapic::HALT_IPI_VECTOR);
    }
}

#[cfg(not(test))]
fn busy_wait_ms(ms: u64) {
    // Calibrated nowhere; the INIT/SIPI protocol only needs "long
    // enough" at boot.
    for _ in 0..ms * 200_000 {
        core::hint::spin_loop();
    }
}

/// Follow RSDP -> RSDT/XSDT -> MADT through the physical window.
#[cfg(not(test))]
fn find_madt(rsdp_addr: Option<u64>) -> Option<&'static [u8]> {
    use crate::memory::paging::phys_to_ptr;
    use x86_64::PhysAddr;

    let rsdp = rsdp_addr?;
    let rsdp_bytes = unsafe { core::slice::from_raw_parts(phys_to_ptr(PhysAddr::new(rsdp)), 36) };
    if &rsdp_bytes[0..8] != b"RSD PTR " {
        return None;
    }
    let revision = rsdp_bytes[15];

    let (root, wide) = if revision >= 2 {
        (
            u64::from_le_bytes(rsdp_bytes[24..32].try_into().ok()?),
            true,
        )
    } else {
        (
            u32::from_le_bytes(rsdp_bytes[16..20].try_into().ok()?) as u64,
            false,
        )
    };

    let header = unsafe { core::slice::from_raw_parts(phys_to_ptr(PhysAddr::new(root)), 36) };
    let length = u32::from_le_bytes(header[4..8].try_into().ok()?) as usize;
    let table = unsafe { core::slice::from_raw_parts(phys_to_ptr(PhysAddr::new(root)), length) };

    let stride = if wide { 8 } else { 4 };
    let mut off = 36;
    while off + stride <= length {
        let entry = if wide {
            u64::from_le_bytes(table[off..off + 8].try_into().ok()?)
        } else {
            u32::from_le_bytes(table[off..off + 4].try_into().ok()?) as u64
        };
        let sdt = unsafe { core::slice::from_raw_parts(phys_to_ptr(PhysAddr::new(entry)), 8) };
        if &sdt[0..4] == b"APIC" {
            let sdt_len = u32::from_le_bytes(sdt[4..8].try_into().ok()?) as usize;
            return Some(unsafe {
                core::slice::from_raw_parts(phys_to_ptr(PhysAddr::new(entry)), sdt_len)
            });
        }
        off += stride;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn madt_with_cpus(cpus: &[(u8, u8, u32)]) -> Vec<u8> {
        let mut t = vec![0u8; 44];
        t[0..4].copy_from_slice(b"APIC");
        t[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        for &(acpi, lapic, flags) in cpus {
            t.extend_from_slice(&[0, 8, acpi, lapic]);
            t.extend_from_slice(&flags.to_le_bytes());
        }
        // A foreign entry type the parser must step over.
        t.extend_from_slice(&[1, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        t
    }

    #[test]
    fn madt_yields_lapic_base_and_cpus() {
        let table = madt_with_cpus(&[(0, 0, 1), (1, 1, 1), (2, 2, 0)]);
        let (base, cpus) = parse_madt(&table).unwrap();
        assert_eq!(base, 0xFEE0_0000);
        assert_eq!(cpus.len(), 3);
        assert!(cpus[0].enabled && cpus[1].enabled);
        assert!(!cpus[2].enabled);
        assert_eq!(cpus[1].lapic_id, 1);
    }

    #[test]
    fn madt_rejects_wrong_signature() {
        let mut table = madt_with_cpus(&[(0, 0, 1)]);
        table[0..4].copy_from_slice(b"FACP");
        assert!(parse_madt(&table).is_none());
    }

    #[test]
    fn trampoline_patching_replaces_marker() {
        let mut blob = vec![0x90u8, 0x90, 0x77, 0x77, 0x77, 0x77, 0xEB, 0xFE];
        assert!(patch_trampoline(&mut blob, 0x3F_E000));
        assert_eq!(&blob[2..6], &0x003F_E000u32.to_le_bytes());

        let mut plain = vec![0x90u8; 16];
        assert!(!patch_trampoline(&mut plain, 0x1000));
    }
}
