use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::smp::percpu::MAX_CPUS;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Double-fault handler stacks, one per CPU.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACKS: [[u8; DF_STACK_SIZE]; MAX_CPUS] = [[0; DF_STACK_SIZE]; MAX_CPUS];

/// Early kernel stacks used until the scheduler assigns real ones.
const KERNEL_STACK_SIZE: usize = 4096 * 5;
static mut KERNEL_STACKS: [[u8; KERNEL_STACK_SIZE]; MAX_CPUS] = [[0; KERNEL_STACK_SIZE]; MAX_CPUS];

lazy_static! {
    static ref TSS: [TaskStateSegment; MAX_CPUS] = {
        let mut tss: [TaskStateSegment; MAX_CPUS] =
            core::array::from_fn(|_| TaskStateSegment::new());
        for (cpu, entry) in tss.iter_mut().enumerate() {
            entry.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                let start = VirtAddr::from_ptr(unsafe { &raw const DF_STACKS[cpu] });
                start + DF_STACK_SIZE as u64
            };
            entry.privilege_stack_table[0] = {
                let start = VirtAddr::from_ptr(unsafe { &raw const KERNEL_STACKS[cpu] });
                start + KERNEL_STACK_SIZE as u64
            };
        }
        tss
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

fn build_gdt(cpu: usize) -> (GlobalDescriptorTable, Selectors) {
    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
    let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
    let user_data = gdt.add_entry(Descriptor::user_data_segment());
    let user_code = gdt.add_entry(Descriptor::user_code_segment());
    let tss = gdt.add_entry(Descriptor::tss_segment(&TSS[cpu]));
    (
        gdt,
        Selectors {
            kernel_code,
            kernel_data,
            user_code,
            user_data,
            tss,
        },
    )
}

lazy_static! {
    /// One GDT per CPU; each TSS descriptor points at that CPU's TSS.
    pub static ref GDTS: [(GlobalDescriptorTable, Selectors); MAX_CPUS] =
        core::array::from_fn(build_gdt);
}

fn load_for(cpu: usize) {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDTS[cpu].0.load();
    unsafe {
        CS::set_reg(GDTS[cpu].1.kernel_code);
        DS::set_reg(GDTS[cpu].1.kernel_data);
        SS::set_reg(GDTS[cpu].1.kernel_data);
        load_tss(GDTS[cpu].1.tss);
    }
}

/// BSP setup.
pub fn init() {
    load_for(0);
}

/// Pre-stage an AP's TSS with the kernel stack allocated for it.
pub fn stage_ap(cpu: usize, kernel_stack_top: u64) {
    unsafe {
        let tss = &TSS[cpu] as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}

/// Called on the AP itself once it runs 64-bit code.
pub fn load_ap(cpu: usize) {
    load_for(cpu);
}

pub fn user_code_selector() -> SegmentSelector {
    SegmentSelector::new(
        GDTS[0].1.user_code.index(),
        x86_64::PrivilegeLevel::Ring3,
    )
}

pub fn user_data_selector() -> SegmentSelector {
    SegmentSelector::new(
        GDTS[0].1.user_data.index(),
        x86_64::PrivilegeLevel::Ring3,
    )
}

/// Point this CPU's TSS at the incoming task's kernel stack so ring
/// transitions land on it.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    let cpu = crate::smp::percpu::this_cpu_id();
    unsafe {
        // The CPU reads the TSS asynchronously; the write is a single
        // aligned store done with interrupts off during the switch.
        let tss = &TSS[cpu] as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}
