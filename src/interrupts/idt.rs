use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::gdt;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// Per-vector counters for `/proc/interrupts`.
pub static TIMER_COUNT: AtomicU64 = AtomicU64::new(0);
pub static KEYBOARD_COUNT: AtomicU64 = AtomicU64::new(0);
pub static TLB_IPI_COUNT: AtomicU64 = AtomicU64::new(0);
pub static PAGE_FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);

        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);

        // Cross-core coordination vectors.
        idt[crate::smp::lapic::TLB_IPI_VECTOR as usize].set_handler_fn(tlb_ipi_handler);
        idt[crate::smp::lapic::HALT_IPI_VECTOR as usize].set_handler_fn(halt_ipi_handler);
        idt[crate::smp::lapic::TIMER_VECTOR as usize].set_handler_fn(lapic_timer_handler);

        // Syscall gate, reachable from ring 3.
        unsafe {
            idt[0x80]
                .set_handler_addr(x86_64::VirtAddr::new(
                    crate::interrupts::usermode::syscall_handler_asm as usize as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

/// APs load the same shared table.
pub fn load() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::log_warn!("int3 at {:?}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fault_or_panic(crate::signals::SIGILL, stack_frame.instruction_pointer.as_u64(), "invalid opcode");
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fault_or_panic(crate::signals::SIGFPE, stack_frame.instruction_pointer.as_u64(), "divide error");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    let user = stack_frame.code_segment & 3 == 3;
    if user {
        fault_or_panic(
            crate::signals::SIGSEGV,
            stack_frame.instruction_pointer.as_u64(),
            "gpf",
        );
    } else {
        panic!(
            "GENERAL PROTECTION FAULT ({:#x})\n{:#?}",
            error_code, stack_frame
        );
    }
}

/// Synchronous-fault delivery: SEGV/FPE/ILL go straight to the current
/// task with the faulting address; a fault with no task is a kernel bug.
fn fault_or_panic(signo: i32, addr: u64, what: &str) {
    match crate::scheduler::current() {
        Some(task) if !task.kernel_task => {
            crate::signals::send_signal(
                &task,
                signo,
                Some(crate::signals::SigInfo::fault(signo, addr)),
            );
        }
        _ => panic!("{} in kernel context at {:#x}", what, addr),
    }
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    PAGE_FAULT_COUNT.fetch_add(1, Ordering::Relaxed);

    let addr = Cr2::read().as_u64();
    let fault = crate::memory::fault::PageFault {
        addr,
        write: error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
        present: error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
    };

    if !crate::memory::paging::is_user_addr(addr) {
        // Demand-paged kernel regions fill in on first touch.
        let mut space = crate::memory::kernel_space().lock();
        let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
        if crate::memory::fault::handle_kernel_fault(addr, &mut space, &mut *pmm) {
            return;
        }
        panic!(
            "kernel page fault at {:#x} ({:?})\n{:#?}",
            addr, error_code, stack_frame
        );
    }

    let task = match crate::scheduler::current() {
        Some(t) => t,
        None => panic!("page fault with no current task at {:#x}", addr),
    };

    let outcome = {
        let user = task.user.lock();
        match user.as_ref() {
            Some(user_space) => {
                let mut mem = user_space.mem.lock();
                let mut space = user_space.space.lock();
                let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
                crate::memory::fault::handle_user_fault(
                    fault,
                    &mut mem,
                    &mut space,
                    &mut *pmm,
                    crate::loader::elf::RLIMIT_STACK,
                )
            }
            None => crate::memory::fault::FaultOutcome::Segv,
        }
    };

    match outcome {
        crate::memory::fault::FaultOutcome::Resolved => {}
        crate::memory::fault::FaultOutcome::Segv => {
            fault_or_panic(crate::signals::SIGSEGV, addr, "page fault");
        }
        crate::memory::fault::FaultOutcome::OutOfMemory => {
            crate::log_warn!("oom resolving fault at {:#x}; killing task", addr);
            crate::signals::send_signal(&task, crate::signals::SIGKILL, None);
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    TIMER_COUNT.fetch_add(1, Ordering::Relaxed);
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    crate::time::timer_tick();
}

extern "x86-interrupt" fn lapic_timer_handler(_stack_frame: InterruptStackFrame) {
    crate::smp::lapic::eoi();
    crate::scheduler::preempt_tick();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    KEYBOARD_COUNT.fetch_add(1, Ordering::Relaxed);
    crate::drivers::keyboard::irq_handler();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn tlb_ipi_handler(_stack_frame: InterruptStackFrame) {
    TLB_IPI_COUNT.fetch_add(1, Ordering::Relaxed);
    crate::smp::handle_tlb_ipi();
    crate::smp::lapic::eoi();
}

extern "x86-interrupt" fn halt_ipi_handler(_stack_frame: InterruptStackFrame) {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
