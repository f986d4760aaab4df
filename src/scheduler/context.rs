use core::arch::naked_asm;
use core::sync::atomic::{AtomicBool, Ordering};

/// CPU register context saved/restored during context switches.
/// All callee-saved registers on the x86_64 System V ABI.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context for a fresh task: `entry` with a 16-byte aligned stack.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        let aligned_sp = (stack_top - 8) & !0xF;
        Context {
            rsp: aligned_sp,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry,
        }
    }
}

/// FPU/SSE save area. Sized for XSAVE with the legacy + AVX components;
/// `fxsave64` only touches the first 512 bytes.
#[repr(C, align(64))]
pub struct FpuState {
    bytes: [u8; 1024],
}

impl FpuState {
    pub const fn new() -> Self {
        FpuState { bytes: [0; 1024] }
    }
}

/// Set during boot when CPUID reports XSAVE support.
pub static XSAVE_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Save the current FPU/SSE state into `state`.
///
/// # Safety
/// `state` must be a valid, 64-byte aligned save area.
#[cfg(not(test))]
pub unsafe fn save_fpu(state: *mut FpuState) {
    if XSAVE_AVAILABLE.load(Ordering::Relaxed) {
        core::arch::asm!(
            "xsave64 [{}]",
            in(reg) state,
            in("eax") u32::MAX,
            in("edx") u32::MAX,
        );
    } else {
        core::arch::asm!("fxsave64 [{}]", in(reg) state);
    }
}

/// Restore FPU/SSE state from `state`.
///
/// # Safety
/// `state` must hold a save area written by `save_fpu`.
#[cfg(not(test))]
pub unsafe fn restore_fpu(state: *const FpuState) {
    if XSAVE_AVAILABLE.load(Ordering::Relaxed) {
        core::arch::asm!(
            "xrstor64 [{}]",
            in(reg) state,
            in("eax") u32::MAX,
            in("edx") u32::MAX,
        );
    } else {
        core::arch::asm!("fxrstor64 [{}]", in(reg) state);
    }
}

#[cfg(test)]
pub unsafe fn save_fpu(_state: *mut FpuState) {}

#[cfg(test)]
pub unsafe fn restore_fpu(_state: *const FpuState) {}

/// Switch context from `old` to `new`: save callee-saved registers into
/// `old`, restore from `new`.
///
/// # Safety
/// Both pointers must be valid contexts with live stacks; the scheduler
/// lock must not be held across the call.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// Restore a context without saving the current one (used when the
/// outgoing task is dead).
///
/// # Safety
/// The context pointer must be valid.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}
