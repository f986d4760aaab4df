pub mod gdt;
pub mod idt;
pub mod usermode;

use alloc::format;
use alloc::string::String;
use core::sync::atomic::Ordering;

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}

/// `/proc/interrupts` content.
pub fn interrupt_counts() -> String {
    format!(
        "timer:     {}\nkeyboard:  {}\ntlb-ipi:   {}\npagefault: {}\n",
        idt::TIMER_COUNT.load(Ordering::Relaxed),
        idt::KEYBOARD_COUNT.load(Ordering::Relaxed),
        idt::TLB_IPI_COUNT.load(Ordering::Relaxed),
        idt::PAGE_FAULT_COUNT.load(Ordering::Relaxed),
    )
}
