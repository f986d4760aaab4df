#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod boot;
pub mod drivers;
pub mod errno;
pub mod fs;
pub mod interrupts;
pub mod ipc;
pub mod loader;
pub mod memory;
pub mod net;
pub mod pci;
pub mod scheduler;
pub mod serial;
pub mod signals;
pub mod smp;
pub mod syscalls;
pub mod time;
pub mod tty;

#[cfg(not(test))]
use alloc::string::String;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Kernel entry, reached from the boot stub with the multiboot
/// information pointer in RDI.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(mbi_addr: usize) -> ! {
    serial::init();
    interrupts::init();
    log_info!("Argon kernel starting");

    unsafe { memory::init(mbi_addr) };
    let boot_info = unsafe { boot::parse(mbi_addr) };

    #[cfg(not(test))]
    smp::init(&boot_info);

    scheduler::init();
    syscalls::init();
    fs::init();
    tty::init();
    drivers::init();
    pci::scan();
    net::init();

    log_info!("Argon core online; starting init");
    spawn_init(&boot_info.cmdline);

    x86_64::instructions::interrupts::enable();
    scheduler::idle_loop();
}

/// Exec `/bin/init`, passing `target=` from the command line through as
/// its argument the way the loader handed it to us.
#[cfg(not(test))]
fn spawn_init(cmdline: &boot::BootConfig) {
    let mut argv = alloc::vec![String::from("/bin/init")];
    if let Some(target) = &cmdline.target {
        argv.push(alloc::format!("target={}", target));
    }
    let envp = alloc::vec![String::from("HOME=/"), String::from("TERM=argon")];

    if let Err(e) = loader::sys_exec("/bin/init", argv, envp) {
        log_warn!("init did not start ({}); staying in the idle loop", e);
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // Stop the other cores first so the report is not interleaved.
    smp::halt_other_cores();
    serial::_print_force(format_args!("\n[PANIC] {}\n", info));
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
