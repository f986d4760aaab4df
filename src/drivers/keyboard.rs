//! PS/2 keyboard intake. The IRQ handler pushes raw scancodes into a
//! lock-free ring; draining happens right after in interrupt tail
//! context, feeding the active tty's line discipline.

use core::sync::atomic::{AtomicUsize, Ordering};

use x86_64::instructions::port::Port;

const BUFFER_SIZE: usize = 256;

pub struct ScancodeRing {
    buffer: [u8; BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl ScancodeRing {
    pub const fn new() -> Self {
        ScancodeRing {
            buffer: [0; BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, code: u8) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let next = (head + 1) % BUFFER_SIZE;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // Single producer (the IRQ handler); the atomic head/tail pair
        // orders the slot write against the consumer.
        unsafe {
            let slot = self.buffer.as_ptr().add(head) as *mut u8;
            *slot = code;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let code = self.buffer[tail];
        self.tail.store((tail + 1) % BUFFER_SIZE, Ordering::Release);
        Some(code)
    }
}

pub static SCANCODES: ScancodeRing = ScancodeRing::new();

/// IRQ1 body: read the controller, queue the scancode.
pub fn irq_handler() {
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };
    SCANCODES.push(scancode);
    drain();
}

/// Feed everything queued into the active tty.
pub fn drain() {
    while let Some(code) = SCANCODES.pop() {
        crate::tty::handle_scancode(code);
    }
}

pub fn init() {
    // Flush a stale byte left by the 8042 during boot.
    let mut port: Port<u8> = Port::new(0x60);
    let _ = unsafe { port.read() };
    crate::log_info!("keyboard: PS/2 intake ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo_and_bounded() {
        let ring = ScancodeRing::new();
        assert!(ring.pop().is_none());
        for i in 0..10u8 {
            assert!(ring.push(i));
        }
        for i in 0..10u8 {
            assert_eq!(ring.pop(), Some(i));
        }

        // Capacity is one less than the buffer.
        for i in 0..BUFFER_SIZE {
            let ok = ring.push(i as u8);
            assert_eq!(ok, i < BUFFER_SIZE - 1);
        }
    }
}
