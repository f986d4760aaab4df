//! PCI configuration space, access mechanism #1 (ports 0xCF8/0xCFC).

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const ENABLE: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    None,
    Io {
        base: u32,
        size: u32,
    },
    Memory32 {
        base: u32,
        size: u32,
        prefetch: bool,
    },
    Memory64 {
        base: u64,
        size: u64,
        prefetch: bool,
    },
}

#[derive(Debug, Clone)]
pub struct PciDevice {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub irq_line: u8,
    pub bars: [Bar; 6],
}

fn config_key(bus: u8, slot: u8, function: u8, offset: u8) -> u32 {
    ENABLE
        | ((bus as u32) << 16)
        | ((slot as u32) << 11)
        | ((function as u32) << 8)
        | (offset as u32 & 0xFC)
}

pub fn config_read32(bus: u8, slot: u8, function: u8, offset: u8) -> u32 {
    let mut addr: Port<u32> = Port::new(CONFIG_ADDRESS);
    let mut data: Port<u32> = Port::new(CONFIG_DATA);
    unsafe {
        addr.write(config_key(bus, slot, function, offset));
        data.read()
    }
}

pub fn config_read16(bus: u8, slot: u8, function: u8, offset: u8) -> u16 {
    let dword = config_read32(bus, slot, function, offset);
    (dword >> ((offset as u32 & 2) * 8)) as u16
}

pub fn config_read8(bus: u8, slot: u8, function: u8, offset: u8) -> u8 {
    let dword = config_read32(bus, slot, function, offset);
    (dword >> ((offset as u32 & 3) * 8)) as u8
}

pub fn config_write32(bus: u8, slot: u8, function: u8, offset: u8, value: u32) {
    let mut addr: Port<u32> = Port::new(CONFIG_ADDRESS);
    let mut data: Port<u32> = Port::new(CONFIG_DATA);
    unsafe {
        addr.write(config_key(bus, slot, function, offset));
        data.write(value);
    }
}

pub fn config_write16(bus: u8, slot: u8, function: u8, offset: u8, value: u16) {
    let shift = (offset as u32 & 2) * 8;
    let old = config_read32(bus, slot, function, offset);
    let merged = (old & !(0xFFFF << shift)) | ((value as u32) << shift);
    config_write32(bus, slot, function, offset, merged);
}

/// Decode one BAR register pair into its kind, base and size, using the
/// write-all-ones probe. Restores the original value. Returns the BAR
/// and how many registers it consumed (64-bit memory BARs take two).
pub fn decode_bar_raw(low: u32, mask_low: u32, high: Option<(u32, u32)>) -> (Bar, usize) {
    if mask_low == 0 {
        return (Bar::None, 1);
    }
    if low & 1 != 0 {
        // I/O space: bits 2.. hold the address.
        let size = !(mask_low & !0x3) + 1;
        return (
            Bar::Io {
                base: low & !0x3,
                size,
            },
            1,
        );
    }
    let prefetch = low & 0x8 != 0;
    match (low >> 1) & 0x3 {
        0x2 => {
            // 64-bit: the next register holds the upper half.
            let (high_val, high_mask) = high.unwrap_or((0, !0));
            let mask = ((high_mask as u64) << 32) | (mask_low & !0xF) as u64;
            let size = !mask + 1;
            (
                Bar::Memory64 {
                    base: ((high_val as u64) << 32) | (low & !0xF) as u64,
                    size,
                    prefetch,
                },
                2,
            )
        }
        _ => {
            let size = !(mask_low & !0xF) + 1;
            (
                Bar::Memory32 {
                    base: low & !0xF,
                    size,
                    prefetch,
                },
                1,
            )
        }
    }
}

fn probe_bars(bus: u8, slot: u8, function: u8) -> [Bar; 6] {
    let mut bars = [Bar::None; 6];
    let mut i = 0;
    while i < 6 {
        let offset = 0x10 + (i as u8) * 4;
        let original = config_read32(bus, slot, function, offset);
        config_write32(bus, slot, function, offset, !0);
        let mask = config_read32(bus, slot, function, offset);
        config_write32(bus, slot, function, offset, original);

        let high = if (original & 1) == 0 && ((original >> 1) & 0x3) == 0x2 && i < 5 {
            let hoff = offset + 4;
            let horig = config_read32(bus, slot, function, hoff);
            config_write32(bus, slot, function, hoff, !0);
            let hmask = config_read32(bus, slot, function, hoff);
            config_write32(bus, slot, function, hoff, horig);
            Some((horig, hmask))
        } else {
            None
        };

        let (bar, consumed) = decode_bar_raw(original, mask, high);
        bars[i] = bar;
        i += consumed;
    }
    bars
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<PciDevice>> = Mutex::new(Vec::new());
}

/// Walk every bus/slot/function and record what answers.
pub fn scan() {
    let mut found = Vec::new();
    for bus in 0..=255u16 {
        for slot in 0..32u8 {
            for function in 0..8u8 {
                let bus = bus as u8;
                let vendor = config_read16(bus, slot, function, 0x00);
                if vendor == 0xFFFF {
                    if function == 0 {
                        break;
                    }
                    continue;
                }
                let device = config_read16(bus, slot, function, 0x02);
                let class_dword = config_read32(bus, slot, function, 0x08);
                found.push(PciDevice {
                    bus,
                    slot,
                    function,
                    vendor,
                    device,
                    class: (class_dword >> 24) as u8,
                    subclass: (class_dword >> 16) as u8,
                    prog_if: (class_dword >> 8) as u8,
                    irq_line: config_read8(bus, slot, function, 0x3C),
                    bars: probe_bars(bus, slot, function),
                });

                // Single-function devices say so in the header type.
                if function == 0 {
                    let header = config_read8(bus, slot, 0, 0x0E);
                    if header & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }
    crate::log_info!("pci: {} function(s) found", found.len());
    *DEVICES.lock() = found;
}

pub fn devices_snapshot() -> Vec<PciDevice> {
    DEVICES.lock().clone()
}

/// Driver matching by `(class, subclass)`.
pub fn find_by_class(class: u8, subclass: u8) -> Vec<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .filter(|d| d.class == class && d.subclass == subclass)
        .cloned()
        .collect()
}

/// Driver matching by `(vendor, device)`.
pub fn find_by_id(vendor: u16, device: u16) -> Option<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .find(|d| d.vendor == vendor && d.device == device)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_bar_decodes_base_and_size() {
        // 0x0000C001: I/O BAR at 0xC000; probe answered with size 32.
        let (bar, used) = decode_bar_raw(0x0000_C001, 0xFFFF_FFE1, None);
        assert_eq!(used, 1);
        assert_eq!(
            bar,
            Bar::Io {
                base: 0xC000,
                size: 32
            }
        );
    }

    #[test]
    fn mem32_bar_decodes() {
        // Memory BAR at 0xFEB0_0000, 1 MiB, non-prefetchable.
        let (bar, used) = decode_bar_raw(0xFEB0_0000, 0xFFF0_0000, None);
        assert_eq!(used, 1);
        assert_eq!(
            bar,
            Bar::Memory32 {
                base: 0xFEB0_0000,
                size: 1 << 20,
                prefetch: false
            }
        );
    }

    #[test]
    fn mem64_bar_takes_two_registers() {
        let low = 0x0000_000C; // 64-bit, prefetchable, base low 0
        let (bar, used) = decode_bar_raw(low, 0xFFFF_C00C, Some((0x0000_0001, 0xFFFF_FFFF)));
        assert_eq!(used, 2);
        match bar {
            Bar::Memory64 {
                base,
                size,
                prefetch,
            } => {
                assert_eq!(base, 1 << 32);
                assert_eq!(size, 0x4000);
                assert!(prefetch);
            }
            other => panic!("wrong decode: {:?}", other),
        }
    }

    #[test]
    fn unimplemented_bar_is_none() {
        let (bar, _) = decode_bar_raw(0, 0, None);
        assert_eq!(bar, Bar::None);
    }
}
