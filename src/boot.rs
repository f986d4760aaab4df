//! Multiboot2 handoff parsing.
//!
//! The loader (GRUB) leaves a multiboot information structure in low
//! memory; we pull out the pieces the kernel actually consumes: the
//! memory map, the command line, the ACPI RSDP and the framebuffer
//! descriptor. Everything else is tolerated and ignored.

use alloc::string::String;
use alloc::vec::Vec;

/// Physical memory range usable as RAM.
#[derive(Debug, Clone, Copy)]
pub struct RamRange {
    pub start: u64,
    pub end: u64,
}

/// Framebuffer pixel format, as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbKind {
    Palette,
    Rgb {
        red_pos: u8,
        red_size: u8,
        green_pos: u8,
        green_size: u8,
        blue_pos: u8,
        blue_size: u8,
    },
    EgaText,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub address: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub kind: FbKind,
}

/// Everything the rest of the kernel needs from the boot handoff.
pub struct BootInfo {
    pub ram: Vec<RamRange>,
    pub cmdline: BootConfig,
    pub rsdp_addr: Option<u64>,
    pub framebuffer: Option<FramebufferInfo>,
}

/// Parsed kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    /// `nosmp` — keep the APs parked.
    pub nosmp: bool,
    /// `target=<string>` — propagated to init.
    pub target: Option<String>,
    /// `root=<devspec>` — root device specification.
    pub root: Option<String>,
}

/// Tokenize the command line. Tokens are whitespace-separated; unknown
/// ones are tolerated.
pub fn parse_cmdline(cmdline: &str) -> BootConfig {
    let mut cfg = BootConfig::default();

    for token in cmdline.split_whitespace() {
        if token == "nosmp" {
            cfg.nosmp = true;
        } else if let Some(value) = token.strip_prefix("target=") {
            cfg.target = Some(String::from(value));
        } else if let Some(value) = token.strip_prefix("root=") {
            cfg.root = Some(String::from(value));
        }
    }

    cfg
}

/// Load and digest the multiboot information structure.
///
/// # Safety
/// `mbi_addr` must point at a valid multiboot2 information structure
/// that remains mapped for the duration of this call.
pub unsafe fn parse(mbi_addr: usize) -> BootInfo {
    let info = multiboot2::BootInformation::load(mbi_addr as *const _)
        .expect("invalid multiboot2 information structure");

    let mut ram = Vec::new();
    if let Some(map) = info.memory_map_tag() {
        for area in map.memory_areas() {
            if area.typ() == multiboot2::MemoryAreaType::Available {
                ram.push(RamRange {
                    start: area.start_address(),
                    end: area.end_address(),
                });
            }
        }
    }

    let cmdline = info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .map(parse_cmdline)
        .unwrap_or_default();

    // Prefer ACPI 2.0 when both revisions are present.
    let rsdp_addr = if let Some(v2) = info.rsdp_v2_tag() {
        Some(v2 as *const _ as u64)
    } else {
        info.rsdp_v1_tag().map(|v1| v1 as *const _ as u64)
    };

    let framebuffer = info.framebuffer_tag().and_then(|tag| tag.ok()).map(|fb| {
        let kind = match fb.buffer_type() {
            Ok(multiboot2::FramebufferType::Indexed { .. }) => FbKind::Palette,
            Ok(multiboot2::FramebufferType::RGB { red, green, blue }) => FbKind::Rgb {
                red_pos: red.position,
                red_size: red.size,
                green_pos: green.position,
                green_size: green.size,
                blue_pos: blue.position,
                blue_size: blue.size,
            },
            _ => FbKind::EgaText,
        };
        FramebufferInfo {
            address: fb.address(),
            pitch: fb.pitch(),
            width: fb.width(),
            height: fb.height(),
            bpp: fb.bpp(),
            kind,
        }
    });

    BootInfo {
        ram,
        cmdline,
        rsdp_addr,
        framebuffer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_recognized_tokens() {
        let cfg = parse_cmdline("nosmp target=qemu root=hda1");
        assert!(cfg.nosmp);
        assert_eq!(cfg.target.as_deref(), Some("qemu"));
        assert_eq!(cfg.root.as_deref(), Some("hda1"));
    }

    #[test]
    fn cmdline_tolerates_unknown_tokens() {
        let cfg = parse_cmdline("quiet splash debug=3 root=sda2");
        assert!(!cfg.nosmp);
        assert_eq!(cfg.target, None);
        assert_eq!(cfg.root.as_deref(), Some("sda2"));
    }

    #[test]
    fn cmdline_empty() {
        assert_eq!(parse_cmdline(""), BootConfig::default());
    }
}
