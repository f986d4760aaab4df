//! ELF64 loading for `execve`: header validation, demand-paged segment
//! VMAs and the initial user stack image.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::fs::node::{FsOps, Node};
use crate::memory::memregion::{BackingStore, MemRegion, Prot, RegionFlags, RegionType};
use crate::memory::PAGE_SIZE;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Where position-independent executables get based.
const DYN_BASE: u64 = 0x0000_0000_4000_0000;

/// Top of the user stack and its rlimit.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_0000;
pub const RLIMIT_STACK: u64 = 8 * 1024 * 1024;
const INITIAL_STACK_PAGES: u64 = 8;

/// One read/exec page mapped into every image; holds the signal-return
/// trampoline handlers come back through.
pub const VDSO_BASE: u64 = 0x0000_7FFF_F000_0000;

/// `mov rax, SYS_SIGRETURN; int 0x80`.
pub const SIGRETURN_TRAMPOLINE: [u8; 9] =
    [0x48, 0xC7, 0xC0, 0x0F, 0x00, 0x00, 0x00, 0xCD, 0x80];

#[derive(Debug)]
pub struct Elf64Ehdr {
    pub e_type: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl Elf64Ehdr {
    /// Validate class, endianness, machine and type per the exec
    /// contract; anything else is ENOEXEC.
    pub fn parse(data: &[u8]) -> KResult<Self> {
        if data.len() < 64 || data[0..4] != ELF_MAGIC {
            return Err(Errno::ENOEXEC);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(Errno::ENOEXEC);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(Errno::ENOEXEC);
        }
        if e_machine != EM_X86_64 {
            return Err(Errno::ENOEXEC);
        }
        Ok(Elf64Ehdr {
            e_type,
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }

    pub fn load_bias(&self) -> u64 {
        if self.e_type == ET_DYN {
            DYN_BASE
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl Elf64Phdr {
    pub fn parse(data: &[u8]) -> KResult<Self> {
        if data.len() < 56 {
            return Err(Errno::ENOEXEC);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    pub fn prot(&self) -> Prot {
        let mut p = Prot::empty();
        if self.p_flags & PF_R != 0 {
            p |= Prot::READ;
        }
        if self.p_flags & PF_W != 0 {
            p |= Prot::WRITE;
        }
        if self.p_flags & PF_X != 0 {
            p |= Prot::EXEC;
        }
        p
    }
}

pub fn parse_phdrs(image: &[u8], ehdr: &Elf64Ehdr) -> KResult<Vec<Elf64Phdr>> {
    let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let end = off + ehdr.e_phentsize as usize;
        if end > image.len() {
            return Err(Errno::ENOEXEC);
        }
        phdrs.push(Elf64Phdr::parse(&image[off..end])?);
    }
    Ok(phdrs)
}

/// File-backed page source for demand-paged text/data segments.
pub struct NodeBacking {
    pub node: Arc<Node>,
    pub ops: Arc<dyn FsOps>,
}

impl BackingStore for NodeBacking {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> KResult<usize> {
        self.ops.read(&self.node, off, buf)
    }
}

/// Build the demand-paged VMAs for the PT_LOAD segments plus the stack.
/// Returns `(regions, entry, stack_region_index)`.
pub fn build_regions(
    ehdr: &Elf64Ehdr,
    phdrs: &[Elf64Phdr],
    backing: Option<Arc<dyn BackingStore>>,
) -> KResult<(Vec<MemRegion>, u64)> {
    let bias = ehdr.load_bias();
    let mut regions: Vec<MemRegion> = Vec::new();

    for ph in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        if ph.p_memsz == 0 {
            continue;
        }
        let start = (ph.p_vaddr + bias) & !(PAGE_SIZE - 1);
        let end = (ph.p_vaddr + bias + ph.p_memsz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if start >= USER_STACK_TOP {
            return Err(Errno::ENOEXEC);
        }
        let rtype = if ph.prot().contains(Prot::EXEC) {
            RegionType::Text
        } else {
            RegionType::Data
        };
        let mut region = MemRegion::anon(
            start,
            end,
            ph.prot(),
            RegionFlags::PRIVATE | RegionFlags::USER | RegionFlags::DEMAND,
            rtype,
        );
        // Fault-in reads the file page containing the segment start.
        if ph.p_filesz > 0 {
            region.backing = backing.clone();
            region.file_off = ph.p_offset - (ph.p_vaddr + bias - start);
        }
        regions.push(region);
    }

    if regions.is_empty() {
        return Err(Errno::ENOEXEC);
    }

    let mut stack = MemRegion::anon(
        USER_STACK_TOP - INITIAL_STACK_PAGES * PAGE_SIZE,
        USER_STACK_TOP,
        Prot::READ | Prot::WRITE,
        RegionFlags::PRIVATE | RegionFlags::USER | RegionFlags::GROWS_DOWN,
        RegionType::Stack,
    );
    stack.backing = None;
    regions.push(stack);

    regions.push(MemRegion::anon(
        VDSO_BASE,
        VDSO_BASE + PAGE_SIZE,
        Prot::READ | Prot::EXEC,
        RegionFlags::PRIVATE | RegionFlags::USER,
        RegionType::Text,
    ));

    Ok((regions, ehdr.e_entry + bias))
}

/// The initial user stack image per the SysV ABI: strings at the top,
/// then NULL-terminated envp and argv pointer arrays, then argc at the
/// final RSP. Returns `(image, rsp)`; the image occupies
/// `[rsp, stack_top)`.
pub fn build_stack_image(argv: &[String], envp: &[String], stack_top: u64) -> (Vec<u8>, u64) {
    // Lay strings out downward from the top.
    let mut string_bytes: Vec<u8> = Vec::new();
    let mut argv_offsets = Vec::with_capacity(argv.len());
    let mut envp_offsets = Vec::with_capacity(envp.len());

    for s in argv.iter().chain(envp.iter()) {
        if argv_offsets.len() < argv.len() {
            argv_offsets.push(string_bytes.len());
        } else {
            envp_offsets.push(string_bytes.len());
        }
        string_bytes.extend_from_slice(s.as_bytes());
        string_bytes.push(0);
    }

    let strings_base = stack_top - string_bytes.len() as u64;
    // Pointer area: argc + argv[] + NULL + envp[] + NULL, 16-aligned.
    let ptr_count = 1 + argv.len() + 1 + envp.len() + 1;
    let mut rsp = strings_base - (ptr_count as u64) * 8;
    rsp &= !0xF;

    let image_len = (stack_top - rsp) as usize;
    let mut image = alloc::vec![0u8; image_len];

    let put = |image: &mut [u8], at: u64, val: u64| {
        let off = (at - rsp) as usize;
        image[off..off + 8].copy_from_slice(&val.to_le_bytes());
    };

    let mut cursor = rsp;
    put(&mut image, cursor, argv.len() as u64); // argc
    cursor += 8;
    for off in &argv_offsets {
        put(&mut image, cursor, strings_base + *off as u64);
        cursor += 8;
    }
    put(&mut image, cursor, 0);
    cursor += 8;
    for off in &envp_offsets {
        put(&mut image, cursor, strings_base + *off as u64);
        cursor += 8;
    }
    put(&mut image, cursor, 0);

    let strings_at = (strings_base - rsp) as usize;
    image[strings_at..].copy_from_slice(&string_bytes);

    (image, rsp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn minimal_elf(e_type: u16) -> Vec<u8> {
        let mut data = alloc::vec![0u8; 64 + 56];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&e_type.to_le_bytes());
        data[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        data[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        data[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

        // One PT_LOAD: vaddr 0x400000, filesz 0x800, memsz 0x1800, RX.
        let ph = &mut data[64..];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        ph[8..16].copy_from_slice(&0u64.to_le_bytes());
        ph[16..24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        ph[32..40].copy_from_slice(&0x800u64.to_le_bytes());
        ph[40..48].copy_from_slice(&0x1800u64.to_le_bytes());
        data
    }

    #[test]
    fn header_validation_accepts_exec_and_dyn() {
        assert!(Elf64Ehdr::parse(&minimal_elf(ET_EXEC)).is_ok());
        assert!(Elf64Ehdr::parse(&minimal_elf(ET_DYN)).is_ok());

        let mut bad = minimal_elf(ET_EXEC);
        bad[18] = 0x03; // not x86_64
        assert_eq!(Elf64Ehdr::parse(&bad).unwrap_err(), Errno::ENOEXEC);

        let mut rel = minimal_elf(1); // ET_REL
        rel[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        assert_eq!(Elf64Ehdr::parse(&rel).unwrap_err(), Errno::ENOEXEC);
    }

    #[test]
    fn regions_cover_segments_and_stack() {
        let image = minimal_elf(ET_EXEC);
        let ehdr = Elf64Ehdr::parse(&image).unwrap();
        let phdrs = parse_phdrs(&image, &ehdr).unwrap();
        let (regions, entry) = build_regions(&ehdr, &phdrs, None).unwrap();

        assert_eq!(entry, 0x40_1000);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].start, 0x40_0000);
        // 0x1800 memsz rounds to two pages.
        assert_eq!(regions[0].end, 0x40_2000);
        assert!(regions[0].flags.contains(RegionFlags::DEMAND));
        assert_eq!(regions[1].rtype, RegionType::Stack);
        assert!(regions[1].flags.contains(RegionFlags::GROWS_DOWN));
        assert_eq!(regions[2].start, VDSO_BASE);
        assert!(regions[2].prot.contains(Prot::EXEC));
    }

    #[test]
    fn dyn_binaries_get_rebased() {
        let image = minimal_elf(ET_DYN);
        let ehdr = Elf64Ehdr::parse(&image).unwrap();
        let phdrs = parse_phdrs(&image, &ehdr).unwrap();
        let (regions, entry) = build_regions(&ehdr, &phdrs, None).unwrap();
        assert_eq!(entry, DYN_BASE + 0x40_1000);
        assert_eq!(regions[0].start, DYN_BASE + 0x40_0000);
    }

    #[test]
    fn stack_image_layout_is_readable_back() {
        let argv = alloc::vec!["init".to_string(), "target=qemu".to_string()];
        let envp = alloc::vec!["PATH=/bin".to_string()];
        let top = USER_STACK_TOP;
        let (image, rsp) = build_stack_image(&argv, &envp, top);

        assert_eq!(rsp % 16, 0);
        let read_u64 = |at: u64| {
            let off = (at - rsp) as usize;
            u64::from_le_bytes(image[off..off + 8].try_into().unwrap())
        };

        assert_eq!(read_u64(rsp), 2); // argc
        let argv0 = read_u64(rsp + 8);
        let argv1 = read_u64(rsp + 16);
        assert_eq!(read_u64(rsp + 24), 0); // argv NULL
        let envp0 = read_u64(rsp + 32);
        assert_eq!(read_u64(rsp + 40), 0); // envp NULL

        let cstr = |at: u64| {
            let off = (at - rsp) as usize;
            let end = image[off..].iter().position(|&b| b == 0).unwrap();
            core::str::from_utf8(&image[off..off + end]).unwrap().to_string()
        };
        assert_eq!(cstr(argv0), "init");
        assert_eq!(cstr(argv1), "target=qemu");
        assert_eq!(cstr(envp0), "PATH=/bin");
    }
}
