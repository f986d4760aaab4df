pub mod elf;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::fs::fd::{FileKind, O_RDONLY};
use crate::memory::memregion::TaskMem;
use crate::memory::paging::{AddressSpace, FrameProvider};
use crate::memory::PAGE_SIZE;
use crate::scheduler::UserSpace;

/// Executables larger than this are refused outright.
const MAX_IMAGE: usize = 8 * 1024 * 1024;

/// `execve`: replace the current task's image. Returns only on error.
pub fn sys_exec(path: &str, argv: Vec<String>, envp: Vec<String>) -> KResult<()> {
    let task = crate::scheduler::current().ok_or(Errno::ESRCH)?;

    let file = crate::fs::open_file(path, O_RDONLY)?;
    let node = match &file.kind {
        FileKind::Node(n) => n.clone(),
        _ => return Err(Errno::EACCES),
    };
    let ops = crate::fs::vfs::VFS.lock().ops_for(node.dev)?;

    // Pull the header + program headers in; segment payloads stay on
    // the node and fault in on demand.
    let mut header = alloc::vec![0u8; 4096];
    let n = ops.read(&node, 0, &mut header)?;
    header.truncate(n);
    let ehdr = elf::Elf64Ehdr::parse(&header)?;

    let phdrs_end = ehdr.e_phoff as usize + ehdr.e_phnum as usize * ehdr.e_phentsize as usize;
    if phdrs_end > MAX_IMAGE {
        return Err(Errno::ENOEXEC);
    }
    let image = if phdrs_end > header.len() {
        let mut full = alloc::vec![0u8; phdrs_end];
        ops.read(&node, 0, &mut full)?;
        full
    } else {
        header
    };
    let phdrs = elf::parse_phdrs(&image, &ehdr)?;

    let backing: Arc<dyn crate::memory::memregion::BackingStore> =
        Arc::new(elf::NodeBacking {
            node: node.clone(),
            ops,
        });
    let (regions, entry) = elf::build_regions(&ehdr, &phdrs, Some(backing))?;

    // Point of no return: tear down the old user image.
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    {
        let mut user = task.user.lock();
        if let Some(old) = user.take() {
            let mut mem = old.mem.lock();
            let mut space = old.space.lock();
            crate::memory::memregion::free_user_pages(&mut mem, &mut space, &mut *pmm);
            space.free_user_tables(&mut *pmm);
        }
    }

    let mut space = AddressSpace::new(&mut *pmm).ok_or(Errno::ENOMEM)?;
    // Lock order elsewhere is kernel-space before PMM; release the PMM
    // around the kernel-half copy.
    drop(pmm);
    space.copy_kernel_half_from(&crate::memory::kernel_space().lock());
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();

    let mut mem = TaskMem::new();
    for region in regions {
        mem.insert(region)?;
    }

    // The stack image and the vdso trampoline are written eagerly;
    // everything else demand-pages.
    let (stack_image, rsp) = elf::build_stack_image(&argv, &envp, elf::USER_STACK_TOP);
    write_user_bytes(&mut space, &mut *pmm, rsp, &stack_image, &mem)?;
    write_user_bytes(
        &mut space,
        &mut *pmm,
        elf::VDSO_BASE,
        &elf::SIGRETURN_TRAMPOLINE,
        &mem,
    )?;

    {
        let mut user = task.user.lock();
        *user = Some(UserSpace {
            mem: Arc::new(Mutex::new(mem)),
            space: Arc::new(Mutex::new(space)),
        });
    }
    drop(pmm);

    *task.name.lock() = String::from(path);
    task.actions.lock().reset_for_exec();
    task.signals.lock().clear_pending();
    task.files.lock().close_exec_slots(task.pid);

    {
        let user = task.user.lock();
        let space = user.as_ref().unwrap().space.lock();
        crate::smp::percpu::this_cpu()
            .active_pd
            .store(space.root_phys().as_u64(), core::sync::atomic::Ordering::Release);
        #[cfg(not(test))]
        unsafe {
            space.activate();
        }
    }

    crate::interrupts::usermode::jump_to_usermode(entry, rsp);
}

/// Materialize `[addr, addr + bytes.len())` in `space` and copy the
/// image in through the kernel window.
fn write_user_bytes(
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
    addr: u64,
    bytes: &[u8],
    mem: &TaskMem,
) -> KResult<()> {
    let mut off = 0usize;
    while off < bytes.len() {
        let va = addr + off as u64;
        let page = va & !(PAGE_SIZE - 1);
        let page_off = (va - page) as usize;
        let chunk = (PAGE_SIZE as usize - page_off).min(bytes.len() - off);

        let phys = match space.translate(page, frames) {
            Some(p) => p,
            None => {
                let region = mem.region_containing(va).ok_or(Errno::EFAULT)?;
                let (frame, _) = frames.alloc_frames(1).ok_or(Errno::ENOMEM)?;
                space
                    .map_page(page, frame, region.pte_flags(), frames)
                    .ok_or(Errno::ENOMEM)?;
                frame
            }
        };

        unsafe {
            let dst = frames.frame_ptr(phys).add(page_off);
            core::ptr::copy_nonoverlapping(bytes[off..].as_ptr(), dst, chunk);
        }
        off += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::memregion::{MemRegion, Prot, RegionFlags, RegionType};
    use crate::memory::paging::test_support::TestFrames;

    #[test]
    fn user_bytes_land_across_page_boundaries() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mut mem = TaskMem::new();
        let base = 0x7000_0000u64;
        mem.insert(MemRegion::anon(
            base,
            base + 4 * PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            RegionFlags::PRIVATE | RegionFlags::USER,
            RegionType::Stack,
        ))
        .unwrap();

        let data: Vec<u8> = (0..PAGE_SIZE as usize + 100).map(|i| (i % 251) as u8).collect();
        let addr = base + PAGE_SIZE - 50; // straddles a boundary
        write_user_bytes(&mut space, &mut frames, addr, &data, &mem).unwrap();

        for probe in [0usize, 49, 50, 1000, data.len() - 1] {
            let va = addr + probe as u64;
            let phys = space.translate(va, &mut frames).unwrap();
            let byte = unsafe { *frames.frame_ptr(phys) };
            assert_eq!(byte, data[probe], "mismatch at offset {}", probe);
        }
    }

    #[test]
    fn writes_outside_any_region_fault() {
        let mut frames = TestFrames::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let mem = TaskMem::new();
        assert_eq!(
            write_user_bytes(&mut space, &mut frames, 0x1000, b"x", &mem).unwrap_err(),
            Errno::EFAULT
        );
    }
}
