//! SysV shared memory: segments own physical frames; attaching a task
//! maps those frames into its address space and bumps the frame share
//! counters, so teardown follows the same last-reference rule as CoW.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::errno::{Errno, KResult};
use crate::memory::memregion::{MemRegion, Prot, RegionFlags, RegionType, TaskMem};
use crate::memory::paging::{AddressSpace, FrameProvider, PteFlags};
use crate::memory::PAGE_SIZE;
use crate::scheduler::{Credentials, Pid};

use super::{lookup_or_create, IpcTable, IPC_RMID, IPC_STAT, READ_PERMISSION, WRITE_PERMISSION};

pub const SHM_RDONLY: i32 = 0o10000;

/// Largest segment accepted (16 MiB).
pub const SHMMAX: usize = 16 * 1024 * 1024;

pub struct ShmSegment {
    pub size: usize,
    pub frames: Vec<PhysAddr>,
    pub nattch: u32,
    /// `IPC_RMID` arrived while attachments remain; destroy on last
    /// detach.
    pub rmid_pending: bool,
    pub cpid: Pid,
    pub lpid: Pid,
}

lazy_static! {
    static ref SHM: Mutex<IpcTable<ShmSegment>> = Mutex::new(IpcTable::new());
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShmidDs {
    pub size: usize,
    pub nattch: u32,
    pub cpid: Pid,
    pub lpid: Pid,
}

/// Create or look up a segment. Frames are allocated eagerly so every
/// attach sees the same memory.
pub fn shmget(
    key: i32,
    size: usize,
    flags: i32,
    creds: &Credentials,
    frames: &mut dyn FrameProvider,
) -> KResult<i32> {
    if size == 0 || size > SHMMAX {
        return Err(Errno::EINVAL);
    }
    let pages = (size + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

    let mut allocated: Vec<PhysAddr> = Vec::with_capacity(pages);
    for _ in 0..pages {
        match frames.alloc_frames(1) {
            Some((phys, _)) => allocated.push(phys),
            None => {
                for phys in allocated {
                    frames.free_frames(phys, 1);
                }
                return Err(Errno::ENOMEM);
            }
        }
    }

    let mut table = SHM.lock();
    let existing = super::IPC_PRIVATE != key && table.find_by_key(key).is_some();
    let result = lookup_or_create(&mut table, key, flags, creds, READ_PERMISSION, || {
        ShmSegment {
            size,
            frames: core::mem::take(&mut allocated),
            nattch: 0,
            rmid_pending: false,
            cpid: 0,
            lpid: 0,
        }
    });
    drop(table);

    // The lookup hit an existing segment; give the speculative frames
    // back.
    if existing {
        for phys in allocated {
            frames.free_frames(phys, 1);
        }
    }
    result
}

/// Map the segment into `(mem, space)` at `addr` (0 = kernel-chosen).
/// Returns the attach address.
pub fn shmat(
    id: i32,
    addr: u64,
    flags: i32,
    pid: Pid,
    creds: &Credentials,
    mem: &mut TaskMem,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
) -> KResult<u64> {
    let readonly = flags & SHM_RDONLY != 0;

    let seg_frames: Vec<PhysAddr> = {
        let mut table = SHM.lock();
        let slot = table.get_mut(id)?;
        let want = if readonly {
            READ_PERMISSION
        } else {
            READ_PERMISSION | WRITE_PERMISSION
        };
        if !slot.perm.allows(creds, want) {
            return Err(Errno::EACCES);
        }
        slot.payload.nattch += 1;
        slot.payload.lpid = pid;
        slot.payload.frames.clone()
    };

    let len = seg_frames.len() as u64 * PAGE_SIZE;
    let base = if addr == 0 {
        mem.find_free_range(len, 0x7000_0000, 0x7fff_f000)
            .ok_or(Errno::ENOMEM)?
    } else {
        if addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        addr
    };

    let mut prot = Prot::READ;
    if !readonly {
        prot |= Prot::WRITE;
    }
    let mut region = MemRegion::anon(
        base,
        base + len,
        prot,
        RegionFlags::SHARED | RegionFlags::USER,
        RegionType::Shmem,
    );
    region.file_off = id as u64; // ties the VMA back to its segment
    if let Err(e) = mem.insert(region) {
        detach_bookkeeping(id, pid);
        return Err(e);
    }

    let mut pte_flags = PteFlags::USER;
    if !readonly {
        pte_flags |= PteFlags::WRITABLE;
    }
    for (i, phys) in seg_frames.iter().enumerate() {
        if space
            .map_page(base + i as u64 * PAGE_SIZE, *phys, pte_flags, frames)
            .is_none()
        {
            return Err(Errno::ENOMEM);
        }
        frames.inc_share(*phys);
    }

    Ok(base)
}

/// Unmap the attachment at `addr`; the last detach of a removed segment
/// destroys it.
pub fn shmdt(
    addr: u64,
    pid: Pid,
    mem: &mut TaskMem,
    space: &mut AddressSpace,
    frames: &mut dyn FrameProvider,
) -> KResult<()> {
    let region = mem
        .regions
        .iter()
        .position(|r| r.start == addr && r.rtype == RegionType::Shmem)
        .ok_or(Errno::EINVAL)?;
    let region = mem.regions.remove(region);
    let id = region.file_off as i32;

    let mut va = region.start;
    while va < region.end {
        if let Some(old) = space.unmap_page(va, frames) {
            frames.dec_share(old.frame());
            crate::memory::tlb_shootdown(va);
        }
        va += PAGE_SIZE;
    }

    detach_bookkeeping(id, pid);
    destroy_if_idle(id, frames);
    Ok(())
}

fn detach_bookkeeping(id: i32, pid: Pid) {
    let mut table = SHM.lock();
    if let Ok(slot) = table.get_mut(id) {
        slot.payload.nattch = slot.payload.nattch.saturating_sub(1);
        slot.payload.lpid = pid;
    }
}

/// Destroy a removal-pending segment once nothing is attached.
fn destroy_if_idle(id: i32, frames: &mut dyn FrameProvider) {
    let seg = {
        let mut table = SHM.lock();
        match table.get(id) {
            Ok(slot) if slot.payload.rmid_pending && slot.payload.nattch == 0 => {
                table.remove(id).ok()
            }
            _ => None,
        }
    };
    if let Some(slot) = seg {
        for phys in slot.payload.frames {
            frames.dec_share(phys);
        }
    }
}

pub fn shmctl(id: i32, cmd: i32, creds: &Credentials, frames: &mut dyn FrameProvider) -> KResult<ShmidDs> {
    match cmd {
        IPC_STAT => {
            let table = SHM.lock();
            let slot = table.get(id)?;
            if !slot.perm.allows(creds, READ_PERMISSION) {
                return Err(Errno::EACCES);
            }
            Ok(ShmidDs {
                size: slot.payload.size,
                nattch: slot.payload.nattch,
                cpid: slot.payload.cpid,
                lpid: slot.payload.lpid,
            })
        }
        IPC_RMID => {
            {
                let mut table = SHM.lock();
                let slot = table.get_mut(id)?;
                if !creds.is_superuser()
                    && creds.euid != slot.perm.uid
                    && creds.euid != slot.perm.cuid
                {
                    return Err(Errno::EPERM);
                }
                slot.payload.rmid_pending = true;
            }
            destroy_if_idle(id, frames);
            Ok(ShmidDs::default())
        }
        _ => Err(Errno::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IPC_CREAT, IPC_PRIVATE};
    use crate::memory::paging::test_support::TestFrames;

    fn creds() -> Credentials {
        Credentials {
            uid: 3,
            gid: 3,
            euid: 3,
            egid: 3,
        }
    }

    #[test]
    fn attach_maps_the_same_frames_in_both_tasks() {
        let c = creds();
        let mut frames = TestFrames::new();
        let id = shmget(IPC_PRIVATE, 2 * PAGE_SIZE as usize, IPC_CREAT | 0o600, &c, &mut frames)
            .unwrap();

        let mut mem_a = TaskMem::new();
        let mut mem_b = TaskMem::new();
        let mut space_a = AddressSpace::new(&mut frames).unwrap();
        let mut space_b = AddressSpace::new(&mut frames).unwrap();

        let va_a = shmat(id, 0, 0, 1, &c, &mut mem_a, &mut space_a, &mut frames).unwrap();
        let va_b = shmat(id, 0, 0, 2, &c, &mut mem_b, &mut space_b, &mut frames).unwrap();

        let phys_a = space_a.translate(va_a, &mut frames).unwrap();
        let phys_b = space_b.translate(va_b, &mut frames).unwrap();
        assert_eq!(phys_a, phys_b);

        // One writer is visible to the other attach.
        unsafe { *frames.frame_ptr(phys_a) = 0xAB };
        assert_eq!(unsafe { *frames.frame_ptr(phys_b) }, 0xAB);

        assert_eq!(shmctl(id, IPC_STAT, &c, &mut frames).unwrap().nattch, 2);
    }

    #[test]
    fn rmid_with_attachments_defers_destruction() {
        let c = creds();
        let mut frames = TestFrames::new();
        let id = shmget(IPC_PRIVATE, PAGE_SIZE as usize, IPC_CREAT | 0o600, &c, &mut frames)
            .unwrap();

        let mut mem = TaskMem::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let va = shmat(id, 0, 0, 1, &c, &mut mem, &mut space, &mut frames).unwrap();
        let phys = space.translate(va, &mut frames).unwrap();

        shmctl(id, IPC_RMID, &c, &mut frames).unwrap();
        // Still attached: id is gone for new users, memory stays.
        assert_eq!(frames.share_count(phys), 2);

        shmdt(va, 1, &mut mem, &mut space, &mut frames).unwrap();
        // Last detach released the segment's own reference too.
        assert_eq!(frames.share_count(phys), 0);
        assert_eq!(shmctl(id, IPC_STAT, &c, &mut frames).unwrap_err(), Errno::EIDRM);
    }

    #[test]
    fn readonly_attach_maps_without_write() {
        let c = creds();
        let mut frames = TestFrames::new();
        let id = shmget(IPC_PRIVATE, PAGE_SIZE as usize, IPC_CREAT | 0o600, &c, &mut frames)
            .unwrap();
        let mut mem = TaskMem::new();
        let mut space = AddressSpace::new(&mut frames).unwrap();
        let va = shmat(id, 0, SHM_RDONLY, 1, &c, &mut mem, &mut space, &mut frames).unwrap();
        let entry = *space.entry(va, false, &mut frames).unwrap();
        assert!(!entry.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn oversize_and_zero_segments_rejected() {
        let c = creds();
        let mut frames = TestFrames::new();
        assert_eq!(
            shmget(IPC_PRIVATE, 0, IPC_CREAT, &c, &mut frames).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            shmget(IPC_PRIVATE, SHMMAX + 1, IPC_CREAT, &c, &mut frames).unwrap_err(),
            Errno::EINVAL
        );
    }
}
