//! SysV IPC: the pieces shared by message queues, semaphores and shared
//! memory — key/permission records, fixed slot tables and the queue-id
//! stamping that turns slot reuse into `EIDRM` for stale holders.

pub mod msg;
pub mod sem;
pub mod shm;

use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::scheduler::Credentials;

pub const IPC_PRIVATE: i32 = 0;

pub const IPC_CREAT: i32 = 0o1000;
pub const IPC_EXCL: i32 = 0o2000;
pub const IPC_NOWAIT: i32 = 0o4000;

pub const IPC_RMID: i32 = 0;
pub const IPC_SET: i32 = 1;
pub const IPC_STAT: i32 = 2;

/// Slots per IPC table (each of msg/sem/shm).
pub const MAX_QUEUES: usize = 128;

pub const READ_PERMISSION: u16 = 0o4;
pub const WRITE_PERMISSION: u16 = 0o2;

/// Ownership and mode of one IPC object.
#[derive(Debug, Clone, Copy)]
pub struct IpcPerm {
    pub key: i32,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: u16,
}

impl IpcPerm {
    pub fn new(key: i32, creds: &Credentials, mode: u16) -> Self {
        IpcPerm {
            key,
            uid: creds.euid,
            gid: creds.egid,
            cuid: creds.euid,
            cgid: creds.egid,
            mode,
        }
    }

    /// Superuser passes; otherwise owner bits apply when the caller's
    /// uid matches uid or cuid, group bits on gid/egid match, else the
    /// other bits.
    pub fn allows(&self, creds: &Credentials, want: u16) -> bool {
        if creds.is_superuser() {
            return true;
        }
        let granted = if creds.euid == self.uid || creds.euid == self.cuid {
            (self.mode >> 6) & 0o7
        } else if creds.egid == self.gid || creds.egid == self.cgid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        granted & want == want
    }
}

pub struct IpcSlot<T> {
    pub queue_id: i32,
    pub perm: IpcPerm,
    pub payload: T,
}

/// Fixed table with `queue_id ≡ index (mod MAX_QUEUES)`. Removing an
/// object bumps the slot's next id by `MAX_QUEUES`, so any stale id
/// lookup fails with `EIDRM` and a reused slot hands out a strictly
/// greater id.
pub struct IpcTable<T> {
    slots: Vec<Option<IpcSlot<T>>>,
    next_id: Vec<i32>,
}

impl<T> IpcTable<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_QUEUES);
        slots.resize_with(MAX_QUEUES, || None);
        IpcTable {
            slots,
            next_id: (0..MAX_QUEUES as i32).collect(),
        }
    }

    pub fn find_by_key(&self, key: i32) -> Option<i32> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.perm.key == key)
            .map(|s| s.queue_id)
    }

    /// Claim a free slot for `key`. The caller has already resolved the
    /// get-vs-create flag logic.
    pub fn create(&mut self, key: i32, creds: &Credentials, mode: u16, payload: T) -> KResult<i32> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::ENOSPC)?;
        let id = self.next_id[index];
        self.slots[index] = Some(IpcSlot {
            queue_id: id,
            perm: IpcPerm::new(key, creds, mode),
            payload,
        });
        Ok(id)
    }

    pub fn get(&self, id: i32) -> KResult<&IpcSlot<T>> {
        if id < 0 {
            return Err(Errno::EINVAL);
        }
        let index = id as usize % MAX_QUEUES;
        match &self.slots[index] {
            Some(slot) if slot.queue_id == id => Ok(slot),
            _ => Err(Errno::EIDRM),
        }
    }

    pub fn get_mut(&mut self, id: i32) -> KResult<&mut IpcSlot<T>> {
        if id < 0 {
            return Err(Errno::EINVAL);
        }
        let index = id as usize % MAX_QUEUES;
        match &mut self.slots[index] {
            Some(slot) if slot.queue_id == id => Ok(slot),
            _ => Err(Errno::EIDRM),
        }
    }

    /// `IPC_RMID`: drop the object and invalidate every outstanding id.
    pub fn remove(&mut self, id: i32) -> KResult<IpcSlot<T>> {
        if id < 0 {
            return Err(Errno::EINVAL);
        }
        let index = id as usize % MAX_QUEUES;
        match &self.slots[index] {
            Some(slot) if slot.queue_id == id => {
                self.next_id[index] = id + MAX_QUEUES as i32;
                Ok(self.slots[index].take().unwrap())
            }
            _ => Err(Errno::EIDRM),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpcSlot<T>> {
        self.slots.iter().flatten()
    }
}

/// `*get` front half shared by the three subsystems.
pub fn lookup_or_create<T>(
    table: &mut IpcTable<T>,
    key: i32,
    flags: i32,
    creds: &Credentials,
    want: u16,
    make: impl FnOnce() -> T,
) -> KResult<i32> {
    if key != IPC_PRIVATE {
        if let Some(id) = table.find_by_key(key) {
            if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                return Err(Errno::EEXIST);
            }
            let slot = table.get(id)?;
            if !slot.perm.allows(creds, want) {
                return Err(Errno::EACCES);
            }
            return Ok(id);
        }
        if flags & IPC_CREAT == 0 {
            return Err(Errno::ENOENT);
        }
    }
    table.create(key, creds, (flags & 0o777) as u16, make())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uid: u32, gid: u32) -> Credentials {
        Credentials {
            uid,
            gid,
            euid: uid,
            egid: gid,
        }
    }

    #[test]
    fn stale_id_is_eidrm_and_reuse_grows() {
        let mut table: IpcTable<u32> = IpcTable::new();
        let c = creds(100, 100);
        let id = table.create(42, &c, 0o600, 7).unwrap();
        assert!(table.get(id).is_ok());

        table.remove(id).unwrap();
        assert!(matches!(table.get(id), Err(Errno::EIDRM)));

        // The reused slot hands out a strictly greater id congruent to
        // the same index.
        let id2 = table.create(42, &c, 0o600, 8).unwrap();
        assert!(id2 > id);
        assert_eq!(
            id2 as usize % MAX_QUEUES,
            id as usize % MAX_QUEUES
        );
        assert!(matches!(table.get(id), Err(Errno::EIDRM)));
        assert!(table.get(id2).is_ok());
    }

    #[test]
    fn permission_bits_by_identity_class() {
        let owner = creds(100, 100);
        let group = creds(200, 100);
        let other = creds(300, 300);
        let perm = IpcPerm::new(1, &owner, 0o640);

        assert!(perm.allows(&owner, READ_PERMISSION | WRITE_PERMISSION));
        assert!(perm.allows(&group, READ_PERMISSION));
        assert!(!perm.allows(&group, WRITE_PERMISSION));
        assert!(!perm.allows(&other, READ_PERMISSION));
        assert!(perm.allows(&creds(0, 0), READ_PERMISSION | WRITE_PERMISSION));
    }

    #[test]
    fn lookup_or_create_flag_matrix() {
        let mut table: IpcTable<u32> = IpcTable::new();
        let c = creds(1, 1);

        assert_eq!(
            lookup_or_create(&mut table, 5, 0, &c, READ_PERMISSION, || 0).unwrap_err(),
            Errno::ENOENT
        );
        let id = lookup_or_create(&mut table, 5, IPC_CREAT | 0o600, &c, READ_PERMISSION, || 1)
            .unwrap();
        assert_eq!(
            lookup_or_create(&mut table, 5, IPC_CREAT | IPC_EXCL, &c, READ_PERMISSION, || 2)
                .unwrap_err(),
            Errno::EEXIST
        );
        assert_eq!(
            lookup_or_create(&mut table, 5, 0, &c, READ_PERMISSION, || 3).unwrap(),
            id
        );

        // IPC_PRIVATE always creates a fresh object.
        let p1 = lookup_or_create(&mut table, IPC_PRIVATE, 0o600, &c, READ_PERMISSION, || 4)
            .unwrap();
        let p2 = lookup_or_create(&mut table, IPC_PRIVATE, 0o600, &c, READ_PERMISSION, || 5)
            .unwrap();
        assert_ne!(p1, p2);
    }
}
