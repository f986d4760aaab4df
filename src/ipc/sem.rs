//! SysV semaphores: `semop` vectors applied atomically, with `SEM_UNDO`
//! reversal records replayed on task exit.

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, BlockOutcome, Credentials, Pid};

use super::{
    lookup_or_create, IpcTable, IPC_NOWAIT, IPC_RMID, IPC_STAT, READ_PERMISSION, WRITE_PERMISSION,
};

/// Most operations accepted in a single `semop` call (SEMOPM).
pub const SEMOPM: usize = 32;
/// Semaphores per set (SEMMSL).
pub const SEMMSL: usize = 64;

pub const SEM_UNDO: i16 = 0o10000;

pub const GETVAL: i32 = 12;
pub const SETVAL: i32 = 16;
pub const GETPID: i32 = 11;
pub const GETNCNT: i32 = 14;
pub const GETZCNT: i32 = 15;

#[derive(Debug, Clone, Copy)]
pub struct SemOp {
    pub num: u16,
    pub op: i16,
    pub flags: i16,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sem {
    val: i32,
    /// Pid of the last task to operate on this semaphore.
    pid: Pid,
    /// Tasks sleeping until the value grows / reaches zero.
    ncount: u32,
    zcount: u32,
}

pub struct SemSet {
    sems: Vec<Sem>,
}

lazy_static! {
    static ref SEM: Mutex<IpcTable<SemSet>> = Mutex::new(IpcTable::new());

    /// SEM_UNDO ledger: (pid, semid, semnum) -> accumulated adjustment.
    static ref UNDO: Mutex<Vec<(Pid, i32, u16, i32)>> = Mutex::new(Vec::new());
}

fn sem_channel(id: i32) -> usize {
    0x53454D00_0000_0000usize | id as usize
}

pub fn semget(key: i32, nsems: usize, flags: i32, creds: &Credentials) -> KResult<i32> {
    if nsems > SEMMSL {
        return Err(Errno::EINVAL);
    }
    lookup_or_create(&mut SEM.lock(), key, flags, creds, READ_PERMISSION, || {
        SemSet {
            sems: alloc::vec![Sem::default(); nsems.max(1)],
        }
    })
}

/// Would `op` proceed against `sem` right now?
fn op_ready(sem: &Sem, op: &SemOp) -> bool {
    if op.op > 0 {
        true
    } else if op.op == 0 {
        sem.val == 0
    } else {
        sem.val >= -(op.op as i32)
    }
}

/// Apply a whole vector atomically: either every operation proceeds, or
/// none is visible and the caller blocks (or gets EAGAIN).
pub fn semop(id: i32, ops: &[SemOp], pid: Pid, creds: &Credentials) -> KResult<()> {
    if ops.is_empty() || ops.len() > SEMOPM {
        return Err(Errno::EINVAL);
    }

    loop {
        {
            let mut table = SEM.lock();
            let slot = table.get_mut(id)?;
            let want = if ops.iter().any(|o| o.op != 0) {
                WRITE_PERMISSION
            } else {
                READ_PERMISSION
            };
            if !slot.perm.allows(creds, want) {
                return Err(Errno::EACCES);
            }
            let set = &mut slot.payload;
            for op in ops {
                if op.num as usize >= set.sems.len() {
                    return Err(Errno::EINVAL);
                }
            }

            if ops.iter().all(|op| op_ready(&set.sems[op.num as usize], op)) {
                for op in ops {
                    let sem = &mut set.sems[op.num as usize];
                    sem.val += op.op as i32;
                    sem.pid = pid;
                    if op.flags & SEM_UNDO != 0 && op.op != 0 {
                        record_undo(pid, id, op.num, -(op.op as i32));
                    }
                }
                scheduler::wake_all(sem_channel(id));
                return Ok(());
            }

            if ops.iter().any(|o| o.flags & IPC_NOWAIT as i16 != 0) {
                return Err(Errno::EAGAIN);
            }
            for op in ops {
                let sem = &mut set.sems[op.num as usize];
                if !op_ready(sem, op) {
                    if op.op == 0 {
                        sem.zcount += 1;
                    } else {
                        sem.ncount += 1;
                    }
                }
            }
        }
        let outcome = scheduler::block_task(sem_channel(id), true);
        {
            // Drop our wait accounting whether or not we retry.
            let mut table = SEM.lock();
            if let Ok(slot) = table.get_mut(id) {
                for op in ops {
                    let sem = &mut slot.payload.sems[op.num as usize];
                    if op.op == 0 {
                        sem.zcount = sem.zcount.saturating_sub(1);
                    } else {
                        sem.ncount = sem.ncount.saturating_sub(1);
                    }
                }
            }
        }
        if outcome == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

fn record_undo(pid: Pid, id: i32, num: u16, adjust: i32) {
    let mut undo = UNDO.lock();
    for entry in undo.iter_mut() {
        if entry.0 == pid && entry.1 == id && entry.2 == num {
            entry.3 += adjust;
            return;
        }
    }
    undo.push((pid, id, num, adjust));
}

/// Task exit: replay the accumulated SEM_UNDO adjustments.
pub fn exit_undo(pid: Pid) {
    let mine: Vec<(i32, u16, i32)> = {
        let mut undo = UNDO.lock();
        let mine = undo
            .iter()
            .filter(|e| e.0 == pid)
            .map(|e| (e.1, e.2, e.3))
            .collect();
        undo.retain(|e| e.0 != pid);
        mine
    };
    for (id, num, adjust) in mine {
        let mut table = SEM.lock();
        if let Ok(slot) = table.get_mut(id) {
            if let Some(sem) = slot.payload.sems.get_mut(num as usize) {
                sem.val = (sem.val + adjust).max(0);
            }
            drop(table);
            scheduler::wake_all(sem_channel(id));
        }
    }
}

pub fn semctl(id: i32, num: u16, cmd: i32, arg: i32, creds: &Credentials) -> KResult<i32> {
    match cmd {
        GETVAL | GETPID | GETNCNT | GETZCNT => {
            let table = SEM.lock();
            let slot = table.get(id)?;
            if !slot.perm.allows(creds, READ_PERMISSION) {
                return Err(Errno::EACCES);
            }
            let sem = slot
                .payload
                .sems
                .get(num as usize)
                .ok_or(Errno::EINVAL)?;
            Ok(match cmd {
                GETVAL => sem.val,
                GETPID => sem.pid,
                GETNCNT => sem.ncount as i32,
                _ => sem.zcount as i32,
            })
        }
        SETVAL => {
            if arg < 0 {
                return Err(Errno::ERANGE);
            }
            {
                let mut table = SEM.lock();
                let slot = table.get_mut(id)?;
                if !slot.perm.allows(creds, WRITE_PERMISSION) {
                    return Err(Errno::EACCES);
                }
                let sem = slot
                    .payload
                    .sems
                    .get_mut(num as usize)
                    .ok_or(Errno::EINVAL)?;
                sem.val = arg;
            }
            scheduler::wake_all(sem_channel(id));
            Ok(0)
        }
        IPC_RMID => {
            {
                let mut table = SEM.lock();
                let slot = table.get(id)?;
                if !creds.is_superuser()
                    && creds.euid != slot.perm.uid
                    && creds.euid != slot.perm.cuid
                {
                    return Err(Errno::EPERM);
                }
                table.remove(id)?;
            }
            UNDO.lock().retain(|e| e.1 != id);
            scheduler::wake_all(sem_channel(id));
            Ok(0)
        }
        IPC_STAT => {
            let table = SEM.lock();
            let slot = table.get(id)?;
            if !slot.perm.allows(creds, READ_PERMISSION) {
                return Err(Errno::EACCES);
            }
            Ok(slot.payload.sems.len() as i32)
        }
        _ => Err(Errno::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IPC_CREAT, IPC_PRIVATE};

    fn creds() -> Credentials {
        Credentials {
            uid: 5,
            gid: 5,
            euid: 5,
            egid: 5,
        }
    }

    fn op(num: u16, val: i16, flags: i16) -> SemOp {
        SemOp {
            num,
            op: val,
            flags,
        }
    }

    fn new_set(n: usize) -> i32 {
        semget(IPC_PRIVATE, n, IPC_CREAT | 0o600, &creds()).unwrap()
    }

    #[test]
    fn v_then_p_roundtrip() {
        let c = creds();
        let id = new_set(1);
        semop(id, &[op(0, 2, 0)], 1, &c).unwrap();
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 2);
        semop(id, &[op(0, -2, 0)], 1, &c).unwrap();
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 0);
    }

    #[test]
    fn insufficient_p_blocks_or_eagain() {
        let c = creds();
        let id = new_set(1);
        assert_eq!(
            semop(id, &[op(0, -1, IPC_NOWAIT as i16)], 1, &c).unwrap_err(),
            Errno::EAGAIN
        );
    }

    #[test]
    fn vector_is_all_or_nothing() {
        let c = creds();
        let id = new_set(2);
        semop(id, &[op(0, 3, 0)], 1, &c).unwrap();

        // Second op cannot proceed, so the first must not apply either.
        assert_eq!(
            semop(
                id,
                &[op(0, -1, IPC_NOWAIT as i16), op(1, -1, IPC_NOWAIT as i16)],
                1,
                &c
            )
            .unwrap_err(),
            Errno::EAGAIN
        );
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 3);
    }

    #[test]
    fn wait_for_zero_ready_when_zero() {
        let c = creds();
        let id = new_set(1);
        // val == 0: wait-for-zero proceeds immediately.
        semop(id, &[op(0, 0, IPC_NOWAIT as i16)], 1, &c).unwrap();
        semop(id, &[op(0, 1, 0)], 1, &c).unwrap();
        assert_eq!(
            semop(id, &[op(0, 0, IPC_NOWAIT as i16)], 1, &c).unwrap_err(),
            Errno::EAGAIN
        );
    }

    #[test]
    fn undo_replays_on_exit() {
        let c = creds();
        let id = new_set(1);
        semop(id, &[op(0, 3, SEM_UNDO)], 42, &c).unwrap();
        semop(id, &[op(0, -1, SEM_UNDO)], 42, &c).unwrap();
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 2);

        exit_undo(42);
        // Net adjustment was +2; the undo subtracts it back.
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 0);
    }

    #[test]
    fn setval_and_rmid() {
        let c = creds();
        let id = new_set(1);
        semctl(id, 0, SETVAL, 7, &c).unwrap();
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap(), 7);
        semctl(id, 0, IPC_RMID, 0, &c).unwrap();
        assert_eq!(semctl(id, 0, GETVAL, 0, &c).unwrap_err(), Errno::EIDRM);
    }
}
