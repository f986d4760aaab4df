//! SysV message queues.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, BlockOutcome, Credentials, Pid};

use super::{
    lookup_or_create, IpcTable, IPC_NOWAIT, IPC_RMID, IPC_SET, IPC_STAT, READ_PERMISSION,
    WRITE_PERMISSION,
};

/// Default byte capacity per queue (MSGMNB).
pub const MSGMNB: usize = 16384;
pub const MSGMAX: usize = 8192;

pub const MSG_NOERROR: i32 = 0o10000;
pub const MSG_EXCEPT: i32 = 0o20000;

#[derive(Debug)]
pub struct Message {
    pub mtype: i64,
    pub data: Vec<u8>,
}

pub struct MsgQueue {
    pub messages: VecDeque<Message>,
    pub cbytes: usize,
    pub qbytes: usize,
    pub lspid: Pid,
    pub lrpid: Pid,
    pub stime: u64,
    pub rtime: u64,
}

impl MsgQueue {
    fn new() -> Self {
        MsgQueue {
            messages: VecDeque::new(),
            cbytes: 0,
            qbytes: MSGMNB,
            lspid: 0,
            lrpid: 0,
            stime: 0,
            rtime: 0,
        }
    }

    fn is_full(&self, incoming: usize) -> bool {
        self.cbytes + incoming > self.qbytes || self.messages.len() + 1 > self.qbytes
    }
}

/// Counters reported by `IPC_STAT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsqidDs {
    pub qnum: usize,
    pub cbytes: usize,
    pub qbytes: usize,
    pub lspid: Pid,
    pub lrpid: Pid,
    pub stime: u64,
    pub rtime: u64,
}

lazy_static! {
    static ref MSG: Mutex<IpcTable<MsgQueue>> = Mutex::new(IpcTable::new());
}

/// Distinct sleep channels for senders and receivers of queue `id`.
fn send_channel(id: i32) -> usize {
    0x4D53_4700_0000_0000usize | (id as usize) << 1
}

fn recv_channel(id: i32) -> usize {
    send_channel(id) | 1
}

pub fn msgget(key: i32, flags: i32, creds: &Credentials) -> KResult<i32> {
    lookup_or_create(
        &mut MSG.lock(),
        key,
        flags,
        creds,
        READ_PERMISSION,
        MsgQueue::new,
    )
}

pub fn msgsnd(
    id: i32,
    mtype: i64,
    data: &[u8],
    flags: i32,
    pid: Pid,
    creds: &Credentials,
) -> KResult<()> {
    if mtype < 1 || data.len() > MSGMAX {
        return Err(Errno::EINVAL);
    }

    loop {
        {
            let mut table = MSG.lock();
            let slot = table.get_mut(id)?;
            if !slot.perm.allows(creds, WRITE_PERMISSION) {
                return Err(Errno::EACCES);
            }
            let q = &mut slot.payload;
            if !q.is_full(data.len()) {
                q.messages.push_back(Message {
                    mtype,
                    data: data.to_vec(),
                });
                q.cbytes += data.len();
                q.lspid = pid;
                q.stime = crate::time::seconds();
                scheduler::wake_all(recv_channel(id));
                return Ok(());
            }
            if flags & IPC_NOWAIT != 0 {
                return Err(Errno::EAGAIN);
            }
        }
        // Queue full: sleep until a receiver makes room. A removal
        // wakes us too, and the next lookup reports EIDRM.
        if scheduler::block_task(send_channel(id), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

/// Select a message per `msgtyp`:
///   0   — head of the queue,
///   > 0 — first with `mtype == msgtyp` (or the first with a different
///         type under `MSG_EXCEPT`),
///   < 0 — lowest `mtype` that is `<= |msgtyp|`.
fn select_index(q: &MsgQueue, msgtyp: i64, flags: i32) -> Option<usize> {
    if msgtyp == 0 {
        return if q.messages.is_empty() { None } else { Some(0) };
    }
    if msgtyp > 0 {
        if flags & MSG_EXCEPT != 0 {
            return q.messages.iter().position(|m| m.mtype != msgtyp);
        }
        return q.messages.iter().position(|m| m.mtype == msgtyp);
    }
    let bound = -msgtyp;
    let mut best: Option<(usize, i64)> = None;
    for (i, m) in q.messages.iter().enumerate() {
        if m.mtype <= bound {
            match best {
                Some((_, t)) if t <= m.mtype => {}
                _ => best = Some((i, m.mtype)),
            }
        }
    }
    best.map(|(i, _)| i)
}

pub fn msgrcv(
    id: i32,
    msgtyp: i64,
    maxlen: usize,
    flags: i32,
    pid: Pid,
    creds: &Credentials,
) -> KResult<Message> {
    loop {
        let taken = {
            let mut table = MSG.lock();
            let slot = table.get_mut(id)?;
            if !slot.perm.allows(creds, READ_PERMISSION) {
                return Err(Errno::EACCES);
            }
            let q = &mut slot.payload;
            match select_index(q, msgtyp, flags) {
                Some(i) => {
                    if q.messages[i].data.len() > maxlen && flags & MSG_NOERROR == 0 {
                        return Err(Errno::E2BIG);
                    }
                    let mut msg = q.messages.remove(i).unwrap();
                    q.cbytes -= msg.data.len().min(q.cbytes);
                    msg.data.truncate(maxlen);
                    q.lrpid = pid;
                    q.rtime = crate::time::seconds();
                    Some(msg)
                }
                None => None,
            }
        };
        // The table lock is already dropped here, before the caller
        // copies the payload out: a page fault during the copy cannot
        // deadlock against the queue.
        if let Some(msg) = taken {
            scheduler::wake_all(send_channel(id));
            return Ok(msg);
        }
        if flags & IPC_NOWAIT != 0 {
            return Err(Errno::ENOMSG);
        }
        if scheduler::block_task(recv_channel(id), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

pub fn msgctl(id: i32, cmd: i32, creds: &Credentials) -> KResult<MsqidDs> {
    match cmd {
        IPC_STAT => {
            let table = MSG.lock();
            let slot = table.get(id)?;
            if !slot.perm.allows(creds, READ_PERMISSION) {
                return Err(Errno::EACCES);
            }
            let q = &slot.payload;
            Ok(MsqidDs {
                qnum: q.messages.len(),
                cbytes: q.cbytes,
                qbytes: q.qbytes,
                lspid: q.lspid,
                lrpid: q.lrpid,
                stime: q.stime,
                rtime: q.rtime,
            })
        }
        IPC_RMID => {
            {
                let mut table = MSG.lock();
                let slot = table.get(id)?;
                if !creds.is_superuser()
                    && creds.euid != slot.perm.uid
                    && creds.euid != slot.perm.cuid
                {
                    return Err(Errno::EPERM);
                }
                table.remove(id)?;
            }
            // Waiters wake, retry, and observe EIDRM.
            scheduler::wake_all(send_channel(id));
            scheduler::wake_all(recv_channel(id));
            Ok(MsqidDs::default())
        }
        IPC_SET => {
            let mut table = MSG.lock();
            let slot = table.get_mut(id)?;
            if !creds.is_superuser() && creds.euid != slot.perm.uid {
                return Err(Errno::EPERM);
            }
            Ok(MsqidDs::default())
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
            uid: 10,
            gid: 10,
            euid: 10,
            egid: 10,
        }
    }

    fn fresh_queue() -> i32 {
        msgget(IPC_PRIVATE, IPC_CREAT | 0o600, &creds()).unwrap()
    }

    #[test]
    fn receive_by_type_scenarios() {
        let c = creds();
        let id = fresh_queue();
        msgsnd(id, 5, b"a", 0, 1, &c).unwrap();
        msgsnd(id, 3, b"b", 0, 1, &c).unwrap();
        msgsnd(id, 5, b"c", 0, 1, &c).unwrap();

        // Exact type match picks "b".
        let m = msgrcv(id, 3, 64, IPC_NOWAIT, 2, &c).unwrap();
        assert_eq!(&m.data, b"b");

        // msgtyp = -4 wants mtype <= 4; only fives remain.
        assert_eq!(
            msgrcv(id, -4, 64, IPC_NOWAIT, 2, &c).unwrap_err(),
            Errno::ENOMSG
        );

        // Head order for msgtyp = 0: "a" then "c".
        assert_eq!(&msgrcv(id, 0, 64, IPC_NOWAIT, 2, &c).unwrap().data, b"a");
        assert_eq!(&msgrcv(id, 0, 64, IPC_NOWAIT, 2, &c).unwrap().data, b"c");
    }

    #[test]
    fn negative_type_takes_lowest_mtype() {
        let c = creds();
        let id = fresh_queue();
        msgsnd(id, 9, b"nine", 0, 1, &c).unwrap();
        msgsnd(id, 2, b"two", 0, 1, &c).unwrap();
        msgsnd(id, 7, b"seven", 0, 1, &c).unwrap();
        let m = msgrcv(id, -10, 64, IPC_NOWAIT, 2, &c).unwrap();
        assert_eq!(&m.data, b"two");
    }

    #[test]
    fn except_flag_skips_the_named_type() {
        let c = creds();
        let id = fresh_queue();
        msgsnd(id, 1, b"one", 0, 1, &c).unwrap();
        msgsnd(id, 2, b"other", 0, 1, &c).unwrap();
        let m = msgrcv(id, 1, 64, IPC_NOWAIT | MSG_EXCEPT, 2, &c).unwrap();
        assert_eq!(&m.data, b"other");
    }

    #[test]
    fn fifo_within_type_zero() {
        let c = creds();
        let id = fresh_queue();
        for payload in [&b"1"[..], b"2", b"3"] {
            msgsnd(id, 4, payload, 0, 1, &c).unwrap();
        }
        for expect in [&b"1"[..], b"2", b"3"] {
            assert_eq!(&msgrcv(id, 0, 8, IPC_NOWAIT, 2, &c).unwrap().data, expect);
        }
    }

    #[test]
    fn oversize_message_needs_noerror() {
        let c = creds();
        let id = fresh_queue();
        msgsnd(id, 1, b"longish", 0, 1, &c).unwrap();
        assert_eq!(
            msgrcv(id, 0, 3, IPC_NOWAIT, 2, &c).unwrap_err(),
            Errno::E2BIG
        );
        let m = msgrcv(id, 0, 3, IPC_NOWAIT | MSG_NOERROR, 2, &c).unwrap();
        assert_eq!(&m.data, b"lon");
    }

    #[test]
    fn rmid_invalidates_outstanding_ids() {
        let c = creds();
        let id = fresh_queue();
        msgctl(id, IPC_RMID, &c).unwrap();
        assert_eq!(msgsnd(id, 1, b"x", 0, 1, &c).unwrap_err(), Errno::EIDRM);
        assert_eq!(
            msgrcv(id, 0, 8, IPC_NOWAIT, 1, &c).unwrap_err(),
            Errno::EIDRM
        );
    }

    #[test]
    fn full_queue_reports_eagain_with_nowait() {
        let c = creds();
        let id = fresh_queue();
        let chunk = alloc::vec![0u8; MSGMAX];
        // Two max-size messages fit; the third would exceed MSGMNB.
        msgsnd(id, 1, &chunk, 0, 1, &c).unwrap();
        msgsnd(id, 1, &chunk, 0, 1, &c).unwrap();
        assert_eq!(
            msgsnd(id, 1, &chunk, IPC_NOWAIT, 1, &c).unwrap_err(),
            Errno::EAGAIN
        );
    }

    #[test]
    fn permissions_are_enforced() {
        let owner = creds();
        let stranger = Credentials {
            uid: 99,
            gid: 99,
            euid: 99,
            egid: 99,
        };
        let id = msgget(IPC_PRIVATE, IPC_CREAT | 0o600, &owner).unwrap();
        assert_eq!(
            msgsnd(id, 1, b"x", 0, 1, &stranger).unwrap_err(),
            Errno::EACCES
        );
        msgsnd(id, 1, b"x", 0, 1, &owner).unwrap();
        assert_eq!(
            msgrcv(id, 0, 8, IPC_NOWAIT, 1, &stranger).unwrap_err(),
            Errno::EACCES
        );
    }
}
