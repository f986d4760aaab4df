//! POSIX-shaped signals: per-task pending/blocked bitsets, bounded
//! siginfo queues, action tables and the delivery decision machinery.
//!
//! Synchronous faults (SEGV, FPE, BUS) are pushed with `force` from the
//! fault path; everything else arrives via `kill`/`tkill`, timers or the
//! tty. Actual frame construction happens at the return-to-user edge in
//! the syscall layer.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, Pid, Task, TaskState};

pub const NSIG: usize = 32;
/// Per-signal siginfo queue bound.
const SIGQUEUE_MAX: usize = 16;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;

/// Bitset over signals 1..=31.
pub type SigSet = u32;

pub fn sig_bit(sig: i32) -> SigSet {
    1u32 << (sig - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub pid: Pid,
    pub uid: u32,
    /// Faulting address for the synchronous signals.
    pub addr: u64,
    pub value: i64,
}

impl SigInfo {
    pub fn simple(signo: i32, pid: Pid, uid: u32) -> Self {
        SigInfo {
            signo,
            code: 0,
            pid,
            uid,
            addr: 0,
            value: 0,
        }
    }

    pub fn fault(signo: i32, addr: u64) -> Self {
        SigInfo {
            signo,
            code: 0,
            pid: 0,
            uid: 0,
            addr,
            value: 0,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        const NOCLDSTOP = 1;
        const SIGINFO = 4;
        const RESTART = 0x1000_0000;
        const NODEFER = 0x4000_0000;
        const RESETHAND = 0x8000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    /// User-space handler entry point.
    Handler(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: SigSet,
    pub flags: SaFlags,
    /// Return trampoline (vdso) pushed under the handler frame.
    pub restorer: u64,
}

impl SigAction {
    pub const fn default_action() -> Self {
        SigAction {
            handler: SigHandler::Default,
            mask: 0,
            flags: SaFlags::empty(),
            restorer: 0,
        }
    }
}

/// Shared (thread-group) action table.
#[derive(Clone)]
pub struct SigActionTable {
    pub actions: [SigAction; NSIG],
}

impl SigActionTable {
    pub fn new() -> Self {
        SigActionTable {
            actions: [SigAction::default_action(); NSIG],
        }
    }

    pub fn get(&self, sig: i32) -> SigAction {
        self.actions[(sig - 1) as usize]
    }

    pub fn set(&mut self, sig: i32, action: SigAction) {
        self.actions[(sig - 1) as usize] = action;
    }

    /// Exec: handlers revert to default; IGN dispositions persist.
    pub fn reset_for_exec(&mut self) {
        for action in self.actions.iter_mut() {
            if !matches!(action.handler, SigHandler::Ignore) {
                *action = SigAction::default_action();
            }
        }
    }
}

/// What an undisposed signal does to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDisposition {
    Terminate,
    Core,
    Ignore,
    Stop,
    Continue,
}

pub fn default_disposition(sig: i32) -> DefaultDisposition {
    match sig {
        SIGCHLD | SIGWINCH | SIGIO => DefaultDisposition::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultDisposition::Stop,
        SIGCONT => DefaultDisposition::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV => {
            DefaultDisposition::Core
        }
        _ => DefaultDisposition::Terminate,
    }
}

/// Per-task signal state.
pub struct SignalState {
    pub pending: SigSet,
    pub blocked: SigSet,
    /// Temporary mask installed by `sigsuspend`, restored on return.
    pub suspended_mask: Option<SigSet>,
    queues: [VecDeque<SigInfo>; NSIG],
}

impl SignalState {
    pub fn new() -> Self {
        SignalState {
            pending: 0,
            blocked: 0,
            suspended_mask: None,
            queues: Default::default(),
        }
    }

    /// Queue `info` for its signal. Standard signals coalesce: a signal
    /// already pending keeps its first siginfo and drops the new one.
    pub fn push(&mut self, info: SigInfo) -> bool {
        let idx = (info.signo - 1) as usize;
        if self.pending & sig_bit(info.signo) != 0 {
            return false;
        }
        if self.queues[idx].len() >= SIGQUEUE_MAX {
            return false;
        }
        self.queues[idx].push_back(info);
        self.pending |= sig_bit(info.signo);
        true
    }

    /// Lowest-numbered deliverable signal, if any.
    pub fn next_ready(&self) -> Option<i32> {
        let ready = self.pending & !self.blocked;
        if ready == 0 {
            return None;
        }
        Some(ready.trailing_zeros() as i32 + 1)
    }

    /// Pop the siginfo for `sig`, clearing its pending bit once the
    /// queue drains.
    pub fn take(&mut self, sig: i32) -> SigInfo {
        let idx = (sig - 1) as usize;
        let info = self.queues[idx]
            .pop_front()
            .unwrap_or_else(|| SigInfo::simple(sig, 0, 0));
        if self.queues[idx].is_empty() {
            self.pending &= !sig_bit(sig);
        }
        info
    }

    pub fn clear_pending(&mut self) {
        self.pending = 0;
        for q in self.queues.iter_mut() {
            q.clear();
        }
    }
}

/// Can `sender` signal `target`? Superuser always; otherwise the real
/// or effective uid must match either of the target's.
pub fn can_signal(sender: &crate::scheduler::Credentials, target: &crate::scheduler::Credentials) -> bool {
    sender.is_superuser()
        || sender.uid == target.uid
        || sender.uid == target.euid
        || sender.euid == target.uid
        || sender.euid == target.euid
}

/// Queue `sig` on `task` and wake it when appropriate. `info == None`
/// fabricates a minimal kernel-originated siginfo.
pub fn send_signal(task: &Arc<Task>, sig: i32, info: Option<SigInfo>) {
    if sig <= 0 || sig as usize > NSIG {
        return;
    }

    // KILL/STOP cannot be ignored; everything else honors an explicit
    // SIG_IGN up front.
    if sig != SIGKILL && sig != SIGSTOP {
        let action = task.actions.lock().get(sig);
        if action.handler == SigHandler::Ignore {
            return;
        }
        if action.handler == SigHandler::Default
            && default_disposition(sig) == DefaultDisposition::Ignore
        {
            return;
        }
    }

    {
        let mut state = task.signals.lock();
        state.push(info.unwrap_or_else(|| SigInfo::simple(sig, 0, 0)));
    }

    match sig {
        SIGCONT => {
            if task.state() == TaskState::Stopped {
                task.set_state(TaskState::Ready);
                crate::scheduler::READY.lock().push_tail(task.clone());
            }
        }
        SIGKILL => {
            scheduler::wake_by_signal(task);
        }
        _ => {
            let blocked = task.signals.lock().blocked;
            if blocked & sig_bit(sig) == 0 {
                scheduler::wake_by_signal(task);
            }
        }
    }
}

/// `kill` semantics: pid > 0 targets a task, pid == 0 the sender's
/// process group, pid < -1 that group, -1 everything but init.
pub fn sys_kill(sender: &Arc<Task>, pid: Pid, sig: i32) -> KResult<()> {
    if sig < 0 || sig as usize > NSIG {
        return Err(Errno::EINVAL);
    }
    let sender_creds = *sender.creds.lock();
    let info = SigInfo::simple(sig, sender.pid, sender_creds.uid);

    let targets: alloc::vec::Vec<Arc<Task>> = if pid > 0 {
        match scheduler::task_by_pid(pid) {
            Some(t) => alloc::vec![t],
            None => return Err(Errno::ESRCH),
        }
    } else if pid == 0 {
        let pgid = sender.ids.lock().pgid;
        scheduler::tasks_in_pgrp(pgid)
    } else if pid == -1 {
        scheduler::TASK_TABLE
            .lock()
            .values()
            .filter(|t| t.pid != 1 && t.pid != sender.pid)
            .cloned()
            .collect()
    } else {
        scheduler::tasks_in_pgrp(-pid)
    };

    if targets.is_empty() {
        return Err(Errno::ESRCH);
    }

    let mut any = false;
    for target in &targets {
        if can_signal(&sender_creds, &target.creds.lock()) {
            any = true;
            // sig 0 is a liveness/permission probe only.
            if sig != 0 {
                send_signal(target, sig, Some(info));
            }
        }
    }
    if any {
        Ok(())
    } else {
        Err(Errno::EPERM)
    }
}

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// `sigprocmask`, returning the previous mask. KILL and STOP never
/// enter the blocked set.
pub fn sys_sigprocmask(task: &Arc<Task>, how: i32, set: Option<SigSet>) -> KResult<SigSet> {
    let mut state = task.signals.lock();
    let old = state.blocked;
    if let Some(set) = set {
        let set = set & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
        state.blocked = match how {
            SIG_BLOCK => old | set,
            SIG_UNBLOCK => old & !set,
            SIG_SETMASK => set,
            _ => return Err(Errno::EINVAL),
        };
    }
    Ok(old)
}

/// The decision half of delivery: what should happen for the next ready
/// signal. Frame building is the caller's concern.
pub enum Delivery {
    /// Run a user handler; the blocked mask has already been updated.
    Handle {
        sig: i32,
        info: SigInfo,
        action: SigAction,
        old_blocked: SigSet,
    },
    Terminate {
        sig: i32,
        core: bool,
    },
    Stop,
    Continue,
}

/// Pick and consume the next deliverable signal for `task`, applying
/// the action-table side effects. Loops past ignored ones.
pub fn next_delivery(task: &Arc<Task>) -> Option<Delivery> {
    loop {
        let sig = {
            let state = task.signals.lock();
            state.next_ready()?
        };

        let info = task.signals.lock().take(sig);
        let action = task.actions.lock().get(sig);

        match action.handler {
            SigHandler::Ignore => continue,
            SigHandler::Handler(_) if sig != SIGKILL && sig != SIGSTOP => {
                let mut state = task.signals.lock();
                let old_blocked = state.blocked;
                let mut added = action.mask;
                if !action.flags.contains(SaFlags::NODEFER) {
                    added |= sig_bit(sig);
                }
                state.blocked |= added & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
                if action.flags.contains(SaFlags::RESETHAND) {
                    task.actions.lock().set(sig, SigAction::default_action());
                }
                return Some(Delivery::Handle {
                    sig,
                    info,
                    action,
                    old_blocked,
                });
            }
            _ => match default_disposition(sig) {
                DefaultDisposition::Ignore => continue,
                DefaultDisposition::Stop => return Some(Delivery::Stop),
                DefaultDisposition::Continue => return Some(Delivery::Continue),
                DefaultDisposition::Terminate => {
                    return Some(Delivery::Terminate { sig, core: false })
                }
                DefaultDisposition::Core => {
                    return Some(Delivery::Terminate { sig, core: true })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::new_task;

    #[test]
    fn lowest_numbered_ready_signal_wins() {
        let mut s = SignalState::new();
        s.push(SigInfo::simple(SIGTERM, 0, 0));
        s.push(SigInfo::simple(SIGINT, 0, 0));
        assert_eq!(s.next_ready(), Some(SIGINT));
        s.take(SIGINT);
        assert_eq!(s.next_ready(), Some(SIGTERM));
    }

    #[test]
    fn blocked_signals_stay_pending() {
        let mut s = SignalState::new();
        s.blocked = sig_bit(SIGUSR1);
        s.push(SigInfo::simple(SIGUSR1, 0, 0));
        assert_eq!(s.next_ready(), None);
        s.blocked = 0;
        assert_eq!(s.next_ready(), Some(SIGUSR1));
    }

    #[test]
    fn standard_signals_coalesce() {
        let mut s = SignalState::new();
        assert!(s.push(SigInfo::simple(SIGUSR1, 5, 0)));
        assert!(!s.push(SigInfo::simple(SIGUSR1, 9, 0)));
        let info = s.take(SIGUSR1);
        assert_eq!(info.pid, 5);
        assert_eq!(s.next_ready(), None);
    }

    #[test]
    fn sigprocmask_roundtrip_restores_mask() {
        let task = new_task("t", false, 4);
        let m1 = sig_bit(SIGUSR1) | sig_bit(SIGTERM);
        let m2 = sig_bit(SIGINT);
        sys_sigprocmask(&task, SIG_SETMASK, Some(m1)).unwrap();
        sys_sigprocmask(&task, SIG_SETMASK, Some(m2)).unwrap();
        sys_sigprocmask(&task, SIG_SETMASK, Some(m1)).unwrap();
        assert_eq!(task.signals.lock().blocked, m1);
    }

    #[test]
    fn kill_and_stop_cannot_be_blocked() {
        let task = new_task("t", false, 4);
        sys_sigprocmask(&task, SIG_SETMASK, Some(!0u32)).unwrap();
        let blocked = task.signals.lock().blocked;
        assert_eq!(blocked & sig_bit(SIGKILL), 0);
        assert_eq!(blocked & sig_bit(SIGSTOP), 0);
    }

    #[test]
    fn handler_delivery_masks_the_signal_itself() {
        let task = new_task("t", false, 4);
        task.actions.lock().set(
            SIGUSR1,
            SigAction {
                handler: SigHandler::Handler(0x40_1000),
                mask: sig_bit(SIGUSR2),
                flags: SaFlags::empty(),
                restorer: 0,
            },
        );
        task.signals.lock().push(SigInfo::simple(SIGUSR1, 0, 0));

        match next_delivery(&task) {
            Some(Delivery::Handle { sig, old_blocked, .. }) => {
                assert_eq!(sig, SIGUSR1);
                assert_eq!(old_blocked, 0);
            }
            _ => panic!("expected handler delivery"),
        }
        let blocked = task.signals.lock().blocked;
        assert_ne!(blocked & sig_bit(SIGUSR1), 0);
        assert_ne!(blocked & sig_bit(SIGUSR2), 0);
    }

    #[test]
    fn nodefer_leaves_signal_unmasked() {
        let task = new_task("t", false, 4);
        task.actions.lock().set(
            SIGUSR1,
            SigAction {
                handler: SigHandler::Handler(0x40_1000),
                mask: 0,
                flags: SaFlags::NODEFER,
                restorer: 0,
            },
        );
        task.signals.lock().push(SigInfo::simple(SIGUSR1, 0, 0));
        assert!(matches!(next_delivery(&task), Some(Delivery::Handle { .. })));
        assert_eq!(task.signals.lock().blocked & sig_bit(SIGUSR1), 0);
    }

    #[test]
    fn default_chld_is_discarded() {
        let task = new_task("t", false, 4);
        task.signals.lock().push(SigInfo::simple(SIGCHLD, 0, 0));
        assert!(next_delivery(&task).is_none());
        assert_eq!(task.signals.lock().pending, 0);
    }

    #[test]
    fn uncaught_segv_terminates_with_core() {
        let task = new_task("t", false, 4);
        task.signals.lock().push(SigInfo::fault(SIGSEGV, 0xdead));
        match next_delivery(&task) {
            Some(Delivery::Terminate { sig, core }) => {
                assert_eq!(sig, SIGSEGV);
                assert!(core);
            }
            _ => panic!("expected termination"),
        }
    }

    #[test]
    fn exec_reset_keeps_ignored_handlers() {
        let mut table = SigActionTable::new();
        table.set(
            SIGINT,
            SigAction {
                handler: SigHandler::Ignore,
                mask: 0,
                flags: SaFlags::empty(),
                restorer: 0,
            },
        );
        table.set(
            SIGTERM,
            SigAction {
                handler: SigHandler::Handler(0x1234),
                mask: 0,
                flags: SaFlags::empty(),
                restorer: 0,
            },
        );
        table.reset_for_exec();
        assert_eq!(table.get(SIGINT).handler, SigHandler::Ignore);
        assert_eq!(table.get(SIGTERM).handler, SigHandler::Default);
    }
}
