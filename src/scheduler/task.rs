use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use super::context::{Context, FpuState};
use crate::fs::fd::FdTable;
use crate::memory::memregion::TaskMem;
use crate::memory::paging::AddressSpace;
use crate::signals::{SigActionTable, SignalState};
use crate::time::TaskTimers;

pub type Pid = i32;

/// Task state machine. `Sleeping` wakes on channel or signal,
/// `Waiting` on channel only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Sleeping,
    Waiting,
    Stopped,
    Zombie,
}

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credentials {
    pub const fn root() -> Self {
        Credentials {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.euid == 0
    }
}

/// Scheduler-owned mutable task state, behind the task's own lock.
pub struct SchedInfo {
    pub state: TaskState,
    /// Priority band, 0 = highest.
    pub prio: usize,
    /// Remaining ticks of the current slice.
    pub timeslice: u32,
    /// Channel the task sleeps on, if any.
    pub channel: Option<usize>,
    /// Set when a signal (not the channel) ended the sleep.
    pub woke_by_signal: bool,
    /// CPU currently running the task (for shootdown targeting).
    pub on_cpu: i32,
    pub exit_status: i32,
}

/// Session/job-control identity plus the process tree links.
pub struct TaskIds {
    pub parent: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub children: Vec<Pid>,
    /// Controlling tty (minor), if any.
    pub ctty: Option<usize>,
}

/// User address space: the VMA list shared within the thread group plus
/// this group's page directory.
pub struct UserSpace {
    pub mem: Arc<Mutex<TaskMem>>,
    pub space: Arc<Mutex<AddressSpace>>,
}

pub struct Task {
    pub pid: Pid,
    pub tgid: Pid,
    pub name: Mutex<String>,
    pub kernel_task: bool,

    pub sched: Mutex<SchedInfo>,
    pub ids: Mutex<TaskIds>,
    pub creds: Mutex<Credentials>,
    pub user: Mutex<Option<UserSpace>>,
    pub files: Mutex<FdTable>,
    pub signals: Mutex<SignalState>,
    pub actions: Arc<Mutex<SigActionTable>>,
    pub timers: Mutex<TaskTimers>,

    /// Saved register context; read/written only under the scheduler
    /// lock during a switch.
    pub context: UnsafeCell<Context>,
    pub fpu: UnsafeCell<FpuState>,
    /// Owned kernel stack, kept alive for the task's lifetime.
    pub kstack: Mutex<Option<Box<[u8]>>>,
}

// Context/fpu cells are only touched with the scheduler lock held.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn state(&self) -> TaskState {
        self.sched.lock().state
    }

    pub fn set_state(&self, state: TaskState) {
        self.sched.lock().state = state;
    }

    pub fn exit_status(&self) -> i32 {
        self.sched.lock().exit_status
    }
}

pub const NR_PRIOS: usize = 8;
pub const DEFAULT_PRIO: usize = 4;
pub const KERNEL_PRIO: usize = 1;
pub const DEFAULT_TIMESLICE: u32 = 10;

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::AcqRel)
}

lazy_static! {
    /// All live tasks (including zombies awaiting reap), keyed by pid.
    pub static ref TASK_TABLE: Mutex<BTreeMap<Pid, Arc<Task>>> = Mutex::new(BTreeMap::new());
}

pub fn task_by_pid(pid: Pid) -> Option<Arc<Task>> {
    TASK_TABLE.lock().get(&pid).cloned()
}

/// Tasks belonging to a process group (for job-control signals).
pub fn tasks_in_pgrp(pgid: Pid) -> Vec<Arc<Task>> {
    TASK_TABLE
        .lock()
        .values()
        .filter(|t| t.ids.lock().pgid == pgid)
        .cloned()
        .collect()
}

/// Build a task shell with empty state; the caller fills in context,
/// memory and files before enqueueing it.
pub fn new_task(name: &str, kernel_task: bool, prio: usize) -> Arc<Task> {
    let pid = alloc_pid();
    Arc::new(Task {
        pid,
        tgid: pid,
        name: Mutex::new(String::from(name)),
        kernel_task,
        sched: Mutex::new(SchedInfo {
            state: TaskState::Ready,
            prio,
            timeslice: DEFAULT_TIMESLICE,
            channel: None,
            woke_by_signal: false,
            on_cpu: -1,
            exit_status: 0,
        }),
        ids: Mutex::new(TaskIds {
            parent: 0,
            pgid: pid,
            sid: pid,
            children: Vec::new(),
            ctty: None,
        }),
        creds: Mutex::new(Credentials::root()),
        user: Mutex::new(None),
        files: Mutex::new(FdTable::new()),
        signals: Mutex::new(SignalState::new()),
        actions: Arc::new(Mutex::new(SigActionTable::new())),
        timers: Mutex::new(TaskTimers::new()),
        context: UnsafeCell::new(Context::empty()),
        fpu: UnsafeCell::new(FpuState::new()),
        kstack: Mutex::new(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tasks_get_fresh_pids_and_own_session() {
        let a = new_task("a", false, DEFAULT_PRIO);
        let b = new_task("b", false, DEFAULT_PRIO);
        assert_ne!(a.pid, b.pid);
        assert_eq!(a.ids.lock().pgid, a.pid);
        assert_eq!(a.ids.lock().sid, a.pid);
        assert_eq!(a.state(), TaskState::Ready);
    }
}
