//! Task scheduling: priority-banded ready queues, channel sleeps and the
//! task lifecycle (fork / exec / exit / wait).
//!
//! Every CPU runs this scheduler loop against one global ready queue;
//! the queue lock is CPU-exclusive and spinning on it is allowed. Task
//! state transitions happen under the per-task lock.

pub mod context;
pub mod task;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::memory::paging::AddressSpace;
use crate::smp::percpu;

use context::Context;
pub use task::{
    new_task, task_by_pid, tasks_in_pgrp, Credentials, Pid, Task, TaskState, UserSpace,
    DEFAULT_PRIO, DEFAULT_TIMESLICE, KERNEL_PRIO, NR_PRIOS, TASK_TABLE,
};

/// Size of each task's kernel stack (16 KiB).
pub const TASK_STACK_SIZE: usize = 4096 * 4;

/// Outcome of a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The channel was signalled.
    Woken,
    /// A signal ended the sleep; the caller returns `EINTR` or
    /// `ERESTARTSYS` depending on the action's `SA_RESTART`.
    Interrupted,
    /// `block_task2`'s tick budget ran out.
    TimedOut,
}

/// Priority-banded ready queues; band 0 is searched first, FIFO within
/// a band.
pub struct ReadyQueues {
    bands: [alloc::collections::VecDeque<Arc<Task>>; NR_PRIOS],
}

impl ReadyQueues {
    fn new() -> Self {
        ReadyQueues {
            bands: Default::default(),
        }
    }

    /// Task consumed its slice (or is new): back of its band.
    pub fn push_tail(&mut self, t: Arc<Task>) {
        let prio = t.sched.lock().prio.min(NR_PRIOS - 1);
        self.bands[prio].push_back(t);
    }

    /// Freshly woken task: ahead of the slice-consumers in its band.
    pub fn push_front(&mut self, t: Arc<Task>) {
        let prio = t.sched.lock().prio.min(NR_PRIOS - 1);
        self.bands[prio].push_front(t);
    }

    pub fn pick(&mut self) -> Option<Arc<Task>> {
        for band in self.bands.iter_mut() {
            while let Some(t) = band.pop_front() {
                if t.state() == TaskState::Ready {
                    return Some(t);
                }
                // Stopped/zombie stragglers fall out of the queue here.
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(|b| b.len()).sum()
    }
}

lazy_static! {
    pub static ref READY: Mutex<ReadyQueues> = Mutex::new(ReadyQueues::new());

    /// Sleep channels: channel key -> waiting tasks.
    static ref WAITERS: Mutex<BTreeMap<usize, Vec<Arc<Task>>>> = Mutex::new(BTreeMap::new());

    /// Per-CPU idle tasks, indexed by cpu id.
    static ref IDLE_TASKS: Mutex<BTreeMap<usize, Arc<Task>>> = Mutex::new(BTreeMap::new());
}

/// The task this CPU is executing.
pub fn current() -> Option<Arc<Task>> {
    let pid = percpu::this_cpu().current_pid.load(Ordering::Acquire);
    if pid < 0 {
        return None;
    }
    task_by_pid(pid)
}

fn set_current(task: &Arc<Task>) {
    percpu::this_cpu()
        .current_pid
        .store(task.pid, Ordering::Release);
}

/// Channel key derivation: any kernel object address is a channel.
pub fn channel_of<T>(obj: &T) -> usize {
    obj as *const T as usize
}

// ─── init ────────────────────────────────────────────────────────────

/// Adopt the boot thread as task 0's stand-in ("init" proper execs
/// later) and create the BSP idle task.
pub fn init() {
    let boot = new_task("kernel", true, KERNEL_PRIO);
    boot.set_state(TaskState::Running);
    TASK_TABLE.lock().insert(boot.pid, boot.clone());
    set_current(&boot);
    init_idle_for(percpu::this_cpu_id());
    crate::log_info!("scheduler: boot task pid {} online", boot.pid);
}

/// Give `cpu` its always-runnable idle sentinel.
pub fn init_idle_for(cpu: usize) {
    let idle = spawn_kernel_task(idle_entry, "idle");
    idle.sched.lock().prio = NR_PRIOS - 1;
    percpu::CPUS[cpu].idle_pid.store(idle.pid, Ordering::Release);
    // The idle task never sits in the ready queues; pull it back out.
    let mut ready = READY.lock();
    let prio = NR_PRIOS - 1;
    ready.bands[prio].retain(|t| t.pid != idle.pid);
    IDLE_TASKS.lock().insert(cpu, idle);
}

fn idle_entry() {
    idle_loop();
}

/// Halt until something becomes runnable. Entered by APs and by the
/// idle tasks.
pub fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable();
        x86_64::instructions::hlt();
        yield_now();
    }
}

// ─── spawning ────────────────────────────────────────────────────────

/// Spawn a kernel task running `entry` on its own stack.
pub fn spawn_kernel_task(entry: fn(), name: &str) -> Arc<Task> {
    let task = new_task(name, true, KERNEL_PRIO);

    let stack = vec![0u8; TASK_STACK_SIZE].into_boxed_slice();
    let stack_top = (stack.as_ptr() as u64 + TASK_STACK_SIZE as u64) & !0xF;
    unsafe {
        *task.context.get() = Context::new(entry as usize as u64, stack_top);
    }
    *task.kstack.lock() = Some(stack);

    TASK_TABLE.lock().insert(task.pid, task.clone());
    READY.lock().push_tail(task.clone());
    task
}

// ─── the switch ──────────────────────────────────────────────────────

/// Pick and run the next ready task. The outgoing task must already be
/// in the right state (Ready tasks get re-queued, blocked ones do not).
fn schedule() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let cur = match current() {
            Some(c) => c,
            None => return,
        };

        let next = {
            let mut ready = READY.lock();
            match ready.pick() {
                Some(n) => n,
                None => {
                    if cur.state() == TaskState::Running || cur.state() == TaskState::Ready {
                        // Nothing else to do; keep running.
                        cur.set_state(TaskState::Running);
                        return;
                    }
                    let cpu = percpu::this_cpu_id();
                    IDLE_TASKS.lock().get(&cpu).cloned().expect("no idle task")
                }
            }
        };

        if Arc::ptr_eq(&cur, &next) {
            cur.set_state(TaskState::Running);
            return;
        }

        {
            let mut s = cur.sched.lock();
            if s.state == TaskState::Running {
                s.state = TaskState::Ready;
            }
            s.on_cpu = -1;
        }
        if cur.state() == TaskState::Ready && !is_idle(&cur) {
            READY.lock().push_tail(cur.clone());
        }

        let cpu = percpu::this_cpu();
        {
            let mut s = next.sched.lock();
            s.state = TaskState::Running;
            s.on_cpu = cpu.cpuid as i32;
            s.timeslice = DEFAULT_TIMESLICE;
        }
        set_current(&next);

        // Kernel tasks share the kernel directory: skip the CR3 load.
        if let Some(user) = next.user.lock().as_ref() {
            let root = user.space.lock().root_phys();
            if cpu.active_pd.load(Ordering::Acquire) != root.as_u64() {
                cpu.active_pd.store(root.as_u64(), Ordering::Release);
                #[cfg(not(test))]
                unsafe {
                    user.space.lock().activate();
                }
            }
        }

        if let Some(stack) = next.kstack.lock().as_ref() {
            let top = (stack.as_ptr() as u64 + TASK_STACK_SIZE as u64) & !0xF;
            crate::interrupts::gdt::set_tss_rsp0(top);
        }

        let old_ctx = cur.context.get();
        let new_ctx = next.context.get() as *const Context;
        let old_fpu = cur.fpu.get();
        let new_fpu = next.fpu.get() as *const context::FpuState;

        unsafe {
            context::save_fpu(old_fpu);
            context::restore_fpu(new_fpu);
            context::switch_context(old_ctx, new_ctx);
        }
    });
}

fn is_idle(task: &Arc<Task>) -> bool {
    IDLE_TASKS.lock().values().any(|t| Arc::ptr_eq(t, task))
}

/// Cooperatively give up the CPU.
pub fn yield_now() {
    schedule();
}

/// Timer-interrupt hook: account the running task's slice and round-
/// robin it when exhausted.
pub fn preempt_tick() {
    let cur = match current() {
        Some(c) => c,
        None => return,
    };
    let expired = {
        let mut s = cur.sched.lock();
        if s.timeslice > 0 {
            s.timeslice -= 1;
        }
        s.timeslice == 0
    };
    if expired && !is_idle(&cur) {
        schedule();
    }
}

// ─── sleeping and waking ─────────────────────────────────────────────

/// Sleep on `chan`. Interruptible sleeps are also ended by signals.
pub fn block_task(chan: usize, interruptible: bool) -> BlockOutcome {
    let cur = match current() {
        Some(c) => c,
        None => return BlockOutcome::Woken,
    };

    {
        let mut s = cur.sched.lock();
        s.state = if interruptible {
            TaskState::Sleeping
        } else {
            TaskState::Waiting
        };
        s.channel = Some(chan);
        s.woke_by_signal = false;
    }
    WAITERS.lock().entry(chan).or_default().push(cur.clone());

    schedule();

    let mut s = cur.sched.lock();
    s.channel = None;
    if s.woke_by_signal {
        s.woke_by_signal = false;
        BlockOutcome::Interrupted
    } else {
        BlockOutcome::Woken
    }
}

/// Sleep on `chan` with a tick budget.
pub fn block_task2(chan: usize, ticks: u64) -> BlockOutcome {
    let cur = match current() {
        Some(c) => c,
        None => return BlockOutcome::Woken,
    };
    let deadline = crate::time::ticks() + ticks;
    crate::time::register_sleeper(cur.pid, chan, deadline);

    let outcome = block_task(chan, true);
    if outcome == BlockOutcome::Woken && crate::time::ticks() >= deadline {
        return BlockOutcome::TimedOut;
    }
    crate::time::cancel_sleeper(cur.pid);
    outcome
}

fn make_ready(task: &Arc<Task>, boost: bool) {
    {
        let mut s = task.sched.lock();
        if s.state != TaskState::Sleeping && s.state != TaskState::Waiting {
            return;
        }
        s.state = TaskState::Ready;
    }
    let mut ready = READY.lock();
    if boost {
        ready.push_front(task.clone());
    } else {
        ready.push_tail(task.clone());
    }
}

/// Wake every task sleeping on `chan`.
pub fn wake_all(chan: usize) {
    let woken = WAITERS.lock().remove(&chan).unwrap_or_default();
    for task in woken {
        make_ready(&task, true);
    }
}

/// Wake one task sleeping on `chan` (FIFO).
pub fn wake_one(chan: usize) {
    let task = {
        let mut waiters = WAITERS.lock();
        match waiters.get_mut(&chan) {
            Some(list) if !list.is_empty() => Some(list.remove(0)),
            _ => None,
        }
    };
    if let Some(task) = task {
        make_ready(&task, true);
    }
}

/// Signal-side wake: only interruptible sleeps end. Marks the task so
/// the suspension point reports `Interrupted`.
pub fn wake_by_signal(task: &Arc<Task>) {
    let chan = {
        let mut s = task.sched.lock();
        if s.state != TaskState::Sleeping {
            return;
        }
        s.woke_by_signal = true;
        s.channel
    };
    if let Some(chan) = chan {
        let mut waiters = WAITERS.lock();
        if let Some(list) = waiters.get_mut(&chan) {
            list.retain(|t| t.pid != task.pid);
        }
    }
    make_ready(task, true);
}

/// Timer-side wake for `block_task2` sleepers.
pub fn wake_for_timeout(pid: Pid) {
    if let Some(task) = task_by_pid(pid) {
        let chan = task.sched.lock().channel;
        if let Some(chan) = chan {
            let mut waiters = WAITERS.lock();
            if let Some(list) = waiters.get_mut(&chan) {
                list.retain(|t| t.pid != task.pid);
            }
        }
        make_ready(&task, true);
    }
}

// ─── fork ────────────────────────────────────────────────────────────

/// Registers pushed by the syscall entry stub; the child gets an exact
/// copy with RAX forced to 0.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const TRAP_FRAME_SIZE: u64 = core::mem::size_of::<TrapFrame>() as u64;

#[unsafe(naked)]
pub extern "C" fn fork_trampoline() {
    core::arch::naked_asm!(
        "xor rax, rax", // child returns 0
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
    );
}

/// Duplicate the current task. Returns the child pid to the parent; the
/// child wakes in `fork_trampoline` with rax = 0.
pub fn sys_fork() -> KResult<Pid> {
    let parent = current().ok_or(Errno::ESRCH)?;

    // Child address space: fresh directory, CoW view of the parent.
    let child_user = {
        let parent_user = parent.user.lock();
        match parent_user.as_ref() {
            None => None,
            Some(user) => {
                let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
                let mut child_space =
                    AddressSpace::new(&mut *pmm).ok_or(Errno::ENOMEM)?;
                let mem = user.mem.lock();
                let mut parent_space = user.space.lock();
                let child_mem = crate::memory::memregion::clone_address_space(
                    &mem,
                    &mut parent_space,
                    &mut child_space,
                    &mut *pmm,
                    true,
                )
                .ok_or(Errno::ENOMEM)?;
                Some(UserSpace {
                    mem: Arc::new(Mutex::new(child_mem)),
                    space: Arc::new(Mutex::new(child_space)),
                })
            }
        }
    };

    let name = parent.name.lock().clone();
    let child = new_task(&name, parent.kernel_task, parent.sched.lock().prio);

    *child.user.lock() = child_user;
    *child.files.lock() = parent.files.lock().clone();
    *child.creds.lock() = *parent.creds.lock();
    {
        // Signal dispositions are copied, pending signals are not.
        let mut child_sig = child.signals.lock();
        child_sig.blocked = parent.signals.lock().blocked;
        let mut actions = child.actions.lock();
        *actions = parent.actions.lock().clone();
    }
    {
        let parent_ids = parent.ids.lock();
        let mut ids = child.ids.lock();
        ids.parent = parent.pid;
        ids.pgid = parent_ids.pgid;
        ids.sid = parent_ids.sid;
        ids.ctty = parent_ids.ctty;
    }
    parent.ids.lock().children.push(child.pid);

    // Fresh kernel stack carrying a copy of the parent's trap frame.
    let child_stack = vec![0u8; TASK_STACK_SIZE].into_boxed_slice();
    let child_top = (child_stack.as_ptr() as u64 + TASK_STACK_SIZE as u64) & !0xF;
    if let Some(parent_stack) = parent.kstack.lock().as_ref() {
        let parent_top = (parent_stack.as_ptr() as u64 + TASK_STACK_SIZE as u64) & !0xF;
        unsafe {
            let src = (parent_top - TRAP_FRAME_SIZE) as *const TrapFrame;
            let dst = (child_top - TRAP_FRAME_SIZE) as *mut TrapFrame;
            *dst = *src;
        }
    }
    unsafe {
        let ctx = &mut *child.context.get();
        ctx.rsp = child_top - TRAP_FRAME_SIZE;
        ctx.rip = fork_trampoline as usize as u64;
    }
    *child.kstack.lock() = Some(child_stack);

    TASK_TABLE.lock().insert(child.pid, child.clone());
    READY.lock().push_tail(child.clone());
    Ok(child.pid)
}

// ─── exit and wait ───────────────────────────────────────────────────

/// Terminate the current task: release user memory, close files, drop
/// advisory locks, reparent children, notify the parent.
pub fn exit_current(status: i32) -> ! {
    let cur = current().expect("exit without a current task");

    {
        let mut user = cur.user.lock();
        if let Some(space) = user.take() {
            let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
            let mut mem = space.mem.lock();
            let mut aspace = space.space.lock();
            crate::memory::memregion::free_user_pages(&mut mem, &mut aspace, &mut *pmm);
            aspace.free_user_tables(&mut *pmm);
        }
    }

    cur.files.lock().close_all(cur.pid);
    crate::ipc::sem::exit_undo(cur.pid);
    crate::time::drop_task_timers(cur.pid);

    // Orphans go to init (pid 1); init reaps them eventually.
    let children = core::mem::take(&mut cur.ids.lock().children);
    if let Some(init) = task_by_pid(1) {
        let mut init_ids = init.ids.lock();
        for child_pid in &children {
            if let Some(child) = task_by_pid(*child_pid) {
                child.ids.lock().parent = 1;
                init_ids.children.push(*child_pid);
            }
        }
    }

    {
        let mut s = cur.sched.lock();
        s.state = TaskState::Zombie;
        s.exit_status = status;
    }

    let parent_pid = cur.ids.lock().parent;
    if let Some(parent) = task_by_pid(parent_pid) {
        crate::signals::send_signal(&parent, crate::signals::SIGCHLD, None);
        wake_all(wait_channel(parent_pid));
    }

    schedule();
    unreachable!("a zombie was rescheduled");
}

/// Channel a parent waits on for its children.
fn wait_channel(parent: Pid) -> usize {
    0x5741_4954_0000_0000usize ^ parent as usize
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 1;
        const WUNTRACED = 2;
    }
}

/// POSIX `wait4`: harvest a zombie child matching `pid` (-1 = any,
/// 0 = same pgid, < -1 = that pgid, > 0 = exactly).
pub fn sys_wait4(pid: Pid, options: WaitOptions) -> KResult<(Pid, i32)> {
    let cur = current().ok_or(Errno::ESRCH)?;

    loop {
        let children = cur.ids.lock().children.clone();
        if children.is_empty() {
            return Err(Errno::ECHILD);
        }

        let my_pgid = cur.ids.lock().pgid;
        let mut any_match = false;
        let mut reaped: Option<(Pid, i32)> = None;

        for child_pid in &children {
            let child = match task_by_pid(*child_pid) {
                Some(c) => c,
                None => continue,
            };
            let child_pgid = child.ids.lock().pgid;
            let matches = match pid {
                -1 => true,
                0 => child_pgid == my_pgid,
                p if p > 0 => child.pid == p,
                p => child_pgid == -p,
            };
            if !matches {
                continue;
            }
            any_match = true;
            if child.state() == TaskState::Zombie {
                reaped = Some((child.pid, child.exit_status()));
                break;
            }
        }

        if let Some((dead_pid, status)) = reaped {
            TASK_TABLE.lock().remove(&dead_pid);
            cur.ids.lock().children.retain(|&c| c != dead_pid);
            return Ok((dead_pid, status));
        }

        if !any_match {
            return Err(Errno::ECHILD);
        }
        if options.contains(WaitOptions::WNOHANG) {
            return Ok((0, 0));
        }

        if block_task(wait_channel(cur.pid), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

/// Snapshot for `/proc` and diagnostics.
pub fn list_tasks() -> Vec<(Pid, String, TaskState)> {
    TASK_TABLE
        .lock()
        .values()
        .map(|t| (t.pid, t.name.lock().clone(), t.state()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_task(name: &str, prio: usize) -> Arc<Task> {
        let t = new_task(name, false, prio);
        t.set_state(TaskState::Ready);
        t
    }

    #[test]
    fn pick_prefers_lower_band_and_fifo_within() {
        let mut q = ReadyQueues::new();
        let lo = ready_task("lo", 6);
        let hi1 = ready_task("hi1", 2);
        let hi2 = ready_task("hi2", 2);
        q.push_tail(lo.clone());
        q.push_tail(hi1.clone());
        q.push_tail(hi2.clone());

        assert_eq!(q.pick().unwrap().pid, hi1.pid);
        assert_eq!(q.pick().unwrap().pid, hi2.pid);
        assert_eq!(q.pick().unwrap().pid, lo.pid);
        assert!(q.pick().is_none());
    }

    #[test]
    fn woken_tasks_jump_ahead_of_slice_consumers() {
        let mut q = ReadyQueues::new();
        let old = ready_task("old", 4);
        let woken = ready_task("woken", 4);
        q.push_tail(old.clone());
        q.push_front(woken.clone());
        assert_eq!(q.pick().unwrap().pid, woken.pid);
        assert_eq!(q.pick().unwrap().pid, old.pid);
    }

    #[test]
    fn pick_skips_tasks_that_stopped_while_queued() {
        let mut q = ReadyQueues::new();
        let a = ready_task("a", 4);
        let b = ready_task("b", 4);
        q.push_tail(a.clone());
        q.push_tail(b.clone());
        a.set_state(TaskState::Stopped);
        assert_eq!(q.pick().unwrap().pid, b.pid);
    }
}
