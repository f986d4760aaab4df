//! The syscall boundary: number dispatch, user-pointer checking, errno
//! conversion and per-call glue into the subsystems.
//!
//! Numbering follows the x86_64 convention userland toolchains expect.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::fs::alock::{flock_range, LockType};
use crate::fs::fd::{FileKind, OpenFile, O_CLOEXEC, O_NONBLOCK};
use crate::fs::node::Node;
use crate::memory::memregion::{MemRegion, Prot, RegionFlags, RegionType};
use crate::memory::paging::PteFlags;
use crate::memory::PAGE_SIZE;
use crate::scheduler::{self, BlockOutcome, Task, WaitOptions};
use crate::signals;
use crate::time::{ITimer, ITimerKind, HZ};
use crate::tty::{self, TtyIoctl, TtyIoctlReply};

pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_OPEN: u64 = 2;
pub const SYS_CLOSE: u64 = 3;
pub const SYS_LSEEK: u64 = 8;
pub const SYS_MMAP: u64 = 9;
pub const SYS_MPROTECT: u64 = 10;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_BRK: u64 = 12;
pub const SYS_SIGACTION: u64 = 13;
pub const SYS_SIGPROCMASK: u64 = 14;
pub const SYS_SIGRETURN: u64 = 15;
pub const SYS_IOCTL: u64 = 16;
pub const SYS_PIPE: u64 = 22;
pub const SYS_SELECT: u64 = 23;
pub const SYS_DUP: u64 = 32;
pub const SYS_DUP2: u64 = 33;
pub const SYS_GETPID: u64 = 39;
pub const SYS_FORK: u64 = 57;
pub const SYS_EXECVE: u64 = 59;
pub const SYS_EXIT: u64 = 60;
pub const SYS_WAIT4: u64 = 61;
pub const SYS_KILL: u64 = 62;
pub const SYS_FCNTL: u64 = 72;
pub const SYS_FLOCK: u64 = 73;
pub const SYS_GETITIMER: u64 = 36;
pub const SYS_ALARM: u64 = 37;
pub const SYS_SETITIMER: u64 = 38;
pub const SYS_SEMGET: u64 = 64;
pub const SYS_SEMOP: u64 = 65;
pub const SYS_SEMCTL: u64 = 66;
pub const SYS_SHMGET: u64 = 29;
pub const SYS_SHMAT: u64 = 30;
pub const SYS_SHMCTL: u64 = 31;
pub const SYS_SHMDT: u64 = 67;
pub const SYS_MSGGET: u64 = 68;
pub const SYS_MSGSND: u64 = 69;
pub const SYS_MSGRCV: u64 = 70;
pub const SYS_MSGCTL: u64 = 71;
pub const SYS_GETPPID: u64 = 110;
pub const SYS_SETPGID: u64 = 109;
pub const SYS_GETPGID: u64 = 121;
pub const SYS_SETSID: u64 = 112;
pub const SYS_SIGSUSPEND: u64 = 130;
pub const SYS_MOUNT: u64 = 165;
pub const SYS_UMOUNT: u64 = 166;
pub const SYS_TKILL: u64 = 200;
pub const SYS_TIMER_CREATE: u64 = 222;
pub const SYS_TIMER_SETTIME: u64 = 223;
pub const SYS_TIMER_GETTIME: u64 = 224;
pub const SYS_TIMER_GETOVERRUN: u64 = 225;
pub const SYS_TIMER_DELETE: u64 = 226;
pub const SYS_DUP3: u64 = 292;
pub const SYS_POLL: u64 = 7;

// fcntl commands.
const F_DUPFD: u64 = 0;
const F_GETFD: u64 = 1;
const F_SETFD: u64 = 2;
const F_GETFL: u64 = 3;
const F_SETFL: u64 = 4;
const F_GETLK: u64 = 5;
const F_SETLK: u64 = 6;
const F_SETLKW: u64 = 7;

const F_RDLCK: i16 = 0;
const F_WRLCK: i16 = 1;
const F_UNLCK: i16 = 2;

// flock() operations.
const LOCK_SH: u64 = 1;
const LOCK_EX: u64 = 2;
const LOCK_NB: u64 = 4;
const LOCK_UN: u64 = 8;

/// `struct flock` as userland lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserFlock {
    pub l_type: i16,
    pub l_whence: i16,
    pub l_start: i64,
    pub l_len: i64,
    pub l_pid: i32,
}

pub fn init() {
    crate::log_info!("syscall: interface ready");
}

// ─── user-pointer plumbing ───────────────────────────────────────────

fn check_user_range(addr: u64, len: usize) -> KResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::EFAULT)?;
    if addr == 0 || !crate::memory::paging::is_user_addr(end - 1) {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

/// Borrow a user buffer. The caller's address space is live, so the
/// access faults through the normal demand-paging path.
fn user_slice<'a>(addr: u64, len: usize) -> KResult<&'a [u8]> {
    check_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_slice_mut<'a>(addr: u64, len: usize) -> KResult<&'a mut [u8]> {
    check_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

fn user_value<T: Copy>(addr: u64) -> KResult<T> {
    check_user_range(addr, core::mem::size_of::<T>())?;
    Ok(unsafe { core::ptr::read_unaligned(addr as *const T) })
}

fn put_user_value<T: Copy>(addr: u64, value: T) -> KResult<()> {
    check_user_range(addr, core::mem::size_of::<T>())?;
    unsafe { core::ptr::write_unaligned(addr as *mut T, value) };
    Ok(())
}

fn user_cstr(addr: u64) -> KResult<String> {
    const MAX: usize = 4096;
    check_user_range(addr, 1)?;
    let mut out = Vec::new();
    for i in 0..MAX {
        let b = unsafe { core::ptr::read((addr + i as u64) as *const u8) };
        if b == 0 {
            return String::from_utf8(out).map_err(|_| Errno::EINVAL);
        }
        out.push(b);
    }
    Err(Errno::ENAMETOOLONG)
}

/// NULL-terminated array of string pointers (argv/envp).
fn user_str_array(addr: u64) -> KResult<Vec<String>> {
    const MAX: usize = 64;
    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    for i in 0..MAX {
        let ptr: u64 = user_value(addr + (i * 8) as u64)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(user_cstr(ptr)?);
    }
    Err(Errno::E2BIG)
}

fn current() -> KResult<Arc<Task>> {
    scheduler::current().ok_or(Errno::ESRCH)
}

fn ok_or_ret(result: KResult<u64>) -> u64 {
    match result {
        Ok(v) => v,
        Err(e) => e.as_ret(),
    }
}

// ─── dispatch ────────────────────────────────────────────────────────

/// Central dispatcher, called from the int 0x80 entry stub. Returns the
/// value for the user's RAX.
pub extern "C" fn dispatch(number: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> u64 {
    // The gate masked IF; long syscalls must stay preemptible.
    x86_64::instructions::interrupts::enable();

    let ret = match number {
        SYS_READ => ok_or_ret(sys_read(a0, a1, a2)),
        SYS_WRITE => ok_or_ret(sys_write(a0, a1, a2)),
        SYS_OPEN => ok_or_ret(sys_open(a0, a1)),
        SYS_CLOSE => ok_or_ret(sys_close(a0)),
        SYS_LSEEK => ok_or_ret(sys_lseek(a0, a1, a2)),
        SYS_DUP => ok_or_ret(sys_dup(a0)),
        SYS_DUP2 => ok_or_ret(sys_dup23(a0, a1, 0)),
        SYS_DUP3 => ok_or_ret(sys_dup23(a0, a1, a2)),
        SYS_PIPE => ok_or_ret(sys_pipe(a0)),
        SYS_IOCTL => ok_or_ret(sys_ioctl(a0, a1, a2)),
        SYS_FCNTL => ok_or_ret(sys_fcntl(a0, a1, a2)),
        SYS_FLOCK => ok_or_ret(sys_flock(a0, a1)),
        SYS_SELECT | SYS_POLL => ok_or_ret(sys_select(a0, a1, a2, a3)),

        SYS_MMAP => ok_or_ret(sys_mmap(a0, a1, a2, a3)),
        SYS_MPROTECT => ok_or_ret(sys_mprotect(a0, a1, a2)),
        SYS_MUNMAP => ok_or_ret(sys_munmap(a0, a1)),
        SYS_BRK => ok_or_ret(sys_brk(a0)),

        SYS_FORK => ok_or_ret(scheduler::sys_fork().map(|pid| pid as u64)),
        SYS_EXECVE => ok_or_ret(sys_execve(a0, a1, a2)),
        SYS_EXIT => {
            scheduler::exit_current(a0 as i32);
        }
        SYS_WAIT4 => ok_or_ret(sys_wait4(a0, a1, a2)),
        SYS_GETPID => ok_or_ret(current().map(|t| t.pid as u64)),
        SYS_GETPPID => ok_or_ret(current().map(|t| t.ids.lock().parent as u64)),
        SYS_SETPGID => ok_or_ret(sys_setpgid(a0, a1)),
        SYS_GETPGID => ok_or_ret(sys_getpgid(a0)),
        SYS_SETSID => ok_or_ret(sys_setsid()),

        SYS_KILL => ok_or_ret(sys_kill(a0, a1)),
        SYS_TKILL => ok_or_ret(sys_tkill(a0, a1)),
        SYS_SIGACTION => ok_or_ret(sys_sigaction(a0, a1, a2)),
        SYS_SIGPROCMASK => ok_or_ret(sys_sigprocmask(a0, a1, a2)),
        SYS_SIGSUSPEND => ok_or_ret(sys_sigsuspend(a0)),
        SYS_SIGRETURN => ok_or_ret(sys_sigreturn()),

        SYS_GETITIMER => ok_or_ret(sys_getitimer(a0, a1)),
        SYS_SETITIMER => ok_or_ret(sys_setitimer(a0, a1, a2)),
        SYS_ALARM => ok_or_ret(sys_alarm(a0)),
        SYS_TIMER_CREATE => ok_or_ret(sys_timer_create(a0)),
        SYS_TIMER_SETTIME => ok_or_ret(sys_timer_settime(a0, a1, a2)),
        SYS_TIMER_GETTIME => ok_or_ret(sys_timer_gettime(a0, a1)),
        SYS_TIMER_GETOVERRUN => ok_or_ret(sys_timer_getoverrun(a0)),
        SYS_TIMER_DELETE => ok_or_ret(sys_timer_delete(a0)),

        SYS_MSGGET => ok_or_ret(sys_msgget(a0, a1)),
        SYS_MSGSND => ok_or_ret(sys_msgsnd(a0, a1, a2, a3)),
        SYS_MSGRCV => ok_or_ret(sys_msgrcv(a0, a1, a2, a3, a4)),
        SYS_MSGCTL => ok_or_ret(sys_msgctl(a0, a1)),
        SYS_SEMGET => ok_or_ret(sys_semget(a0, a1, a2)),
        SYS_SEMOP => ok_or_ret(sys_semop(a0, a1, a2)),
        SYS_SEMCTL => ok_or_ret(sys_semctl(a0, a1, a2, a3)),
        SYS_SHMGET => ok_or_ret(sys_shmget(a0, a1, a2)),
        SYS_SHMAT => ok_or_ret(sys_shmat(a0, a1, a2)),
        SYS_SHMDT => ok_or_ret(sys_shmdt(a0)),
        SYS_SHMCTL => ok_or_ret(sys_shmctl(a0, a1)),

        SYS_MOUNT => ok_or_ret(sys_mount(a0, a1, a2)),
        SYS_UMOUNT => ok_or_ret(sys_umount(a0)),

        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            Errno::ENOSYS.as_ret()
        }
    };

    deliver_signals_on_exit(number, ret)
}

/// Return-to-user edge: deliver pending signals. Restart-capable
/// syscalls interrupted under `SA_RESTART` report `ERESTARTSYS`, which
/// the entry stub replays; otherwise `EINTR` reaches the user.
fn deliver_signals_on_exit(_number: u64, ret: u64) -> u64 {
    let task = match scheduler::current() {
        Some(t) => t,
        None => return ret,
    };
    if task.kernel_task {
        return ret;
    }

    let mut ret = ret;
    while let Some(delivery) = signals::next_delivery(&task) {
        match delivery {
            signals::Delivery::Handle {
                sig,
                info,
                action,
                old_blocked,
            } => {
                if ret as i64 == -(Errno::EINTR as i64)
                    && action.flags.contains(signals::SaFlags::RESTART)
                {
                    ret = Errno::ERESTARTSYS.as_ret();
                }
                push_signal_frame(&task, sig, &info, &action, old_blocked);
                break;
            }
            signals::Delivery::Terminate { sig, core: _ } => {
                scheduler::exit_current(128 + sig);
            }
            signals::Delivery::Stop => {
                task.set_state(scheduler::TaskState::Stopped);
                scheduler::yield_now();
            }
            signals::Delivery::Continue => {}
        }
    }
    ret
}

/// Saved context a signal handler returns through (`sigreturn`).
#[repr(C)]
#[derive(Clone, Copy)]
struct SignalFrame {
    restorer: u64,
    info: signals::SigInfo,
    old_blocked: u32,
    old_frame: scheduler::TrapFrame,
}

/// Redirect the interrupted user context into the handler: the old trap
/// frame moves onto the user stack inside a `SignalFrame`, RIP becomes
/// the handler and RSP the frame.
fn push_signal_frame(
    task: &Arc<Task>,
    sig: i32,
    info: &signals::SigInfo,
    action: &signals::SigAction,
    old_blocked: u32,
) {
    let handler = match action.handler {
        signals::SigHandler::Handler(h) => h,
        _ => return,
    };

    let restorer = if action.restorer != 0 {
        action.restorer
    } else {
        crate::loader::elf::VDSO_BASE
    };

    let kstack = task.kstack.lock();
    let stack = match kstack.as_ref() {
        Some(s) => s,
        None => return,
    };
    let top = (stack.as_ptr() as u64 + scheduler::TASK_STACK_SIZE as u64) & !0xF;
    let trap = (top - scheduler::TRAP_FRAME_SIZE) as *mut scheduler::TrapFrame;

    unsafe {
        let user_rsp = (*trap).rsp;
        let frame_addr =
            (user_rsp - core::mem::size_of::<SignalFrame>() as u64 - 128) & !0xF;
        let frame = SignalFrame {
            restorer,
            info: *info,
            old_blocked,
            old_frame: *trap,
        };
        if check_user_range(frame_addr, core::mem::size_of::<SignalFrame>()).is_err() {
            // Unusable stack: fall back to the default disposition.
            crate::signals::send_signal(task, signals::SIGKILL, None);
            return;
        }
        core::ptr::write_unaligned(frame_addr as *mut SignalFrame, frame);

        (*trap).rip = handler;
        (*trap).rsp = frame_addr;
        (*trap).rdi = sig as u64;
        (*trap).rsi = frame_addr + 8; // &frame.info
        (*trap).rdx = 0;
        // The handler returns into the vdso trampoline, which issues
        // sigreturn.
        (*trap).rcx = restorer;
    }
}

fn sys_sigreturn() -> KResult<u64> {
    let task = current()?;
    let kstack = task.kstack.lock();
    let stack = kstack.as_ref().ok_or(Errno::EFAULT)?;
    let top = (stack.as_ptr() as u64 + scheduler::TASK_STACK_SIZE as u64) & !0xF;
    let trap = (top - scheduler::TRAP_FRAME_SIZE) as *mut scheduler::TrapFrame;

    unsafe {
        let frame_addr = (*trap).rsp;
        let frame: SignalFrame = user_value(frame_addr)?;
        task.signals.lock().blocked = frame.old_blocked;
        *trap = frame.old_frame;
    }
    Ok(0)
}

// ─── file syscalls ───────────────────────────────────────────────────

fn sys_read(fd: u64, buf: u64, len: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;
    let slice = user_slice_mut(buf, len as usize)?;
    crate::fs::file_read(&file, slice).map(|n| n as u64)
}

fn sys_write(fd: u64, buf: u64, len: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;
    let slice = user_slice(buf, len as usize)?;
    crate::fs::file_write(&file, slice).map(|n| n as u64)
}

fn sys_open(path: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let path = user_cstr(path)?;
    let file = crate::fs::open_file(&path, flags as u32)?;
    let cloexec = flags as u32 & O_CLOEXEC != 0;
    let fd = task.files.lock().install(file, cloexec)?;
    Ok(fd as u64)
}

fn sys_close(fd: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().remove(fd as usize)?;
    crate::fs::file_closed(&file, task.pid);
    Ok(0)
}

fn sys_lseek(fd: u64, offset: u64, whence: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;
    crate::fs::file_lseek(&file, offset as i64, whence as u32)
}

fn sys_dup(fd: u64) -> KResult<u64> {
    let task = current()?;
    let mut files = task.files.lock();
    let file = files.get(fd as usize)?;
    files.install(file, false).map(|fd| fd as u64)
}

fn sys_dup23(old: u64, new: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let mut files = task.files.lock();
    let file = files.get(old as usize)?;
    if old == new {
        return Ok(new);
    }
    if let Ok(previous) = files.remove(new as usize) {
        crate::fs::file_closed(&previous, task.pid);
    }
    files
        .install_at(new as usize, file, flags as u32 & O_CLOEXEC != 0)
        .map(|fd| fd as u64)
}

fn sys_pipe(fds_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let pipe = crate::fs::pipe::Pipe::new();
    let read_end = OpenFile::new(FileKind::PipeRead(pipe.clone()), 0, "pipe:[r]");
    let write_end = OpenFile::new(FileKind::PipeWrite(pipe), 1, "pipe:[w]");

    let mut files = task.files.lock();
    let rfd = files.install(read_end, false)?;
    let wfd = match files.install(write_end, false) {
        Ok(fd) => fd,
        Err(e) => {
            let file = files.remove(rfd)?;
            drop(files);
            crate::fs::file_closed(&file, task.pid);
            return Err(e);
        }
    };
    drop(files);

    put_user_value(fds_ptr, [rfd as u32, wfd as u32])?;
    Ok(0)
}

fn node_of(file: &Arc<OpenFile>) -> KResult<Arc<Node>> {
    match &file.kind {
        FileKind::Node(n) => Ok(n.clone()),
        _ => Err(Errno::EBADF),
    }
}

fn sys_fcntl(fd: u64, cmd: u64, arg: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;
    match cmd {
        F_DUPFD => {
            let mut files = task.files.lock();
            files
                .install_from(arg as usize, file, false)
                .map(|fd| fd as u64)
        }
        F_GETFD => task
            .files
            .lock()
            .cloexec(fd as usize)
            .map(|c| c as u64),
        F_SETFD => {
            task.files.lock().set_cloexec(fd as usize, arg & 1 != 0)?;
            Ok(0)
        }
        F_GETFL => Ok(*file.flags.lock() as u64),
        F_SETFL => {
            // Only the status flags may change.
            let settable = O_NONBLOCK | crate::fs::fd::O_APPEND;
            let mut flags = file.flags.lock();
            *flags = (*flags & !settable) | (arg as u32 & settable);
            Ok(0)
        }
        F_GETLK | F_SETLK | F_SETLKW => fcntl_lock(&task, &file, cmd, arg),
        _ => Err(Errno::EINVAL),
    }
}

/// Advisory-lock half of fcntl. `F_SETLKW` sleeps on the node's lock
/// channel; a signal aborts with `ERESTARTSYS` so restartable callers
/// retry transparently.
fn fcntl_lock(task: &Arc<Task>, file: &Arc<OpenFile>, cmd: u64, arg: u64) -> KResult<u64> {
    let node = node_of(file)?;
    let mut flock: UserFlock = user_value(arg)?;

    // l_whence: SEEK_SET/CUR/END relative starts.
    let base = match flock.l_whence as u32 {
        crate::fs::SEEK_SET => 0,
        crate::fs::SEEK_CUR => *file.pos.lock() as i64,
        crate::fs::SEEK_END => node.inner.lock().size as i64,
        _ => return Err(Errno::EINVAL),
    };
    let (start, end) = flock_range(base + flock.l_start, flock.l_len).ok_or(Errno::EINVAL)?;

    let ltype = match flock.l_type {
        F_RDLCK => LockType::Read,
        F_WRLCK => LockType::Write,
        F_UNLCK => {
            node.alocks.lock().remove_lock(start, end, task.pid);
            scheduler::wake_all(node.channel());
            return Ok(0);
        }
        _ => return Err(Errno::EINVAL),
    };

    if cmd == F_GETLK {
        match node.alocks.lock().conflicting(start, end, ltype, task.pid) {
            Some(blocker) => {
                flock.l_type = match blocker.ltype {
                    LockType::Read => F_RDLCK,
                    LockType::Write => F_WRLCK,
                };
                flock.l_whence = 0;
                flock.l_start = blocker.start;
                flock.l_len = if blocker.end == crate::fs::alock::END_OF_FILE {
                    0
                } else {
                    blocker.end - blocker.start + 1
                };
                flock.l_pid = blocker.pid;
            }
            None => flock.l_type = F_UNLCK,
        }
        put_user_value(arg, flock)?;
        return Ok(0);
    }

    loop {
        {
            let mut locks = node.alocks.lock();
            if locks.conflicting(start, end, ltype, task.pid).is_none() {
                locks.add_lock(start, end, ltype, task.pid);
                return Ok(0);
            }
        }
        if cmd == F_SETLK {
            return Err(Errno::EAGAIN);
        }
        if scheduler::block_task(node.channel(), true) == BlockOutcome::Interrupted {
            return Err(Errno::ERESTARTSYS);
        }
    }
}

/// BSD `flock`: whole-file locks layered on the same chain.
fn sys_flock(fd: u64, op: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;
    let node = node_of(&file)?;

    if op & LOCK_UN != 0 {
        node.alocks.lock().remove_all_for(task.pid);
        scheduler::wake_all(node.channel());
        return Ok(0);
    }
    let ltype = if op & LOCK_EX != 0 {
        LockType::Write
    } else if op & LOCK_SH != 0 {
        LockType::Read
    } else {
        return Err(Errno::EINVAL);
    };

    loop {
        {
            let mut locks = node.alocks.lock();
            if locks
                .conflicting(0, crate::fs::alock::END_OF_FILE, ltype, task.pid)
                .is_none()
            {
                locks.add_lock(0, crate::fs::alock::END_OF_FILE, ltype, task.pid);
                return Ok(0);
            }
        }
        if op & LOCK_NB != 0 {
            return Err(Errno::EAGAIN);
        }
        if scheduler::block_task(node.channel(), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

fn sys_ioctl(fd: u64, cmd: u64, arg: u64) -> KResult<u64> {
    let task = current()?;
    let file = task.files.lock().get(fd as usize)?;

    let minor = match &file.kind {
        FileKind::Tty(minor) => *minor,
        FileKind::Node(node) => {
            let rdev = node.inner.lock().rdev;
            if crate::fs::node::dev_major(rdev) == tty::TTY_MAJOR {
                crate::fs::node::dev_minor(rdev) as usize
            } else {
                // Non-tty device ioctls route through the char switch.
                return crate::fs::devfs::chardev(crate::fs::node::dev_major(rdev))
                    .ok_or(Errno::ENOTTY)?
                    .ioctl(crate::fs::node::dev_minor(rdev), cmd as u32, arg as usize)
                    .map(|v| v as u64);
            }
        }
        _ => return Err(Errno::ENOTTY),
    };

    let req = match cmd as u32 {
        tty::TCGETS => TtyIoctl::GetTermios,
        tty::TCSETS => TtyIoctl::SetTermios {
            termios: user_value(arg)?,
            flush: false,
        },
        tty::TCSETSW => TtyIoctl::SetTermios {
            termios: user_value(arg)?,
            flush: false,
        },
        tty::TCSETSF => TtyIoctl::SetTermios {
            termios: user_value(arg)?,
            flush: true,
        },
        tty::TIOCGPGRP => TtyIoctl::GetPgrp,
        tty::TIOCSPGRP => TtyIoctl::SetPgrp {
            pgrp: user_value(arg)?,
        },
        tty::TIOCGWINSZ => TtyIoctl::GetWinSize,
        tty::TIOCSWINSZ => TtyIoctl::SetWinSize {
            size: user_value(arg)?,
        },
        tty::TIOCSCTTY => TtyIoctl::SetCtty { force: arg != 0 },
        tty::TIOCNOTTY => TtyIoctl::DropCtty,
        tty::VT_SWITCH_TTY => TtyIoctl::SwitchTty {
            target: arg as usize,
        },
        tty::VT_GRAPHICS_MODE => TtyIoctl::GraphicsMode { on: arg != 0 },
        _ => return Err(Errno::ENOTTY),
    };

    match tty::tty_ioctl(minor, &task, req)? {
        TtyIoctlReply::None => Ok(0),
        TtyIoctlReply::Termios(t) => {
            put_user_value(arg, t)?;
            Ok(0)
        }
        TtyIoctlReply::Pgrp(pgrp) => {
            put_user_value(arg, pgrp)?;
            Ok(0)
        }
        TtyIoctlReply::WinSize(ws) => {
            put_user_value(arg, ws)?;
            Ok(0)
        }
    }
}

/// poll/select over fd readiness with a tick deadline. Readiness is
/// re-scanned after every wakeup; the wait rides the timer wheel.
fn sys_select(nfds: u64, read_set: u64, write_set: u64, timeout_ticks: u64) -> KResult<u64> {
    let task = current()?;
    let deadline = crate::time::ticks().saturating_add(if timeout_ticks == 0 {
        u64::MAX - crate::time::ticks()
    } else {
        timeout_ticks
    });

    loop {
        let mut ready = 0u64;
        let mut read_out = 0u64;
        let mut write_out = 0u64;
        {
            let files = task.files.lock();
            for fd in 0..(nfds as usize).min(crate::fs::fd::NR_OPEN) {
                let bit = 1u64 << fd;
                let want_read = read_set & bit != 0;
                let want_write = write_set & bit != 0;
                if !want_read && !want_write {
                    continue;
                }
                let file = files.get(fd)?;
                if want_read && file_can_read(&file) {
                    read_out |= bit;
                    ready += 1;
                }
                if want_write && file_can_write(&file) {
                    write_out |= bit;
                    ready += 1;
                }
            }
        }
        if ready > 0 {
            // Result masks are returned in the two upper halves the
            // userland wrapper unpacks.
            return Ok((read_out & 0xFFFF_FFFF) | (write_out << 32) | 0);
        }
        let now = crate::time::ticks();
        if now >= deadline {
            return Ok(0);
        }
        let chan = scheduler::channel_of(&*task);
        match scheduler::block_task2(chan, (deadline - now).min(2)) {
            BlockOutcome::Interrupted => return Err(Errno::EINTR),
            _ => {}
        }
    }
}

fn file_can_read(file: &Arc<OpenFile>) -> bool {
    match &file.kind {
        FileKind::Node(node) => crate::fs::vfs::VFS
            .lock()
            .ops_for(node.dev)
            .map(|ops| ops.can_read(node))
            .unwrap_or(false),
        FileKind::PipeRead(p) => !p.is_empty() || p.writers() == 0,
        FileKind::PipeWrite(_) => false,
        FileKind::Tty(minor) => tty::tty_can_read(*minor),
    }
}

fn file_can_write(file: &Arc<OpenFile>) -> bool {
    match &file.kind {
        FileKind::Node(node) => crate::fs::vfs::VFS
            .lock()
            .ops_for(node.dev)
            .map(|ops| ops.can_write(node))
            .unwrap_or(false),
        FileKind::PipeWrite(p) => !p.is_full() || p.readers() == 0,
        FileKind::PipeRead(_) => false,
        FileKind::Tty(minor) => tty::tty_can_write(*minor),
    }
}

// ─── mounts ──────────────────────────────────────────────────────────

/// Device ids for filesystems mounted at run time.
static NEXT_MOUNT_DEV: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(16);

fn sys_mount(src: u64, target: u64, fstype: u64) -> KResult<u64> {
    let task = current()?;
    if !task.creds.lock().is_superuser() {
        return Err(Errno::EPERM);
    }
    let source = user_cstr(src)?;
    let target = user_cstr(target)?;
    let fstype = user_cstr(fstype)?;

    // Disk filesystems are external modules; the in-tree mountable is
    // tmpfs.
    if fstype != "tmpfs" {
        return Err(Errno::ENODEV);
    }

    let mut vfs = crate::fs::vfs::VFS.lock();
    let dir = vfs.namei(&target)?;
    if !dir.is_dir() {
        vfs.release_node(&dir)?;
        return Err(Errno::ENOTDIR);
    }
    let covers = (dir.dev, dir.ino);
    vfs.release_node(&dir)?;

    let dev = NEXT_MOUNT_DEV.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
    let fs = crate::fs::tmpfs::TmpFs::new(dev);
    vfs.mount(
        dev,
        crate::fs::tmpfs::TmpFs::ROOT_INO,
        Some(covers),
        fs,
        &source,
    )?;
    Ok(0)
}

fn sys_umount(target: u64) -> KResult<u64> {
    let task = current()?;
    if !task.creds.lock().is_superuser() {
        return Err(Errno::EPERM);
    }
    let target = user_cstr(target)?;
    let mut vfs = crate::fs::vfs::VFS.lock();
    let node = vfs.namei(&target)?;
    let dev = node.dev;
    vfs.release_node(&node)?;
    vfs.umount(dev)?;
    crate::fs::dentry::forget_dev(dev);
    Ok(0)
}

// ─── memory syscalls ─────────────────────────────────────────────────

const MAP_SHARED: u64 = 1;
const MAP_PRIVATE: u64 = 2;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

const PROT_READ: u64 = 1;
const PROT_WRITE: u64 = 2;
const PROT_EXEC: u64 = 4;

fn prot_from(prot: u64) -> Prot {
    let mut p = Prot::empty();
    if prot & PROT_READ != 0 {
        p |= Prot::READ;
    }
    if prot & PROT_WRITE != 0 {
        p |= Prot::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        p |= Prot::EXEC;
    }
    p
}

fn sys_mmap(addr: u64, len: u64, prot: u64, flags: u64) -> KResult<u64> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let task = current()?;
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::ENOMEM)?;
    let mut mem = user_space.mem.lock();

    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let base = if addr == 0 {
        // Kernel-chosen placement.
        mem.find_free_range(len, 0x2000_0000, crate::loader::elf::USER_STACK_TOP - RESERVE_GAP)
            .ok_or(Errno::ENOMEM)?
    } else {
        if addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        if !(flags & MAP_FIXED != 0) && mem.region_containing(addr).is_some() {
            // Overlap with an existing mapping without MAP_FIXED.
            return Err(Errno::EINVAL);
        }
        addr
    };

    if flags & (MAP_SHARED | MAP_PRIVATE) == 0 {
        return Err(Errno::EINVAL);
    }
    if flags & MAP_ANONYMOUS == 0 {
        // File-backed mappings are established by exec's demand paging;
        // the fd form of mmap is not wired up.
        return Err(Errno::ENOSYS);
    }
    let mut rflags = RegionFlags::USER | RegionFlags::DEMAND;
    rflags |= if flags & MAP_SHARED != 0 {
        RegionFlags::SHARED
    } else {
        RegionFlags::PRIVATE
    };

    mem.insert(MemRegion::anon(
        base,
        base + len,
        prot_from(prot),
        rflags,
        RegionType::Data,
    ))?;
    Ok(base)
}

const RESERVE_GAP: u64 = 16 * 1024 * 1024;

fn sys_munmap(addr: u64, len: u64) -> KResult<u64> {
    if addr % PAGE_SIZE != 0 || len == 0 {
        return Err(Errno::EINVAL);
    }
    let task = current()?;
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::EINVAL)?;
    let mut mem = user_space.mem.lock();
    let mut space = user_space.space.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();

    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let idx = mem
        .regions
        .iter()
        .position(|r| r.start == addr && r.end == addr + len)
        .ok_or(Errno::EINVAL)?;
    let region = mem.regions.remove(idx);

    let mut va = region.start;
    while va < region.end {
        if let Some(old) = space.unmap_page(va, &mut *pmm) {
            pmm.dec_frame_shares(old.frame());
            crate::memory::tlb_shootdown(va);
        }
        va += PAGE_SIZE;
    }
    Ok(0)
}

fn sys_mprotect(addr: u64, len: u64, prot: u64) -> KResult<u64> {
    if addr % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let task = current()?;
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::EINVAL)?;
    let mut mem = user_space.mem.lock();
    let mut space = user_space.space.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();

    let new_prot = prot_from(prot);
    let end = addr + ((len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1));
    let region = mem.region_containing_mut(addr).ok_or(Errno::ENOMEM)?;
    if end > region.end {
        return Err(Errno::ENOMEM);
    }
    region.prot = new_prot;

    // Already-mapped pages change flags in place; every affected CPU
    // must drop its stale translation before the syscall returns.
    space.for_each_present(addr, end, &mut *pmm, |va, e| {
        let mut flags = e.flags();
        if new_prot.contains(Prot::WRITE) && !flags.contains(PteFlags::COW) {
            flags |= PteFlags::WRITABLE;
        } else {
            flags -= PteFlags::WRITABLE;
        }
        e.set_flags(flags);
        crate::memory::paging::flush_tlb_entry(va);
        crate::memory::tlb_shootdown(va);
    });
    Ok(0)
}

fn sys_brk(new_end: u64) -> KResult<u64> {
    let task = current()?;
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::ENOMEM)?;
    let mut mem = user_space.mem.lock();

    if mem.heap_start == 0 {
        // First call establishes the break just past the data segments.
        let top = mem
            .regions
            .iter()
            .filter(|r| r.rtype != RegionType::Stack)
            .map(|r| r.end)
            .max()
            .unwrap_or(0x1000_0000);
        mem.heap_start = top;
        mem.heap_end = top;
    }
    if new_end == 0 {
        return Ok(mem.heap_end);
    }
    if new_end < mem.heap_start {
        return Err(Errno::ENOMEM);
    }

    let aligned = (new_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let old_aligned = (mem.heap_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if aligned > old_aligned {
        let heap_start = mem.heap_start;
        // Replace (or create) the heap VMA covering the whole break.
        mem.regions
            .retain(|r| !(r.rtype == RegionType::Data && r.start == heap_start && r.flags.contains(RegionFlags::DEMAND) && r.backing.is_none() && r.end == old_aligned));
        mem.insert(MemRegion::anon(
            heap_start,
            aligned,
            Prot::READ | Prot::WRITE,
            RegionFlags::PRIVATE | RegionFlags::USER | RegionFlags::DEMAND,
            RegionType::Data,
        ))?;
    }
    mem.heap_end = new_end;
    Ok(new_end)
}

// ─── process syscalls ────────────────────────────────────────────────

fn sys_execve(path: u64, argv: u64, envp: u64) -> KResult<u64> {
    let path = user_cstr(path)?;
    let argv = user_str_array(argv)?;
    let envp = user_str_array(envp)?;
    crate::loader::sys_exec(&path, argv, envp)?;
    unreachable!("exec returned without error");
}

fn sys_wait4(pid: u64, status_ptr: u64, options: u64) -> KResult<u64> {
    let options = WaitOptions::from_bits_truncate(options as u32);
    let (dead, status) = scheduler::sys_wait4(pid as i64 as i32, options)?;
    if status_ptr != 0 {
        put_user_value(status_ptr, status)?;
    }
    Ok(dead as u64)
}

fn sys_setpgid(pid: u64, pgid: u64) -> KResult<u64> {
    let task = current()?;
    let target = if pid == 0 {
        task.clone()
    } else {
        scheduler::task_by_pid(pid as i32).ok_or(Errno::ESRCH)?
    };
    let pgid = if pgid == 0 {
        target.pid
    } else {
        pgid as i32
    };
    if pgid < 0 {
        return Err(Errno::EINVAL);
    }
    // Only self or a child still in our session.
    if target.pid != task.pid {
        let tids = target.ids.lock();
        if tids.parent != task.pid || tids.sid != task.ids.lock().sid {
            return Err(Errno::EPERM);
        }
    }
    target.ids.lock().pgid = pgid;
    Ok(0)
}

fn sys_getpgid(pid: u64) -> KResult<u64> {
    let task = if pid == 0 {
        current()?
    } else {
        scheduler::task_by_pid(pid as i32).ok_or(Errno::ESRCH)?
    };
    let pgid = task.ids.lock().pgid;
    Ok(pgid as u64)
}

fn sys_setsid() -> KResult<u64> {
    let task = current()?;
    let mut ids = task.ids.lock();
    if ids.pgid == task.pid {
        // Already a group leader: refused by POSIX.
        return Err(Errno::EPERM);
    }
    ids.sid = task.pid;
    ids.pgid = task.pid;
    ids.ctty = None;
    Ok(task.pid as u64)
}

fn sys_kill(pid: u64, sig: u64) -> KResult<u64> {
    let task = current()?;
    signals::sys_kill(&task, pid as i64 as i32, sig as i32)?;
    Ok(0)
}

fn sys_tkill(tid: u64, sig: u64) -> KResult<u64> {
    let task = current()?;
    let target = scheduler::task_by_pid(tid as i32).ok_or(Errno::ESRCH)?;
    if !signals::can_signal(&task.creds.lock(), &target.creds.lock()) {
        return Err(Errno::EPERM);
    }
    if sig != 0 {
        signals::send_signal(
            &target,
            sig as i32,
            Some(signals::SigInfo::simple(sig as i32, task.pid, task.creds.lock().uid)),
        );
    }
    Ok(0)
}

/// Userland's sigaction struct.
#[repr(C)]
#[derive(Clone, Copy)]
struct UserSigaction {
    handler: u64,
    flags: u32,
    restorer: u64,
    mask: u32,
}

const SIG_DFL: u64 = 0;
const SIG_IGN: u64 = 1;

fn sys_sigaction(sig: u64, new_ptr: u64, old_ptr: u64) -> KResult<u64> {
    let sig = sig as i32;
    if sig < 1 || sig as usize > signals::NSIG || sig == signals::SIGKILL || sig == signals::SIGSTOP
    {
        return Err(Errno::EINVAL);
    }
    let task = current()?;

    if old_ptr != 0 {
        let action = task.actions.lock().get(sig);
        let user = UserSigaction {
            handler: match action.handler {
                signals::SigHandler::Default => SIG_DFL,
                signals::SigHandler::Ignore => SIG_IGN,
                signals::SigHandler::Handler(h) => h,
            },
            flags: action.flags.bits(),
            restorer: action.restorer,
            mask: action.mask,
        };
        put_user_value(old_ptr, user)?;
    }

    if new_ptr != 0 {
        let user: UserSigaction = user_value(new_ptr)?;
        let handler = match user.handler {
            SIG_DFL => signals::SigHandler::Default,
            SIG_IGN => signals::SigHandler::Ignore,
            h => signals::SigHandler::Handler(h),
        };
        task.actions.lock().set(
            sig,
            signals::SigAction {
                handler,
                mask: user.mask,
                flags: signals::SaFlags::from_bits_truncate(user.flags),
                restorer: user.restorer,
            },
        );
    }
    Ok(0)
}

fn sys_sigprocmask(how: u64, set_ptr: u64, old_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let set = if set_ptr != 0 {
        Some(user_value::<u32>(set_ptr)?)
    } else {
        None
    };
    let old = signals::sys_sigprocmask(&task, how as i32, set)?;
    if old_ptr != 0 {
        put_user_value(old_ptr, old)?;
    }
    Ok(0)
}

fn sys_sigsuspend(mask_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let mask: u32 = user_value(mask_ptr)?;
    {
        let mut state = task.signals.lock();
        state.suspended_mask = Some(state.blocked);
        state.blocked = mask & !(signals::sig_bit(signals::SIGKILL) | signals::sig_bit(signals::SIGSTOP));
    }
    // Sleep until any deliverable signal arrives.
    loop {
        if task.signals.lock().next_ready().is_some() {
            break;
        }
        scheduler::block_task(scheduler::channel_of(&*task), true);
    }
    // The old mask comes back after delivery; sigsuspend always fails
    // with EINTR.
    if let Some(old) = task.signals.lock().suspended_mask.take() {
        task.signals.lock().blocked = old;
    }
    Err(Errno::EINTR)
}

// ─── timers ──────────────────────────────────────────────────────────

/// `struct itimerval` flattened to microseconds-free tick counts: the
/// userland wrapper converts.
#[repr(C)]
#[derive(Clone, Copy)]
struct UserITimer {
    interval_ticks: u64,
    value_ticks: u64,
}

fn itimer_kind(which: u64) -> KResult<ITimerKind> {
    match which {
        0 => Ok(ITimerKind::Real),
        1 => Ok(ITimerKind::Virtual),
        2 => Ok(ITimerKind::Prof),
        _ => Err(Errno::EINVAL),
    }
}

fn sys_getitimer(which: u64, out_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let t = task.timers.lock().get_itimer(itimer_kind(which)?);
    put_user_value(
        out_ptr,
        UserITimer {
            interval_ticks: t.interval,
            value_ticks: t.value,
        },
    )?;
    Ok(0)
}

fn sys_setitimer(which: u64, new_ptr: u64, old_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let new: UserITimer = user_value(new_ptr)?;
    let old = task.timers.lock().set_itimer(
        itimer_kind(which)?,
        ITimer {
            value: new.value_ticks,
            interval: new.interval_ticks,
        },
    );
    if old_ptr != 0 {
        put_user_value(
            old_ptr,
            UserITimer {
                interval_ticks: old.interval,
                value_ticks: old.value,
            },
        )?;
    }
    Ok(0)
}

fn sys_alarm(seconds: u64) -> KResult<u64> {
    let task = current()?;
    let old = task.timers.lock().set_itimer(
        ITimerKind::Real,
        ITimer {
            value: seconds * HZ,
            interval: 0,
        },
    );
    Ok((old.value + HZ - 1) / HZ)
}

fn sys_timer_create(signo: u64) -> KResult<u64> {
    let task = current()?;
    let signo = if signo == 0 {
        signals::SIGALRM
    } else {
        signo as i32
    };
    if signo < 1 || signo as usize > signals::NSIG {
        return Err(Errno::EINVAL);
    }
    let id = task.timers.lock().timer_create(signo);
    Ok(id as u64)
}

fn sys_timer_settime(id: u64, value_ticks: u64, interval_ticks: u64) -> KResult<u64> {
    let task = current()?;
    let mut timers = task.timers.lock();
    let timer = timers.timer_find(id as i32)?;
    timer.value = value_ticks;
    timer.interval = interval_ticks;
    Ok(0)
}

fn sys_timer_gettime(id: u64, out_ptr: u64) -> KResult<u64> {
    let task = current()?;
    let mut timers = task.timers.lock();
    let timer = timers.timer_find(id as i32)?;
    put_user_value(
        out_ptr,
        UserITimer {
            interval_ticks: timer.interval,
            value_ticks: timer.value,
        },
    )?;
    Ok(0)
}

fn sys_timer_getoverrun(id: u64) -> KResult<u64> {
    let task = current()?;
    let result = task.timers.lock().timer_overrun(id as i32);
    result.map(|n| n as u64)
}

fn sys_timer_delete(id: u64) -> KResult<u64> {
    let task = current()?;
    task.timers.lock().timer_delete(id as i32)?;
    Ok(0)
}

// ─── SysV IPC ────────────────────────────────────────────────────────

fn sys_msgget(key: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    crate::ipc::msg::msgget(key as i32, flags as i32, &creds).map(|id| id as u64)
}

fn sys_msgsnd(id: u64, msgp: u64, msgsz: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    // struct msgbuf: { long mtype; char mtext[] }
    let mtype: i64 = user_value(msgp)?;
    let data = user_slice(msgp + 8, msgsz as usize)?;
    crate::ipc::msg::msgsnd(id as i32, mtype, data, flags as i32, task.pid, &creds)?;
    Ok(0)
}

fn sys_msgrcv(id: u64, msgp: u64, msgsz: u64, msgtyp: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    let msg = crate::ipc::msg::msgrcv(
        id as i32,
        msgtyp as i64,
        msgsz as usize,
        flags as i32,
        task.pid,
        &creds,
    )?;
    // The queue lock is long gone; faulting here while copying out is
    // harmless.
    put_user_value(msgp, msg.mtype)?;
    let out = user_slice_mut(msgp + 8, msg.data.len())?;
    out.copy_from_slice(&msg.data);
    Ok(msg.data.len() as u64)
}

fn sys_msgctl(id: u64, cmd: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    crate::ipc::msg::msgctl(id as i32, cmd as i32, &creds)?;
    Ok(0)
}

fn sys_semget(key: u64, nsems: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    crate::ipc::sem::semget(key as i32, nsems as usize, flags as i32, &creds).map(|id| id as u64)
}

fn sys_semop(id: u64, ops_ptr: u64, nops: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    if nops == 0 || nops as usize > crate::ipc::sem::SEMOPM {
        return Err(Errno::EINVAL);
    }
    let mut ops = Vec::with_capacity(nops as usize);
    for i in 0..nops {
        // struct sembuf { u16 num; i16 op; i16 flg }
        let raw: [i16; 3] = user_value(ops_ptr + i * 6)?;
        ops.push(crate::ipc::sem::SemOp {
            num: raw[0] as u16,
            op: raw[1],
            flags: raw[2],
        });
    }
    crate::ipc::sem::semop(id as i32, &ops, task.pid, &creds)?;
    Ok(0)
}

fn sys_semctl(id: u64, num: u64, cmd: u64, arg: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    crate::ipc::sem::semctl(id as i32, num as u16, cmd as i32, arg as i32, &creds)
        .map(|v| v as u64)
}

fn sys_shmget(key: u64, size: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    crate::ipc::shm::shmget(key as i32, size as usize, flags as i32, &creds, &mut *pmm)
        .map(|id| id as u64)
}

fn sys_shmat(id: u64, addr: u64, flags: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::EINVAL)?;
    let mut mem = user_space.mem.lock();
    let mut space = user_space.space.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    crate::ipc::shm::shmat(
        id as i32,
        addr,
        flags as i32,
        task.pid,
        &creds,
        &mut mem,
        &mut space,
        &mut *pmm,
    )
}

fn sys_shmdt(addr: u64) -> KResult<u64> {
    let task = current()?;
    let user = task.user.lock();
    let user_space = user.as_ref().ok_or(Errno::EINVAL)?;
    let mut mem = user_space.mem.lock();
    let mut space = user_space.space.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    crate::ipc::shm::shmdt(addr, task.pid, &mut mem, &mut space, &mut *pmm)?;
    Ok(0)
}

fn sys_shmctl(id: u64, cmd: u64) -> KResult<u64> {
    let task = current()?;
    let creds = *task.creds.lock();
    let mut pmm = crate::memory::FRAME_ALLOCATOR.lock();
    crate::ipc::shm::shmctl(id as i32, cmd as i32, &creds, &mut *pmm)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_range_checks() {
        assert!(check_user_range(0x1000, 16).is_ok());
        assert_eq!(check_user_range(0, 16).unwrap_err(), Errno::EFAULT);
        // Kernel-half addresses are rejected.
        assert_eq!(
            check_user_range(crate::memory::paging::KERNEL_BASE, 8).unwrap_err(),
            Errno::EFAULT
        );
        // Wrapping ranges are rejected.
        assert_eq!(
            check_user_range(u64::MAX - 4, 16).unwrap_err(),
            Errno::EFAULT
        );
    }

    #[test]
    fn errno_boundary_encoding() {
        assert_eq!(ok_or_ret(Ok(7)), 7);
        assert_eq!(ok_or_ret(Err(Errno::EBADF)) as i64, -9);
    }
}
