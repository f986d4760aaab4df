//! The tty subsystem: virtual terminals with a line discipline on the
//! input side and the CSI console writer on the output side.

pub mod console;
pub mod discipline;
pub mod keymap;
pub mod queue;
pub mod termios;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, BlockOutcome, Pid, Task};
use crate::signals::{self, SigInfo};

use console::Console;
use discipline::InputSignal;
use queue::TtyQueue;
use termios::Termios;

/// Major number of the tty devices in `/dev`.
pub const TTY_MAJOR: u32 = 4;
pub const NR_TTYS: usize = 4;

// termios/job-control ioctl numbers.
pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TCSETSW: u32 = 0x5403;
pub const TCSETSF: u32 = 0x5404;
pub const TIOCSCTTY: u32 = 0x540E;
pub const TIOCGPGRP: u32 = 0x540F;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;
pub const TIOCSWINSZ: u32 = 0x5414;
pub const TIOCNOTTY: u32 = 0x5422;
pub const VT_SWITCH_TTY: u32 = 0x5601;
pub const VT_GRAPHICS_MODE: u32 = 0x5602;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

pub struct Tty {
    pub minor: usize,
    pub termios: Termios,
    pub read_q: TtyQueue,
    pub secondary: TtyQueue,
    pub write_q: TtyQueue,
    /// Complete lines in `secondary` (canonical mode bookkeeping).
    pub delims: usize,
    pub pgrp: Pid,
    pub session: Pid,
    pub winsize: WinSize,
    pub console: Console,
    /// VT_GRAPHICS_MODE parks the text renderer.
    pub graphics_mode: bool,
}

impl Tty {
    fn new(minor: usize) -> Tty {
        Tty {
            minor,
            termios: Termios::sane(),
            read_q: TtyQueue::new(),
            secondary: TtyQueue::new(),
            write_q: TtyQueue::new(),
            delims: 0,
            pgrp: 0,
            session: 0,
            winsize: WinSize {
                rows: console::DEFAULT_ROWS as u16,
                cols: console::DEFAULT_COLS as u16,
            },
            console: Console::new(console::DEFAULT_ROWS, console::DEFAULT_COLS),
            graphics_mode: false,
        }
    }

    pub fn input_ready(&self) -> bool {
        if self.termios.canonical() {
            self.delims > 0
        } else {
            !self.secondary.is_empty()
        }
    }
}

lazy_static! {
    pub static ref TTYS: Vec<Mutex<Tty>> = (0..NR_TTYS).map(|m| Mutex::new(Tty::new(m))).collect();
}

/// The one tty owning the screen and keyboard.
static ACTIVE_TTY: AtomicUsize = AtomicUsize::new(0);

pub fn active_tty() -> usize {
    ACTIVE_TTY.load(Ordering::Acquire)
}

fn read_channel(minor: usize) -> usize {
    0x5454_5900_0000_0000usize | (minor << 1)
}

fn write_channel(minor: usize) -> usize {
    read_channel(minor) | 1
}

fn tty_of(minor: usize) -> KResult<&'static Mutex<Tty>> {
    TTYS.get(minor).ok_or(Errno::ENXIO)
}

pub fn init() {
    TTYS[0].lock().console.mirror_vga = true;
    crate::log_info!("tty: {} virtual terminals, tty0 active", NR_TTYS);
}

/// Keyboard bytes arrive here (already keymap-translated). Runs the
/// discipline, fires job-control signals and wakes readers.
pub fn handle_input(minor: usize, bytes: &[u8]) {
    let tty = match tty_of(minor) {
        Ok(t) => t,
        Err(_) => return,
    };

    let (outcome, pgrp, echo) = {
        let mut tty = tty.lock();
        for &b in bytes {
            tty.read_q.put(b);
        }
        let Tty {
            ref termios,
            ref mut read_q,
            ref mut secondary,
            ref mut write_q,
            ref mut delims,
            ..
        } = *tty;
        let outcome = discipline::copy_to_buf(termios, read_q, secondary, write_q, delims);
        let mut echo = Vec::new();
        while let Some(b) = tty.write_q.get() {
            echo.push(b);
        }
        (outcome, tty.pgrp, echo)
    };

    if !echo.is_empty() {
        let _ = tty_write(minor, &echo);
    }

    for sig in &outcome.signals {
        let signo = match sig {
            InputSignal::Interrupt => signals::SIGINT,
            InputSignal::Quit => signals::SIGQUIT,
            InputSignal::Suspend => signals::SIGTSTP,
        };
        if pgrp > 0 {
            for task in scheduler::tasks_in_pgrp(pgrp) {
                signals::send_signal(&task, signo, Some(SigInfo::simple(signo, 0, 0)));
            }
        }
    }

    if outcome.new_lines > 0 || outcome.new_bytes > 0 {
        scheduler::wake_all(read_channel(minor));
    }
}

/// Raw scancode entry point from the keyboard IRQ.
pub fn handle_scancode(scancode: u8) {
    lazy_static! {
        static ref KEYMAP: Mutex<keymap::Keymap> = Mutex::new(keymap::Keymap::new());
    }
    let seq = KEYMAP.lock().translate(scancode);
    if seq.len > 0 {
        handle_input(active_tty(), seq.as_slice());
    }
}

/// Blocking cooked/raw read from `secondary`.
pub fn tty_read(minor: usize, buf: &mut [u8], nonblock: bool) -> KResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        {
            let mut tty = tty_of(minor)?.lock();
            if tty.input_ready() {
                let Tty {
                    ref termios,
                    ref mut secondary,
                    ref mut delims,
                    ..
                } = *tty;
                let n = discipline::cooked_read(termios, secondary, delims, buf);
                return Ok(n);
            }
        }
        if nonblock {
            return Err(Errno::EAGAIN);
        }
        if scheduler::block_task(read_channel(minor), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

/// Console output: OPOST/ONLCR translation, then the CSI writer, plus a
/// serial mirror for the active terminal.
pub fn tty_write(minor: usize, buf: &[u8]) -> KResult<usize> {
    let mut tty = tty_of(minor)?.lock();
    let onlcr = tty.termios.oflag.contains(termios::OutputFlags::OPOST)
        && tty.termios.oflag.contains(termios::OutputFlags::ONLCR);

    if !tty.graphics_mode {
        for &b in buf {
            if b == b'\n' && onlcr {
                tty.console.put_byte(b'\r');
            }
            tty.console.put_byte(b);
        }
    }
    drop(tty);

    if minor == active_tty() {
        crate::serial::_print(format_args!(
            "{}",
            alloc::string::String::from_utf8_lossy(buf)
        ));
    }
    scheduler::wake_all(write_channel(minor));
    Ok(buf.len())
}

/// select/poll hooks.
pub fn tty_can_read(minor: usize) -> bool {
    tty_of(minor).map(|t| t.lock().input_ready()).unwrap_or(false)
}

pub fn tty_can_write(minor: usize) -> bool {
    tty_of(minor)
        .map(|t| t.lock().write_q.has_room())
        .unwrap_or(false)
}

/// Switch the keyboard+screen to `minor`, repainting its buffer.
pub fn switch_tty(minor: usize) -> KResult<()> {
    if minor >= NR_TTYS {
        return Err(Errno::EINVAL);
    }
    let old = ACTIVE_TTY.swap(minor, Ordering::AcqRel);
    if old != minor {
        tty_of(old)?.lock().console.mirror_vga = false;
        let mut tty = tty_of(minor)?.lock();
        tty.console.mirror_vga = true;
        tty.console.repaint();
    }
    Ok(())
}

/// The tty ioctl surface. Pointer-typed arguments have already been
/// copied in/out by the syscall layer; this works on values.
pub enum TtyIoctl {
    GetTermios,
    SetTermios { termios: Termios, flush: bool },
    GetPgrp,
    SetPgrp { pgrp: Pid },
    GetWinSize,
    SetWinSize { size: WinSize },
    SetCtty { force: bool },
    DropCtty,
    SwitchTty { target: usize },
    GraphicsMode { on: bool },
}

#[derive(Debug)]
pub enum TtyIoctlReply {
    None,
    Termios(Termios),
    Pgrp(Pid),
    WinSize(WinSize),
}

pub fn tty_ioctl(minor: usize, task: &Arc<Task>, req: TtyIoctl) -> KResult<TtyIoctlReply> {
    match req {
        TtyIoctl::GetTermios => Ok(TtyIoctlReply::Termios(tty_of(minor)?.lock().termios)),
        TtyIoctl::SetTermios { termios, flush } => {
            let mut tty = tty_of(minor)?.lock();
            tty.termios = termios;
            if flush {
                tty.read_q.clear();
                tty.secondary.clear();
                tty.delims = 0;
            }
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::GetPgrp => Ok(TtyIoctlReply::Pgrp(tty_of(minor)?.lock().pgrp)),
        TtyIoctl::SetPgrp { pgrp } => {
            if pgrp <= 0 {
                return Err(Errno::EINVAL);
            }
            let mut tty = tty_of(minor)?.lock();
            // Only a task inside the owning session may steer the
            // foreground group.
            let caller_sid = task.ids.lock().sid;
            if tty.session != 0 && tty.session != caller_sid {
                return Err(Errno::EPERM);
            }
            tty.pgrp = pgrp;
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::GetWinSize => Ok(TtyIoctlReply::WinSize(tty_of(minor)?.lock().winsize)),
        TtyIoctl::SetWinSize { size } => {
            if size.rows == 0 || size.cols == 0 {
                return Err(Errno::EINVAL);
            }
            let notify = {
                let mut tty = tty_of(minor)?.lock();
                let changed = tty.winsize != size;
                tty.winsize = size;
                if changed && tty.pgrp > 0 {
                    Some(tty.pgrp)
                } else {
                    None
                }
            };
            if let Some(pgrp) = notify {
                for t in scheduler::tasks_in_pgrp(pgrp) {
                    signals::send_signal(&t, signals::SIGWINCH, None);
                }
            }
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::SetCtty { force } => {
            let mut tty = tty_of(minor)?.lock();
            let (sid, has_ctty, is_root) = {
                let ids = task.ids.lock();
                (ids.sid, ids.ctty.is_some(), task.creds.lock().is_superuser())
            };
            // Caller must be a session leader without a controlling
            // tty; root may steal with force.
            if sid != task.pid || has_ctty {
                if !(force && is_root) {
                    return Err(Errno::EPERM);
                }
            }
            if tty.session != 0 && tty.session != sid && !(force && is_root) {
                return Err(Errno::EPERM);
            }
            tty.session = sid;
            tty.pgrp = task.ids.lock().pgid;
            task.ids.lock().ctty = Some(minor);
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::DropCtty => {
            let mut ids = task.ids.lock();
            if ids.ctty == Some(minor) {
                ids.ctty = None;
            }
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::SwitchTty { target } => {
            switch_tty(target)?;
            Ok(TtyIoctlReply::None)
        }
        TtyIoctl::GraphicsMode { on } => {
            tty_of(minor)?.lock().graphics_mode = on;
            Ok(TtyIoctlReply::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Use distinct minors per test: the tty table is global.

    #[test]
    fn input_to_read_roundtrip() {
        handle_input(1, b"hi there\n");
        let mut buf = [0u8; 32];
        let n = tty_read(1, &mut buf, true).unwrap();
        assert_eq!(&buf[..n], b"hi there\n");
        // Queue drained: next nonblocking read would block.
        assert_eq!(tty_read(1, &mut buf, true).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn erase_applies_before_read() {
        handle_input(2, b"abc\x7Fd\n");
        let mut buf = [0u8; 8];
        let n = tty_read(2, &mut buf, true).unwrap();
        assert_eq!(&buf[..n], b"abd\n");
    }

    #[test]
    fn raw_mode_returns_partial_input() {
        let task = crate::scheduler::new_task("ttytest", false, 4);
        let mut t = Termios::sane();
        t.lflag -= termios::LocalFlags::ICANON;
        t.lflag -= termios::LocalFlags::ECHO;
        tty_ioctl(3, &task, TtyIoctl::SetTermios { termios: t, flush: true }).unwrap();

        handle_input(3, b"xy");
        let mut buf = [0u8; 8];
        let n = tty_read(3, &mut buf, true).unwrap();
        assert_eq!(&buf[..n], b"xy");

        // Restore cooked mode for other tests.
        tty_ioctl(
            3,
            &task,
            TtyIoctl::SetTermios {
                termios: Termios::sane(),
                flush: true,
            },
        )
        .unwrap();
    }

    #[test]
    fn zero_winsize_is_rejected() {
        let task = crate::scheduler::new_task("wsz", false, 4);
        assert_eq!(
            tty_ioctl(
                1,
                &task,
                TtyIoctl::SetWinSize {
                    size: WinSize { rows: 0, cols: 0 }
                }
            )
            .unwrap_err(),
            Errno::EINVAL
        );
        assert!(tty_ioctl(
            1,
            &task,
            TtyIoctl::SetWinSize {
                size: WinSize { rows: 50, cols: 132 }
            }
        )
        .is_ok());
        match tty_ioctl(1, &task, TtyIoctl::GetWinSize).unwrap() {
            TtyIoctlReply::WinSize(ws) => assert_eq!(ws, WinSize { rows: 50, cols: 132 }),
            _ => panic!("wrong reply"),
        }
    }

    #[test]
    fn ctty_requires_session_leader() {
        let leader = crate::scheduler::new_task("leader", false, 4);
        // A fresh task is its own session leader with no ctty.
        assert!(tty_ioctl(2, &leader, TtyIoctl::SetCtty { force: false }).is_ok());
        assert_eq!(leader.ids.lock().ctty, Some(2));

        let follower = crate::scheduler::new_task("follower", false, 4);
        follower.ids.lock().sid = leader.pid; // not a leader anymore
        assert_eq!(
            tty_ioctl(2, &follower, TtyIoctl::SetCtty { force: false }).unwrap_err(),
            Errno::EPERM
        );
    }
}
