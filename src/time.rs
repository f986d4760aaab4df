//! Kernel time: the tick counter, timed sleeps, interval timers and
//! POSIX timers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, Pid, Task};
use crate::signals::{self, SigInfo};

/// PIT / LAPIC-timer frequency the tick counter runs at.
pub const HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn seconds() -> u64 {
    ticks() / HZ
}

lazy_static! {
    /// `block_task2` sleepers: pid -> (channel, deadline tick).
    static ref SLEEPERS: Mutex<BTreeMap<Pid, (usize, u64)>> = Mutex::new(BTreeMap::new());
}

pub fn register_sleeper(pid: Pid, chan: usize, deadline: u64) {
    SLEEPERS.lock().insert(pid, (chan, deadline));
}

pub fn cancel_sleeper(pid: Pid) {
    SLEEPERS.lock().remove(&pid);
}

pub fn drop_task_timers(pid: Pid) {
    cancel_sleeper(pid);
}

/// Which interval timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ITimerKind {
    Real,
    Virtual,
    Prof,
}

/// One interval timer, in ticks. `value == 0` means disarmed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ITimer {
    pub value: u64,
    pub interval: u64,
}

/// A POSIX per-task timer (`timer_create` family).
#[derive(Debug, Clone)]
pub struct PosixTimer {
    pub id: i32,
    pub signo: i32,
    pub value: u64,
    pub interval: u64,
    /// Expirations that landed while the signal was still pending.
    /// Reported and reset by `timer_getoverrun`.
    pub overrun: u32,
}

pub struct TaskTimers {
    pub real: ITimer,
    pub virt: ITimer,
    pub prof: ITimer,
    pub posix: Vec<PosixTimer>,
    next_id: i32,
}

impl TaskTimers {
    pub fn new() -> Self {
        TaskTimers {
            real: ITimer::default(),
            virt: ITimer::default(),
            prof: ITimer::default(),
            posix: Vec::new(),
            next_id: 1,
        }
    }

    fn itimer_mut(&mut self, kind: ITimerKind) -> &mut ITimer {
        match kind {
            ITimerKind::Real => &mut self.real,
            ITimerKind::Virtual => &mut self.virt,
            ITimerKind::Prof => &mut self.prof,
        }
    }

    /// `setitimer`: install `new`, return the previous setting.
    pub fn set_itimer(&mut self, kind: ITimerKind, new: ITimer) -> ITimer {
        core::mem::replace(self.itimer_mut(kind), new)
    }

    pub fn get_itimer(&self, kind: ITimerKind) -> ITimer {
        match kind {
            ITimerKind::Real => self.real,
            ITimerKind::Virtual => self.virt,
            ITimerKind::Prof => self.prof,
        }
    }

    /// Count one tick off an armed timer. Returns true when it fired
    /// (and reloads the interval).
    fn tick_itimer(&mut self, kind: ITimerKind) -> bool {
        let t = self.itimer_mut(kind);
        if t.value == 0 {
            return false;
        }
        t.value -= 1;
        if t.value == 0 {
            t.value = t.interval;
            return true;
        }
        false
    }

    pub fn timer_create(&mut self, signo: i32) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.posix.push(PosixTimer {
            id,
            signo,
            value: 0,
            interval: 0,
            overrun: 0,
        });
        id
    }

    pub fn timer_find(&mut self, id: i32) -> KResult<&mut PosixTimer> {
        self.posix
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(Errno::EINVAL)
    }

    pub fn timer_delete(&mut self, id: i32) -> KResult<()> {
        let before = self.posix.len();
        self.posix.retain(|t| t.id != id);
        if self.posix.len() == before {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    /// `timer_getoverrun`: report and reset.
    pub fn timer_overrun(&mut self, id: i32) -> KResult<u32> {
        let t = self.timer_find(id)?;
        let n = t.overrun;
        t.overrun = 0;
        Ok(n)
    }
}

/// Signal the itimer expiry appropriate to `kind`.
fn itimer_signal(kind: ITimerKind) -> i32 {
    match kind {
        ITimerKind::Real => signals::SIGALRM,
        ITimerKind::Virtual => signals::SIGVTALRM,
        ITimerKind::Prof => signals::SIGPROF,
    }
}

/// The timer interrupt body: advance the clock, wake expired sleepers,
/// account interval and POSIX timers, then let the scheduler slice.
pub fn timer_tick() {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;

    // Timed sleeps.
    let expired: Vec<Pid> = SLEEPERS
        .lock()
        .iter()
        .filter(|(_, (_, deadline))| *deadline <= now)
        .map(|(pid, _)| *pid)
        .collect();
    for pid in expired {
        SLEEPERS.lock().remove(&pid);
        scheduler::wake_for_timeout(pid);
    }

    // Interval and POSIX timers, per task.
    let tasks: Vec<Arc<Task>> = scheduler::TASK_TABLE.lock().values().cloned().collect();
    for task in tasks {
        let running = task.state() == scheduler::TaskState::Running;
        let mut fired: Vec<i32> = Vec::new();
        let mut posix_fired: Vec<(i32, i32)> = Vec::new();
        {
            let mut timers = task.timers.lock();
            if timers.tick_itimer(ITimerKind::Real) {
                fired.push(itimer_signal(ITimerKind::Real));
            }
            if running {
                if timers.tick_itimer(ITimerKind::Virtual) {
                    fired.push(itimer_signal(ITimerKind::Virtual));
                }
                if timers.tick_itimer(ITimerKind::Prof) {
                    fired.push(itimer_signal(ITimerKind::Prof));
                }
            }
            for timer in timers.posix.iter_mut() {
                if timer.value == 0 {
                    continue;
                }
                timer.value -= 1;
                if timer.value == 0 {
                    timer.value = timer.interval;
                    posix_fired.push((timer.id, timer.signo));
                }
            }
        }
        for signo in fired {
            signals::send_signal(&task, signo, Some(SigInfo::simple(signo, 0, 0)));
        }
        for (id, signo) in posix_fired {
            // An expiry that finds its signal still pending is an
            // overrun, not a second queue entry.
            let already_pending =
                task.signals.lock().pending & signals::sig_bit(signo) != 0;
            if already_pending {
                let mut timers = task.timers.lock();
                if let Ok(timer) = timers.timer_find(id) {
                    timer.overrun = timer.overrun.saturating_add(1);
                }
            } else {
                signals::send_signal(&task, signo, Some(SigInfo::simple(signo, 0, 0)));
            }
        }
    }

    scheduler::preempt_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setitimer_getitimer_roundtrip() {
        let mut timers = TaskTimers::new();
        let set = ITimer {
            value: 300,
            interval: 100,
        };
        timers.set_itimer(ITimerKind::Real, set);
        let got = timers.get_itimer(ITimerKind::Real);
        assert_eq!(got.value, 300);
        assert_eq!(got.interval, 100);

        // Replacing returns the old value.
        let old = timers.set_itimer(ITimerKind::Real, ITimer::default());
        assert_eq!(old.value, 300);
    }

    #[test]
    fn itimer_fires_and_reloads() {
        let mut timers = TaskTimers::new();
        timers.set_itimer(
            ITimerKind::Real,
            ITimer {
                value: 2,
                interval: 5,
            },
        );
        assert!(!timers.tick_itimer(ITimerKind::Real));
        assert!(timers.tick_itimer(ITimerKind::Real));
        assert_eq!(timers.get_itimer(ITimerKind::Real).value, 5);
    }

    #[test]
    fn oneshot_itimer_disarms() {
        let mut timers = TaskTimers::new();
        timers.set_itimer(
            ITimerKind::Real,
            ITimer {
                value: 1,
                interval: 0,
            },
        );
        assert!(timers.tick_itimer(ITimerKind::Real));
        assert!(!timers.tick_itimer(ITimerKind::Real));
    }

    #[test]
    fn posix_timer_lifecycle_and_overrun_reset() {
        let mut timers = TaskTimers::new();
        let id = timers.timer_create(signals::SIGALRM);
        {
            let t = timers.timer_find(id).unwrap();
            t.value = 10;
            t.interval = 10;
            t.overrun = 3;
        }
        assert_eq!(timers.timer_overrun(id).unwrap(), 3);
        // Overrun resets after the query.
        assert_eq!(timers.timer_overrun(id).unwrap(), 0);

        timers.timer_delete(id).unwrap();
        assert_eq!(timers.timer_delete(id), Err(Errno::EINVAL));
    }
}
