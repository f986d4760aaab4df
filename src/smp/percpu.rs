//! Per-CPU state.
//!
//! A fixed array of `ProcessorLocal` slots indexed by CPU id. Each CPU
//! points its GS base at its own slot once during bringup; `this_cpu`
//! resolves through that register so no lock is needed.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub const MAX_CPUS: usize = 16;

/// `ProcessorLocal.flags` bits.
pub const FLAG_ONLINE: u32 = 1 << 0;
pub const FLAG_SCHEDULER_BUSY: u32 = 1 << 1;

#[repr(C)]
pub struct ProcessorLocal {
    pub cpuid: u32,
    pub lapic_id: AtomicU32,
    pub flags: AtomicU32,
    /// Pid of the task this CPU is running (-1 while idle in bringup).
    pub current_pid: AtomicI32,
    pub idle_pid: AtomicI32,
    /// CR3 of the address space the CPU currently runs on; shootdowns
    /// skip CPUs on a different user directory.
    pub active_pd: AtomicU64,
}

impl ProcessorLocal {
    const fn new(cpuid: u32) -> Self {
        ProcessorLocal {
            cpuid,
            lapic_id: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            current_pid: AtomicI32::new(-1),
            idle_pid: AtomicI32::new(-1),
            active_pd: AtomicU64::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_ONLINE != 0
    }

    pub fn set_flag(&self, flag: u32) -> u32 {
        self.flags.fetch_or(flag, Ordering::AcqRel)
    }

    pub fn clear_flag(&self, flag: u32) -> u32 {
        self.flags.fetch_and(!flag, Ordering::AcqRel)
    }
}

macro_rules! cpu_slots {
    ($($n:expr),*) => {
        [$(ProcessorLocal::new($n)),*]
    };
}

pub static CPUS: [ProcessorLocal; MAX_CPUS] =
    cpu_slots!(0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15);

/// Bit per online CPU; bit 0 (the BSP) is set during early boot.
pub static ONLINE_BITMAP: AtomicU32 = AtomicU32::new(0);
pub static ONLINE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Point GS at this CPU's slot. Called once per CPU during bringup.
#[cfg(not(test))]
pub fn install(cpu: usize) {
    use x86_64::registers::model_specific::GsBase;
    use x86_64::VirtAddr;
    GsBase::write(VirtAddr::new(&CPUS[cpu] as *const _ as u64));
    CPUS[cpu].set_flag(FLAG_ONLINE);
    ONLINE_BITMAP.fetch_or(1 << cpu, Ordering::AcqRel);
    ONLINE_COUNT.fetch_add(1, Ordering::AcqRel);
}

#[cfg(not(test))]
pub fn this_cpu_id() -> usize {
    use x86_64::registers::model_specific::GsBase;
    let base = GsBase::read().as_u64();
    let first = &CPUS[0] as *const _ as u64;
    if base < first {
        // GS not installed yet; early boot runs on the BSP.
        return 0;
    }
    ((base - first) / core::mem::size_of::<ProcessorLocal>() as u64) as usize
}

#[cfg(test)]
pub fn this_cpu_id() -> usize {
    0
}

pub fn this_cpu() -> &'static ProcessorLocal {
    &CPUS[this_cpu_id()]
}

pub fn online_bitmap() -> u32 {
    ONLINE_BITMAP.load(Ordering::Acquire)
}

pub fn online_count() -> usize {
    ONLINE_COUNT.load(Ordering::Acquire)
}

/// CPU-exclusive lock: the holder is a CPU id, acquisition is a CAS,
/// release writes -1. Reentry by the holding CPU is detected and
/// reported to the caller instead of deadlocking.
pub struct CpuLock {
    holder: AtomicI32,
}

/// What `CpuLock::acquire` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLockEntry {
    /// Took the lock; release it when done.
    Owner,
    /// This CPU already held it (scheduler critical section); do not
    /// release on the way out.
    Reentered,
}

impl CpuLock {
    pub const fn new() -> Self {
        CpuLock {
            holder: AtomicI32::new(-1),
        }
    }

    pub fn acquire(&self, cpu: i32) -> CpuLockEntry {
        loop {
            if self
                .holder
                .compare_exchange(-1, cpu, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return CpuLockEntry::Owner;
            }
            if self.holder.load(Ordering::Relaxed) == cpu {
                return CpuLockEntry::Reentered;
            }
            core::hint::spin_loop();
        }
    }

    pub fn release(&self, cpu: i32) {
        let _ = self
            .holder
            .compare_exchange(cpu, -1, Ordering::Release, Ordering::Relaxed);
    }

    pub fn holder(&self) -> i32 {
        self.holder.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_lock_reentry_is_detected() {
        let lock = CpuLock::new();
        assert_eq!(lock.acquire(2), CpuLockEntry::Owner);
        assert_eq!(lock.acquire(2), CpuLockEntry::Reentered);
        // A reentrant exit must not release the outer hold.
        lock.release(3);
        assert_eq!(lock.holder(), 2);
        lock.release(2);
        assert_eq!(lock.holder(), -1);
    }

    #[test]
    fn slots_carry_their_ids() {
        assert_eq!(CPUS[3].cpuid, 3);
        assert_eq!(CPUS[15].cpuid, 15);
    }
}
