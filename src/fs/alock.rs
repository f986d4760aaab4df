//! Advisory byte-range locks (`fcntl` F_SETLK family).
//!
//! Each node carries one list of `{start, end, type, pid}` records,
//! inclusive ranges. Invariant: after any mutation, the records of one
//! pid are pairwise disjoint (overlaps are merged, splits create new
//! records). A lock with `l_len == 0` runs to `END_OF_FILE`, so writes
//! past EOF stay covered.

use alloc::vec::Vec;

use crate::scheduler::Pid;

/// Inclusive end of an "until end of file" lock.
pub const END_OF_FILE: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alock {
    pub start: i64,
    /// Inclusive.
    pub end: i64,
    pub ltype: LockType,
    pub pid: Pid,
}

impl Alock {
    fn overlaps(&self, start: i64, end: i64) -> bool {
        !(end < self.start || start > self.end)
    }
}

/// The per-node lock chain.
#[derive(Debug, Default)]
pub struct AlockList {
    locks: Vec<Alock>,
}

impl AlockList {
    pub fn new() -> Self {
        AlockList { locks: Vec::new() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Alock> {
        self.locks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// First lock that blocks `pid` from acquiring `[start, end]` as
    /// `ltype`: a different owner where either side is a write lock.
    /// This is the F_GETLK answer.
    pub fn conflicting(&self, start: i64, end: i64, ltype: LockType, pid: Pid) -> Option<Alock> {
        self.locks
            .iter()
            .find(|l| {
                l.pid != pid
                    && l.overlaps(start, end)
                    && (ltype == LockType::Write || l.ltype == LockType::Write)
            })
            .copied()
    }

    /// Install `[start, end]` as `ltype` for `pid`, merging with the
    /// caller's own overlapping records.
    ///
    /// The four overlap geometries between the new range `[s, e]` and an
    /// old `[s', e']`:
    ///   1. covers:   s <= s' and e >= e'  -> old becomes `[s, e]` of the new type
    ///   2. left:     s <= s' and e <  e'  -> same type extends; else old
    ///      shrinks to `[e+1, e']` and the new lock sits before it
    ///   3. right:    s >  s' and e >= e'  -> same type extends; else old
    ///      shrinks to `[s', s-1]` and the new lock is appended
    ///   4. inside:   s >  s' and e <  e'  -> same type is a no-op; else
    ///      the old lock splits around the new one
    ///
    /// Conflicts with other pids are the caller's business (checked via
    /// `conflicting` before getting here).
    pub fn add_lock(&mut self, start: i64, end: i64, ltype: LockType, pid: Pid) {
        let mut i = 0;
        while i < self.locks.len() {
            let old = self.locks[i];
            if old.pid != pid || !old.overlaps(start, end) {
                i += 1;
                continue;
            }

            if start <= old.start && end >= old.end {
                // Case 1: the new range swallows the old record.
                self.locks[i] = Alock {
                    start,
                    end,
                    ltype,
                    pid,
                };
                self.merge_neighbours(i, pid);
                return;
            }

            if start <= old.start {
                // Case 2: overlap on the old record's left edge.
                if old.ltype == ltype {
                    self.locks[i].start = start;
                } else {
                    self.locks[i].start = end + 1;
                    self.locks.insert(
                        i,
                        Alock {
                            start,
                            end,
                            ltype,
                            pid,
                        },
                    );
                }
                return;
            }

            if end >= old.end {
                // Case 3: overlap on the right edge.
                if old.ltype == ltype {
                    self.locks[i].end = end;
                    self.merge_neighbours(i, pid);
                } else {
                    self.locks[i].end = start - 1;
                    self.locks.push(Alock {
                        start,
                        end,
                        ltype,
                        pid,
                    });
                }
                return;
            }

            // Case 4: strictly inside.
            if old.ltype == ltype {
                return;
            }
            self.locks[i].end = start - 1;
            self.locks.insert(
                i + 1,
                Alock {
                    start,
                    end,
                    ltype,
                    pid,
                },
            );
            self.locks.insert(
                i + 2,
                Alock {
                    start: end + 1,
                    end: old.end,
                    ltype: old.ltype,
                    pid,
                },
            );
            return;
        }

        // No overlap with our own records: new entry at the head.
        self.locks.insert(
            0,
            Alock {
                start,
                end,
                ltype,
                pid,
            },
        );
    }

    /// A case-1 replacement may now overlap further records of the same
    /// pid; fold them in. Same-type neighbours extend the cover;
    /// different-type ones are trimmed to the bytes outside it.
    fn merge_neighbours(&mut self, at: usize, pid: Pid) {
        let mut cover = self.locks.remove(at);
        let mut absorbed: Vec<Alock> = Vec::new();
        self.locks.retain(|l| {
            if l.pid == pid && l.overlaps(cover.start, cover.end) {
                absorbed.push(*l);
                false
            } else {
                true
            }
        });

        for frag in absorbed.iter().filter(|f| f.ltype == cover.ltype) {
            cover.start = cover.start.min(frag.start);
            cover.end = cover.end.max(frag.end);
        }
        for frag in absorbed.iter().filter(|f| f.ltype != cover.ltype) {
            if frag.start < cover.start {
                self.locks.push(Alock {
                    end: cover.start - 1,
                    ..*frag
                });
            }
            if frag.end > cover.end {
                self.locks.push(Alock {
                    start: cover.end + 1,
                    ..*frag
                });
            }
        }
        self.locks.push(cover);
    }

    /// Unlock `[start, end]` for `pid`: trim or split records so no byte
    /// of the range stays locked by that pid.
    pub fn remove_lock(&mut self, start: i64, end: i64, pid: Pid) {
        let mut i = 0;
        while i < self.locks.len() {
            let old = self.locks[i];
            if old.pid != pid || !old.overlaps(start, end) {
                i += 1;
                continue;
            }

            if start <= old.start && end >= old.end {
                // Fully unlocked.
                self.locks.remove(i);
                continue;
            }

            if start <= old.start {
                self.locks[i].start = end + 1;
                i += 1;
                continue;
            }

            if end >= old.end {
                self.locks[i].end = start - 1;
                i += 1;
                continue;
            }

            // Hole in the middle: split.
            self.locks[i].end = start - 1;
            self.locks.insert(
                i + 1,
                Alock {
                    start: end + 1,
                    end: old.end,
                    ltype: old.ltype,
                    pid,
                },
            );
            i += 2;
        }
    }

    /// Task exit / last close: drop everything `pid` holds. Returns true
    /// when anything was removed (the caller wakes waiters).
    pub fn remove_all_for(&mut self, pid: Pid) -> bool {
        let before = self.locks.len();
        self.locks.retain(|l| l.pid != pid);
        self.locks.len() != before
    }

    /// Locked ranges held by `pid`, for invariant checks and `/proc`.
    pub fn ranges_of(&self, pid: Pid) -> Vec<(i64, i64, LockType)> {
        self.locks
            .iter()
            .filter(|l| l.pid == pid)
            .map(|l| (l.start, l.end, l.ltype))
            .collect()
    }
}

/// Translate `l_start`/`l_len` (already adjusted for `l_whence`) into an
/// inclusive range. `l_len == 0` runs to end of file; a negative length
/// locks the bytes before `l_start`.
pub fn flock_range(start: i64, len: i64) -> Option<(i64, i64)> {
    if len == 0 {
        if start < 0 {
            return None;
        }
        return Some((start, END_OF_FILE));
    }
    if len > 0 {
        if start < 0 {
            return None;
        }
        Some((start, start + len - 1))
    } else {
        let end = start - 1;
        let begin = start + len;
        if begin < 0 {
            return None;
        }
        Some((begin, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lock(list: &mut AlockList, s: i64, e: i64, pid: Pid) {
        list.add_lock(s, e, LockType::Write, pid);
    }

    #[test]
    fn getlk_reports_the_blocker() {
        let mut list = AlockList::new();
        write_lock(&mut list, 0, 100, 7);

        let conflict = list.conflicting(50, 60, LockType::Write, 8).unwrap();
        assert_eq!(conflict.start, 0);
        assert_eq!(conflict.end, 100);
        assert_eq!(conflict.ltype, LockType::Write);
        assert_eq!(conflict.pid, 7);

        // The owner itself is never blocked.
        assert!(list.conflicting(50, 60, LockType::Write, 7).is_none());
    }

    #[test]
    fn read_locks_share_but_exclude_writers() {
        let mut list = AlockList::new();
        list.add_lock(0, 10, LockType::Read, 1);
        assert!(list.conflicting(0, 10, LockType::Read, 2).is_none());
        assert!(list.conflicting(0, 10, LockType::Write, 2).is_some());
    }

    /// Unlocking the middle of a write lock leaves the two edges locked
    /// and frees the hole for another task.
    #[test]
    fn mid_range_unlock_splits_and_releases() {
        let mut list = AlockList::new();
        write_lock(&mut list, 0, 100, 1);

        list.remove_lock(40, 70, 1);
        let mut ranges = list.ranges_of(1);
        ranges.sort();
        assert_eq!(
            ranges,
            alloc::vec![(0, 39, LockType::Write), (71, 100, LockType::Write)]
        );

        // Task 2 can now take the hole.
        assert!(list.conflicting(40, 70, LockType::Write, 2).is_none());
        write_lock(&mut list, 40, 70, 2);
        assert_eq!(list.ranges_of(2), alloc::vec![(40, 70, LockType::Write)]);
    }

    #[test]
    fn covering_lock_promotes_type_and_absorbs() {
        let mut list = AlockList::new();
        list.add_lock(10, 20, LockType::Read, 1);
        list.add_lock(0, 50, LockType::Write, 1);
        assert_eq!(list.ranges_of(1), alloc::vec![(0, 50, LockType::Write)]);
    }

    #[test]
    fn same_type_edge_overlap_extends() {
        let mut list = AlockList::new();
        list.add_lock(10, 20, LockType::Read, 1);
        list.add_lock(15, 30, LockType::Read, 1);
        assert_eq!(list.ranges_of(1), alloc::vec![(10, 30, LockType::Read)]);
    }

    #[test]
    fn different_type_inside_splits_three_ways() {
        let mut list = AlockList::new();
        list.add_lock(0, 100, LockType::Read, 1);
        list.add_lock(40, 60, LockType::Write, 1);
        let mut ranges = list.ranges_of(1);
        ranges.sort();
        assert_eq!(
            ranges,
            alloc::vec![
                (0, 39, LockType::Read),
                (40, 60, LockType::Write),
                (61, 100, LockType::Read)
            ]
        );
    }

    #[test]
    fn per_pid_ranges_stay_disjoint() {
        let mut list = AlockList::new();
        list.add_lock(0, 10, LockType::Read, 1);
        list.add_lock(5, 20, LockType::Write, 1);
        list.add_lock(15, 30, LockType::Read, 1);
        let mut ranges = list.ranges_of(1);
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0, "overlap in {:?}", ranges);
        }
    }

    #[test]
    fn exit_cleanup_drops_everything() {
        let mut list = AlockList::new();
        write_lock(&mut list, 0, 10, 1);
        write_lock(&mut list, 20, 30, 1);
        write_lock(&mut list, 50, 60, 2);
        assert!(list.remove_all_for(1));
        assert!(list.ranges_of(1).is_empty());
        assert_eq!(list.ranges_of(2).len(), 1);
        assert!(!list.remove_all_for(1));
    }

    #[test]
    fn zero_length_lock_extends_to_eof() {
        let (s, e) = flock_range(100, 0).unwrap();
        assert_eq!((s, e), (100, END_OF_FILE));

        let mut list = AlockList::new();
        list.add_lock(s, e, LockType::Write, 1);
        // A write far past any current EOF still collides.
        assert!(list
            .conflicting(1 << 40, (1 << 40) + 10, LockType::Write, 2)
            .is_some());
    }

    #[test]
    fn negative_length_locks_preceding_bytes() {
        let (s, e) = flock_range(100, -10).unwrap();
        assert_eq!((s, e), (90, 99));
        assert!(flock_range(5, -10).is_none());
    }
}
