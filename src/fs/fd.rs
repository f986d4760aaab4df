//! Open files and per-task descriptor tables.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::scheduler::Pid;

use super::node::Node;
use super::pipe::Pipe;

pub const NR_OPEN: usize = 64;

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_ACCMODE: u32 = 3;
pub const O_CREAT: u32 = 0o100;
pub const O_TRUNC: u32 = 0o1000;
pub const O_APPEND: u32 = 0o2000;
pub const O_NONBLOCK: u32 = 0o4000;
pub const O_CLOEXEC: u32 = 0o2000000;

/// What an open file refers to.
#[derive(Debug)]
pub enum FileKind {
    Node(Arc<Node>),
    PipeRead(Arc<Pipe>),
    PipeWrite(Arc<Pipe>),
    /// A tty by minor number; resolved through the tty table.
    Tty(usize),
}

/// One VFS open-file: shared by dup'd descriptors and across fork.
#[derive(Debug)]
pub struct OpenFile {
    pub kind: FileKind,
    pub pos: Mutex<u64>,
    pub flags: Mutex<u32>,
    pub path: String,
}

impl OpenFile {
    pub fn new(kind: FileKind, flags: u32, path: &str) -> Arc<OpenFile> {
        Arc::new(OpenFile {
            kind,
            pos: Mutex::new(0),
            flags: Mutex::new(flags),
            path: String::from(path),
        })
    }

    pub fn readable(&self) -> bool {
        let acc = *self.flags.lock() & O_ACCMODE;
        acc == O_RDONLY || acc == O_RDWR
    }

    pub fn writable(&self) -> bool {
        let acc = *self.flags.lock() & O_ACCMODE;
        acc == O_WRONLY || acc == O_RDWR
    }

    pub fn nonblocking(&self) -> bool {
        *self.flags.lock() & O_NONBLOCK != 0
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        // The last reference to a pipe endpoint adjusts the peer counts
        // so the other side sees EOF / EPIPE.
        match &self.kind {
            FileKind::PipeRead(pipe) => pipe.drop_reader(),
            FileKind::PipeWrite(pipe) => pipe.drop_writer(),
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct FdEntry {
    pub file: Arc<OpenFile>,
    pub cloexec: bool,
}

/// Indexed descriptor slots. Cloning (fork) shares the open-files, so
/// offsets move together; pipe endpoint counts follow the open-file
/// lifetime, not the descriptor count.
#[derive(Clone)]
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NR_OPEN);
        slots.resize_with(NR_OPEN, || None);
        FdTable { slots }
    }

    pub fn get(&self, fd: usize) -> KResult<Arc<OpenFile>> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.file.clone())
            .ok_or(Errno::EBADF)
    }

    /// Lowest free slot at or above `min`.
    pub fn install_from(&mut self, min: usize, file: Arc<OpenFile>, cloexec: bool) -> KResult<usize> {
        for fd in min..NR_OPEN {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry { file, cloexec });
                return Ok(fd);
            }
        }
        Err(Errno::EMFILE)
    }

    pub fn install(&mut self, file: Arc<OpenFile>, cloexec: bool) -> KResult<usize> {
        self.install_from(0, file, cloexec)
    }

    /// `dup2`/`dup3` target placement; silently closes a previous
    /// occupant.
    pub fn install_at(&mut self, fd: usize, file: Arc<OpenFile>, cloexec: bool) -> KResult<usize> {
        if fd >= NR_OPEN {
            return Err(Errno::EBADF);
        }
        self.slots[fd] = Some(FdEntry { file, cloexec });
        Ok(fd)
    }

    /// Remove the descriptor, returning the open-file for the caller's
    /// release bookkeeping.
    pub fn remove(&mut self, fd: usize) -> KResult<Arc<OpenFile>> {
        if fd >= NR_OPEN {
            return Err(Errno::EBADF);
        }
        self.slots[fd]
            .take()
            .map(|e| e.file)
            .ok_or(Errno::EBADF)
    }

    pub fn set_cloexec(&mut self, fd: usize, cloexec: bool) -> KResult<()> {
        match self.slots.get_mut(fd).and_then(|s| s.as_mut()) {
            Some(entry) => {
                entry.cloexec = cloexec;
                Ok(())
            }
            None => Err(Errno::EBADF),
        }
    }

    pub fn cloexec(&self, fd: usize) -> KResult<bool> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.cloexec)
            .ok_or(Errno::EBADF)
    }

    /// Exec: drop close-on-exec descriptors.
    pub fn close_exec_slots(&mut self, pid: Pid) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, |e| e.cloexec) {
                if let Some(entry) = slot.take() {
                    super::file_closed(&entry.file, pid);
                }
            }
        }
    }

    /// Task exit: every descriptor goes away; advisory locks held by
    /// this pid are dropped per node.
    pub fn close_all(&mut self, pid: Pid) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.take() {
                super::file_closed(&entry.file, pid);
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter_fds(&self) -> impl Iterator<Item = (usize, &FdEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, s)| s.as_ref().map(|e| (fd, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::node::Node;

    fn file() -> Arc<OpenFile> {
        OpenFile::new(FileKind::Node(Node::new(1, 1)), O_RDWR, "/x")
    }

    #[test]
    fn install_uses_lowest_free_slot() {
        let mut t = FdTable::new();
        assert_eq!(t.install(file(), false).unwrap(), 0);
        assert_eq!(t.install(file(), false).unwrap(), 1);
        t.remove(0).unwrap();
        assert_eq!(t.install(file(), false).unwrap(), 0);
    }

    #[test]
    fn table_fills_to_emfile() {
        let mut t = FdTable::new();
        for _ in 0..NR_OPEN {
            t.install(file(), false).unwrap();
        }
        assert_eq!(t.install(file(), false), Err(Errno::EMFILE));
    }

    #[test]
    fn dup_shares_the_open_file() {
        let mut t = FdTable::new();
        let f = file();
        t.install(f.clone(), false).unwrap();
        let dup = t.get(0).unwrap();
        t.install_at(5, dup, false).unwrap();
        *t.get(0).unwrap().pos.lock() = 42;
        assert_eq!(*t.get(5).unwrap().pos.lock(), 42);
    }

    #[test]
    fn cloexec_slots_close_on_exec() {
        let mut t = FdTable::new();
        t.install(file(), false).unwrap();
        t.install(file(), true).unwrap();
        t.close_exec_slots(1);
        assert!(t.get(0).is_ok());
        assert_eq!(t.get(1).unwrap_err(), Errno::EBADF);
    }
}
