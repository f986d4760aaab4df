//! The in-core filesystem node and the per-filesystem operation vtable.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::errno::{Errno, KResult};

use super::alock::AlockList;

pub type DevId = u32;
pub type InodeNum = u64;

pub fn make_dev(major: u32, minor: u32) -> DevId {
    (major << 8) | (minor & 0xFF)
}

pub fn dev_major(dev: DevId) -> u32 {
    dev >> 8
}

pub fn dev_minor(dev: DevId) -> u32 {
    dev & 0xFF
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
    CharDev,
    BlockDev,
    Fifo,
    Symlink,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// In-core copy differs from the backing store.
        const DIRTY = 1 << 0;
        /// Slot claimed, `read_inode` still in flight.
        const STALE = 1 << 1;
        /// Never evict (mount roots, devfs root).
        const KEEP_INCORE = 1 << 2;
    }
}

/// Direct/indirect block pointer slots, ext2-style.
pub const NODE_BLOCK_PTRS: usize = 15;

/// Mutable node metadata, guarded by the node mutex.
#[derive(Debug)]
pub struct NodeInner {
    pub ntype: NodeType,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub links: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub blocks: [u64; NODE_BLOCK_PTRS],
    pub flags: NodeFlags,
    /// Device id for char/block device nodes.
    pub rdev: DevId,
}

impl NodeInner {
    pub fn empty() -> Self {
        NodeInner {
            ntype: NodeType::Regular,
            mode: 0,
            uid: 0,
            gid: 0,
            links: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            blocks: [0; NODE_BLOCK_PTRS],
            flags: NodeFlags::empty(),
            rdev: 0,
        }
    }
}

/// An in-core node, identified by `(dev, ino)`.
#[derive(Debug)]
pub struct Node {
    pub dev: DevId,
    pub ino: InodeNum,
    pub inner: Mutex<NodeInner>,
    pub refs: AtomicU32,
    /// Advisory lock chain plus its waiters' channel (the node address
    /// itself serves as the channel key).
    pub alocks: Mutex<AlockList>,
    /// Live memory-mappings of this node; frame freeing is deferred
    /// while nonzero.
    pub mmap_count: AtomicU32,
}

impl Node {
    pub fn new(dev: DevId, ino: InodeNum) -> Arc<Node> {
        Arc::new(Node {
            dev,
            ino,
            inner: Mutex::new(NodeInner::empty()),
            refs: AtomicU32::new(0),
            alocks: Mutex::new(AlockList::new()),
            mmap_count: AtomicU32::new(0),
        })
    }

    pub fn get_ref(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_ref(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().ntype == NodeType::Directory
    }

    /// Channel key for select/poll and lock waiters on this node.
    pub fn channel(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: InodeNum,
    pub ntype: NodeType,
}

/// `bmap` translation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmapMode {
    /// Look up only; absent blocks read as holes.
    Read,
    /// Allocate the block if absent.
    Create,
    /// Release the block (truncate path).
    Free,
}

/// Per-filesystem operations. Methods default to `ENOSYS` so synthetic
/// filesystems implement only what they mean.
pub trait FsOps: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_inode(&self, node: &Node) -> KResult<()>;

    fn write_inode(&self, _node: &Node) -> KResult<()> {
        Ok(())
    }

    fn alloc_inode(&self) -> KResult<InodeNum> {
        Err(Errno::ENOSYS)
    }

    fn free_inode(&self, _node: &Node) -> KResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Logical-to-physical block translation.
    fn bmap(&self, _node: &Node, _lblock: u64, _mode: BmapMode) -> KResult<u64> {
        Err(Errno::ENOSYS)
    }

    fn read(&self, node: &Node, off: u64, buf: &mut [u8]) -> KResult<usize>;

    fn write(&self, _node: &Node, _off: u64, _buf: &[u8]) -> KResult<usize> {
        Err(Errno::EROFS)
    }

    fn finddir(&self, dir: &Node, name: &str) -> KResult<DirEntry>;

    fn finddir_by_inode(&self, _dir: &Node, _ino: InodeNum) -> KResult<DirEntry> {
        Err(Errno::ENOSYS)
    }

    fn addir(&self, _dir: &Node, _name: &str, _ino: InodeNum) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn deldir(&self, _dir: &Node, _name: &str) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn mkdir(&self, _dir: &Node, _name: &str) -> KResult<InodeNum> {
        Err(Errno::EROFS)
    }

    fn dir_empty(&self, _dir: &Node) -> KResult<bool> {
        Err(Errno::ENOSYS)
    }

    fn getdents(&self, dir: &Node, pos: usize) -> KResult<Vec<DirEntry>>;

    fn read_symlink(&self, _node: &Node) -> KResult<String> {
        Err(Errno::EINVAL)
    }

    fn write_symlink(&self, _node: &Node, _target: &str) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn truncate(&self, _node: &Node, _size: u64) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn statfs(&self) -> KResult<StatFs> {
        Err(Errno::ENOSYS)
    }

    /// Select readiness; defaults to always ready (regular files).
    fn can_read(&self, _node: &Node) -> bool {
        true
    }

    fn can_write(&self, _node: &Node) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
}
