//! The VFS proper: node cache, mount table and path resolution.
//!
//! The node cache is a fixed table of `NR_INODE` slots scanned by
//! `(dev, ino)`. A miss claims an empty slot (evicting an unreferenced
//! node after flushing it), marks it STALE, asks the owning filesystem
//! to `read_inode`, then clears STALE.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};

use super::node::{DevId, DirEntry, FsOps, InodeNum, Node, NodeFlags, NodeType};

pub const NR_INODE: usize = 256;

/// One mounted filesystem instance.
pub struct Mount {
    pub dev: DevId,
    pub root_ino: InodeNum,
    /// `(dev, ino)` of the directory this mount covers; the root mount
    /// covers nothing.
    pub covers: Option<(DevId, InodeNum)>,
    pub ops: Arc<dyn FsOps>,
    pub source: String,
}

pub struct Vfs {
    nodes: Vec<Option<Arc<Node>>>,
    mounts: Vec<Mount>,
}

lazy_static! {
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

impl Vfs {
    pub fn new() -> Self {
        let mut nodes = Vec::with_capacity(NR_INODE);
        nodes.resize_with(NR_INODE, || None);
        Vfs {
            nodes,
            mounts: Vec::new(),
        }
    }

    /// The operation vtable owning `dev`.
    pub fn ops_for(&self, dev: DevId) -> KResult<Arc<dyn FsOps>> {
        self.mounts
            .iter()
            .find(|m| m.dev == dev)
            .map(|m| m.ops.clone())
            .ok_or(Errno::ENODEV)
    }

    /// Mount `ops` (device `dev`) over the directory `covers`, or as the
    /// root when `covers` is `None`.
    pub fn mount(
        &mut self,
        dev: DevId,
        root_ino: InodeNum,
        covers: Option<(DevId, InodeNum)>,
        ops: Arc<dyn FsOps>,
        source: &str,
    ) -> KResult<()> {
        if self.mounts.iter().any(|m| m.dev == dev) {
            return Err(Errno::EBUSY);
        }
        if covers.is_none() && self.mounts.iter().any(|m| m.covers.is_none()) {
            return Err(Errno::EBUSY);
        }
        self.mounts.push(Mount {
            dev,
            root_ino,
            covers,
            ops,
            source: String::from(source),
        });
        Ok(())
    }

    pub fn umount(&mut self, dev: DevId) -> KResult<()> {
        // Live references forbid the unmount.
        let busy = self
            .nodes
            .iter()
            .flatten()
            .any(|n| n.dev == dev && n.get_ref() > 0);
        if busy {
            return Err(Errno::EBUSY);
        }
        let before = self.mounts.len();
        self.mounts.retain(|m| m.dev != dev);
        if self.mounts.len() == before {
            return Err(Errno::EINVAL);
        }
        self.nodes
            .iter_mut()
            .filter(|slot| slot.as_ref().map_or(false, |n| n.dev == dev))
            .for_each(|slot| *slot = None);
        Ok(())
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    fn root_mount(&self) -> KResult<&Mount> {
        self.mounts
            .iter()
            .find(|m| m.covers.is_none())
            .ok_or(Errno::ENOENT)
    }

    /// Look `(dev, ino)` up in the cache, reading it in on a miss. The
    /// returned node carries an extra reference the caller must release.
    pub fn get_node(&mut self, dev: DevId, ino: InodeNum) -> KResult<Arc<Node>> {
        if let Some(node) = self
            .nodes
            .iter()
            .flatten()
            .find(|n| n.dev == dev && n.ino == ino)
        {
            node.inc_ref();
            return Ok(node.clone());
        }

        let ops = self.ops_for(dev)?;

        // Claim a slot: first hole, else evict an unreferenced node.
        let slot = match self.nodes.iter().position(|s| s.is_none()) {
            Some(i) => i,
            None => {
                let victim = self
                    .nodes
                    .iter()
                    .position(|s| {
                        s.as_ref().map_or(false, |n| {
                            n.get_ref() == 0
                                && !n.inner.lock().flags.contains(NodeFlags::KEEP_INCORE)
                        })
                    })
                    .ok_or(Errno::ENFILE)?;
                if let Some(old) = &self.nodes[victim] {
                    if old.inner.lock().flags.contains(NodeFlags::DIRTY) {
                        let old_ops = self.ops_for(old.dev)?;
                        old_ops.write_inode(old)?;
                    }
                }
                self.nodes[victim] = None;
                victim
            }
        };

        let node = Node::new(dev, ino);
        node.inner.lock().flags |= NodeFlags::STALE;
        node.inc_ref();
        self.nodes[slot] = Some(node.clone());

        if let Err(e) = ops.read_inode(&node) {
            self.nodes[slot] = None;
            return Err(e);
        }
        node.inner.lock().flags -= NodeFlags::STALE;
        Ok(node)
    }

    /// Drop one reference. On the last one: unlinked nodes are truncated
    /// and freed on the backing store, dirty ones are written back.
    /// Frame freeing for still-mapped nodes is deferred to the last VMA
    /// teardown.
    pub fn release_node(&mut self, node: &Arc<Node>) -> KResult<()> {
        if node.dec_ref() != 1 {
            return Ok(());
        }
        if node.mmap_count.load(core::sync::atomic::Ordering::Acquire) > 0 {
            return Ok(());
        }

        let ops = self.ops_for(node.dev)?;
        let (links, dirty) = {
            let inner = node.inner.lock();
            (inner.links, inner.flags.contains(NodeFlags::DIRTY))
        };

        if links == 0 {
            ops.truncate(node, 0).ok();
            ops.free_inode(node).ok();
            self.nodes
                .iter_mut()
                .filter(|s| {
                    s.as_ref()
                        .map_or(false, |n| n.dev == node.dev && n.ino == node.ino)
                })
                .for_each(|s| *s = None);
        } else if dirty {
            ops.write_inode(node)?;
            node.inner.lock().flags -= NodeFlags::DIRTY;
        }
        Ok(())
    }

    /// Resolve an absolute path to a node (with a reference), crossing
    /// mount points. Symlinks resolve up to a fixed depth.
    pub fn namei(&mut self, path: &str) -> KResult<Arc<Node>> {
        self.namei_depth(path, 0)
    }

    fn namei_depth(&mut self, path: &str, depth: usize) -> KResult<Arc<Node>> {
        const MAX_SYMLINK_DEPTH: usize = 8;
        if depth > MAX_SYMLINK_DEPTH {
            return Err(Errno::ENOENT);
        }
        if !path.starts_with('/') {
            return Err(Errno::EINVAL);
        }

        let (root_dev, root_ino) = {
            let root = self.root_mount()?;
            (root.dev, root.root_ino)
        };
        let mut current = self.get_node(root_dev, root_ino)?;

        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !current.is_dir() {
                self.release_node(&current)?;
                return Err(Errno::ENOTDIR);
            }
            let ops = self.ops_for(current.dev)?;
            let entry = match ops.finddir(&current, comp) {
                Ok(e) => e,
                Err(e) => {
                    self.release_node(&current)?;
                    return Err(e);
                }
            };
            self.release_node(&current)?;

            let mut next = self.get_node(current.dev, entry.ino)?;

            // A directory covered by a mount redirects to that mount's
            // root.
            if let Some(mount) = self
                .mounts
                .iter()
                .find(|m| m.covers == Some((next.dev, next.ino)))
            {
                let (mdev, mroot) = (mount.dev, mount.root_ino);
                self.release_node(&next)?;
                next = self.get_node(mdev, mroot)?;
            }

            if next.inner.lock().ntype == NodeType::Symlink {
                let ops = self.ops_for(next.dev)?;
                let target = ops.read_symlink(&next)?;
                self.release_node(&next)?;
                next = self.namei_depth(&target, depth + 1)?;
            }

            current = next;
        }
        Ok(current)
    }

    /// Shrinking truncate frees now-unused blocks through `bmap(FREE)`;
    /// growth is sparse (no allocation until write). Timestamps move.
    pub fn truncate_node(&mut self, node: &Arc<Node>, size: u64) -> KResult<()> {
        let ops = self.ops_for(node.dev)?;
        ops.truncate(node, size)?;
        let mut inner = node.inner.lock();
        inner.size = size;
        inner.mtime = crate::time::seconds();
        inner.ctime = inner.mtime;
        inner.flags |= NodeFlags::DIRTY;
        Ok(())
    }

    /// Cached-node count, for `/proc` accounting.
    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().flatten().count()
    }
}

/// Directory listing helper used by `getdents`: synthesizes `.` and
/// `..` ahead of the filesystem's own entries.
pub fn dents_with_dots(dir: &Node, entries: Vec<DirEntry>, pos: usize) -> Vec<DirEntry> {
    let mut all = Vec::with_capacity(entries.len() + 2);
    all.push(DirEntry {
        name: String::from("."),
        ino: dir.ino,
        ntype: NodeType::Directory,
    });
    all.push(DirEntry {
        name: String::from(".."),
        ino: dir.ino,
        ntype: NodeType::Directory,
    });
    all.extend(entries);
    all.into_iter().skip(pos).collect()
}
