//! tmpfs: a fully in-memory filesystem. Backs `/` until a real root is
//! mounted, and `/tmp` afterwards.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::errno::{Errno, KResult};

use super::node::{DevId, DirEntry, FsOps, InodeNum, Node, NodeType, StatFs};

struct TmpNode {
    kind: NodeType,
    mode: u16,
    uid: u32,
    gid: u32,
    links: u32,
    data: Vec<u8>,
    children: BTreeMap<String, InodeNum>,
    symlink: String,
}

impl TmpNode {
    fn file() -> Self {
        TmpNode {
            kind: NodeType::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            links: 1,
            data: Vec::new(),
            children: BTreeMap::new(),
            symlink: String::new(),
        }
    }

    fn dir() -> Self {
        TmpNode {
            kind: NodeType::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            links: 2,
            data: Vec::new(),
            children: BTreeMap::new(),
            symlink: String::new(),
        }
    }
}

struct TmpState {
    nodes: BTreeMap<InodeNum, TmpNode>,
    next_ino: InodeNum,
}

pub struct TmpFs {
    pub dev: DevId,
    state: Mutex<TmpState>,
}

impl TmpFs {
    pub const ROOT_INO: InodeNum = 1;

    pub fn new(dev: DevId) -> Arc<TmpFs> {
        let mut nodes = BTreeMap::new();
        nodes.insert(Self::ROOT_INO, TmpNode::dir());
        Arc::new(TmpFs {
            dev,
            state: Mutex::new(TmpState {
                nodes,
                next_ino: Self::ROOT_INO + 1,
            }),
        })
    }

    fn alloc(&self, node: TmpNode) -> InodeNum {
        let mut st = self.state.lock();
        let ino = st.next_ino;
        st.next_ino += 1;
        st.nodes.insert(ino, node);
        ino
    }

    /// Create a regular file under `parent`.
    pub fn create_at(&self, parent: InodeNum, name: &str) -> KResult<InodeNum> {
        let ino = self.alloc(TmpNode::file());
        let mut st = self.state.lock();
        let dir = st.nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        if dir.kind != NodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if dir.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        dir.children.insert(String::from(name), ino);
        Ok(ino)
    }

    /// Create a directory under `parent`.
    pub fn mkdir_at(&self, parent: InodeNum, name: &str) -> KResult<InodeNum> {
        let ino = self.alloc(TmpNode::dir());
        let mut st = self.state.lock();
        let dir = st.nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        if dir.kind != NodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        if dir.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        dir.children.insert(String::from(name), ino);
        dir.links += 1;
        Ok(ino)
    }

    pub fn symlink_at(&self, parent: InodeNum, name: &str, target: &str) -> KResult<InodeNum> {
        let mut link = TmpNode::file();
        link.kind = NodeType::Symlink;
        link.symlink = String::from(target);
        let ino = self.alloc(link);
        let mut st = self.state.lock();
        let dir = st.nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        dir.children.insert(String::from(name), ino);
        Ok(ino)
    }

    pub fn write_ino(&self, ino: InodeNum, off: u64, buf: &[u8]) -> KResult<usize> {
        let mut st = self.state.lock();
        let node = st.nodes.get_mut(&ino).ok_or(Errno::ENOENT)?;
        let end = off as usize + buf.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[off as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    pub fn deldir_name(&self, parent: InodeNum, name: &str) -> KResult<()> {
        let mut st = self.state.lock();
        let dir = st.nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        let ino = dir.children.remove(name).ok_or(Errno::ENOENT)?;
        if let Some(node) = st.nodes.get_mut(&ino) {
            node.links = node.links.saturating_sub(1);
        }
        Ok(())
    }
}

impl FsOps for TmpFs {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn read_inode(&self, node: &Node) -> KResult<()> {
        let st = self.state.lock();
        let tn = st.nodes.get(&node.ino).ok_or(Errno::ENOENT)?;
        let mut inner = node.inner.lock();
        inner.ntype = tn.kind;
        inner.mode = tn.mode;
        inner.uid = tn.uid;
        inner.gid = tn.gid;
        inner.links = tn.links;
        inner.size = tn.data.len() as u64;
        Ok(())
    }

    fn alloc_inode(&self) -> KResult<InodeNum> {
        Ok(self.alloc(TmpNode::file()))
    }

    fn free_inode(&self, node: &Node) -> KResult<()> {
        self.state.lock().nodes.remove(&node.ino);
        Ok(())
    }

    fn read(&self, node: &Node, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let st = self.state.lock();
        let tn = st.nodes.get(&node.ino).ok_or(Errno::ENOENT)?;
        if tn.kind == NodeType::Directory {
            return Err(Errno::EISDIR);
        }
        let off = off as usize;
        if off >= tn.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(tn.data.len() - off);
        buf[..n].copy_from_slice(&tn.data[off..off + n]);
        Ok(n)
    }

    fn write(&self, node: &Node, off: u64, buf: &[u8]) -> KResult<usize> {
        let n = self.write_ino(node.ino, off, buf)?;
        node.inner.lock().size = self.state.lock().nodes[&node.ino].data.len() as u64;
        Ok(n)
    }

    fn finddir(&self, dir: &Node, name: &str) -> KResult<DirEntry> {
        let st = self.state.lock();
        let tn = st.nodes.get(&dir.ino).ok_or(Errno::ENOENT)?;
        if tn.kind != NodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let ino = *tn.children.get(name).ok_or(Errno::ENOENT)?;
        let kind = st.nodes.get(&ino).map(|n| n.kind).unwrap_or(NodeType::Regular);
        Ok(DirEntry {
            name: String::from(name),
            ino,
            ntype: kind,
        })
    }

    fn finddir_by_inode(&self, dir: &Node, ino: InodeNum) -> KResult<DirEntry> {
        let st = self.state.lock();
        let tn = st.nodes.get(&dir.ino).ok_or(Errno::ENOENT)?;
        for (name, child) in &tn.children {
            if *child == ino {
                let kind = st.nodes.get(child).map(|n| n.kind).unwrap_or(NodeType::Regular);
                return Ok(DirEntry {
                    name: name.clone(),
                    ino,
                    ntype: kind,
                });
            }
        }
        Err(Errno::ENOENT)
    }

    fn addir(&self, dir: &Node, name: &str, ino: InodeNum) -> KResult<()> {
        let mut st = self.state.lock();
        let tn = st.nodes.get_mut(&dir.ino).ok_or(Errno::ENOENT)?;
        if tn.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        tn.children.insert(String::from(name), ino);
        Ok(())
    }

    fn deldir(&self, dir: &Node, name: &str) -> KResult<()> {
        self.deldir_name(dir.ino, name)
    }

    fn mkdir(&self, dir: &Node, name: &str) -> KResult<InodeNum> {
        self.mkdir_at(dir.ino, name)
    }

    fn dir_empty(&self, dir: &Node) -> KResult<bool> {
        let st = self.state.lock();
        let tn = st.nodes.get(&dir.ino).ok_or(Errno::ENOENT)?;
        Ok(tn.children.is_empty())
    }

    fn getdents(&self, dir: &Node, pos: usize) -> KResult<Vec<DirEntry>> {
        let st = self.state.lock();
        let tn = st.nodes.get(&dir.ino).ok_or(Errno::ENOENT)?;
        if tn.kind != NodeType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let entries = tn
            .children
            .iter()
            .map(|(name, ino)| DirEntry {
                name: name.clone(),
                ino: *ino,
                ntype: st.nodes.get(ino).map(|n| n.kind).unwrap_or(NodeType::Regular),
            })
            .collect();
        drop(st);
        Ok(super::vfs::dents_with_dots(dir, entries, pos))
    }

    fn read_symlink(&self, node: &Node) -> KResult<String> {
        let st = self.state.lock();
        let tn = st.nodes.get(&node.ino).ok_or(Errno::ENOENT)?;
        if tn.kind != NodeType::Symlink {
            return Err(Errno::EINVAL);
        }
        Ok(tn.symlink.clone())
    }

    fn truncate(&self, node: &Node, size: u64) -> KResult<()> {
        let mut st = self.state.lock();
        let tn = st.nodes.get_mut(&node.ino).ok_or(Errno::ENOENT)?;
        // Shrink releases the pages; growth stays sparse until written.
        if (size as usize) < tn.data.len() {
            tn.data.truncate(size as usize);
        }
        Ok(())
    }

    fn statfs(&self) -> KResult<StatFs> {
        let st = self.state.lock();
        let used: u64 = st.nodes.values().map(|n| n.data.len() as u64).sum();
        Ok(StatFs {
            block_size: crate::memory::PAGE_SIZE,
            blocks: used / crate::memory::PAGE_SIZE + 1,
            blocks_free: u64::MAX / crate::memory::PAGE_SIZE,
            files: st.nodes.len() as u64,
            files_free: u64::MAX,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let fs = TmpFs::new(1);
        let ino = fs.create_at(TmpFs::ROOT_INO, "notes").unwrap();
        fs.write_ino(ino, 0, b"hello").unwrap();
        fs.write_ino(ino, 5, b" world").unwrap();

        let node = Node::new(1, ino);
        fs.read_inode(&node).unwrap();
        assert_eq!(node.inner.lock().size, 11);

        let mut buf = [0u8; 32];
        let n = fs.read(&node, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        // Offset read.
        let n = fs.read(&node, 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn sparse_write_zero_fills_the_gap() {
        let fs = TmpFs::new(1);
        let ino = fs.create_at(TmpFs::ROOT_INO, "sparse").unwrap();
        fs.write_ino(ino, 100, b"x").unwrap();
        let node = Node::new(1, ino);
        let mut buf = [0xFFu8; 4];
        fs.read(&node, 50, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = TmpFs::new(1);
        fs.create_at(TmpFs::ROOT_INO, "a").unwrap();
        assert_eq!(fs.create_at(TmpFs::ROOT_INO, "a"), Err(Errno::EEXIST));
    }

    #[test]
    fn truncate_shrinks_but_growth_is_sparse() {
        let fs = TmpFs::new(1);
        let ino = fs.create_at(TmpFs::ROOT_INO, "t").unwrap();
        fs.write_ino(ino, 0, b"0123456789").unwrap();
        let node = Node::new(1, ino);
        fs.truncate(&node, 4).unwrap();
        let mut buf = [0u8; 16];
        let n = fs.read(&node, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123");

        // Growing truncate allocates nothing.
        fs.truncate(&node, 100).unwrap();
        let n = fs.read(&node, 0, &mut buf).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn getdents_lists_dots_first() {
        let fs = TmpFs::new(1);
        fs.create_at(TmpFs::ROOT_INO, "b").unwrap();
        fs.create_at(TmpFs::ROOT_INO, "a").unwrap();
        let dir = Node::new(1, TmpFs::ROOT_INO);
        fs.read_inode(&dir).unwrap();
        let entries = fs.getdents(&dir, 0).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries.len(), 4);

        // pos indexes into the whole listing.
        let rest = fs.getdents(&dir, 3).unwrap();
        assert_eq!(rest.len(), 1);
    }
}
