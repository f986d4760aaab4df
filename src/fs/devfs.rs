//! devfs: a flat, synthetic `/dev` populated as drivers register.
//!
//! Inode numbers are handed out monotonically in registration order;
//! `getdents` walks `.`, `..`, then the list by linear position.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};

use super::node::{DevId, DirEntry, FsOps, InodeNum, Node, NodeType, StatFs};

/// Character-device driver contract: what the generic device node
/// dispatches into.
pub trait CharDev: Send + Sync {
    fn read(&self, minor: u32, buf: &mut [u8], nonblock: bool) -> KResult<usize>;
    fn write(&self, minor: u32, buf: &[u8]) -> KResult<usize>;

    fn ioctl(&self, _minor: u32, _cmd: u32, _arg: usize) -> KResult<usize> {
        Err(Errno::ENOTTY)
    }

    fn can_read(&self, _minor: u32) -> bool {
        true
    }

    fn can_write(&self, _minor: u32) -> bool {
        true
    }
}

lazy_static! {
    /// Char-device switch table, keyed by major.
    static ref CHAR_DEVICES: Mutex<Vec<(u32, Arc<dyn CharDev>)>> = Mutex::new(Vec::new());
}

pub fn register_chardev(major: u32, dev: Arc<dyn CharDev>) {
    let mut table = CHAR_DEVICES.lock();
    table.retain(|(m, _)| *m != major);
    table.push((major, dev));
}

pub fn chardev(major: u32) -> Option<Arc<dyn CharDev>> {
    CHAR_DEVICES
        .lock()
        .iter()
        .find(|(m, _)| *m == major)
        .map(|(_, d)| d.clone())
}

struct DevNode {
    name: String,
    rdev: DevId,
    ino: InodeNum,
    mode: u16,
    uid: u32,
    gid: u32,
    kind: NodeType,
}

struct DevState {
    list: Vec<DevNode>,
    next_ino: InodeNum,
}

pub struct DevFs {
    pub dev: DevId,
    state: Mutex<DevState>,
}

impl DevFs {
    pub const ROOT_INO: InodeNum = 1;

    pub fn new(dev: DevId) -> Arc<DevFs> {
        Arc::new(DevFs {
            dev,
            state: Mutex::new(DevState {
                list: Vec::new(),
                next_ino: Self::ROOT_INO + 1,
            }),
        })
    }

    /// Driver registration: appends the node, assigns the next inode.
    pub fn register(&self, name: &str, rdev: DevId, mode: u16, kind: NodeType) -> InodeNum {
        let mut st = self.state.lock();
        let ino = st.next_ino;
        st.next_ino += 1;
        st.list.push(DevNode {
            name: String::from(name),
            rdev,
            ino,
            mode,
            uid: 0,
            gid: 0,
            kind,
        });
        ino
    }

    pub fn unregister(&self, name: &str) {
        self.state.lock().list.retain(|n| n.name != name);
    }

    pub fn nodes(&self) -> Vec<(String, DevId)> {
        self.state
            .lock()
            .list
            .iter()
            .map(|n| (n.name.clone(), n.rdev))
            .collect()
    }
}

impl FsOps for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn read_inode(&self, node: &Node) -> KResult<()> {
        let mut inner = node.inner.lock();
        if node.ino == Self::ROOT_INO {
            inner.ntype = NodeType::Directory;
            inner.mode = 0o755;
            inner.links = 2;
            return Ok(());
        }
        let st = self.state.lock();
        let dn = st
            .list
            .iter()
            .find(|n| n.ino == node.ino)
            .ok_or(Errno::ENOENT)?;
        inner.ntype = dn.kind;
        inner.mode = dn.mode;
        inner.uid = dn.uid;
        inner.gid = dn.gid;
        inner.links = 1;
        inner.rdev = dn.rdev;
        Ok(())
    }

    fn read(&self, node: &Node, _off: u64, buf: &mut [u8]) -> KResult<usize> {
        let rdev = node.inner.lock().rdev;
        let major = super::node::dev_major(rdev);
        let minor = super::node::dev_minor(rdev);
        chardev(major)
            .ok_or(Errno::ENXIO)?
            .read(minor, buf, false)
    }

    fn write(&self, node: &Node, _off: u64, buf: &[u8]) -> KResult<usize> {
        let rdev = node.inner.lock().rdev;
        let major = super::node::dev_major(rdev);
        let minor = super::node::dev_minor(rdev);
        chardev(major).ok_or(Errno::ENXIO)?.write(minor, buf)
    }

    fn finddir(&self, dir: &Node, name: &str) -> KResult<DirEntry> {
        if dir.ino != Self::ROOT_INO {
            return Err(Errno::ENOTDIR);
        }
        let st = self.state.lock();
        st.list
            .iter()
            .find(|n| n.name == name)
            .map(|n| DirEntry {
                name: n.name.clone(),
                ino: n.ino,
                ntype: n.kind,
            })
            .ok_or(Errno::ENOENT)
    }

    fn getdents(&self, dir: &Node, pos: usize) -> KResult<Vec<DirEntry>> {
        if dir.ino != Self::ROOT_INO {
            return Err(Errno::ENOTDIR);
        }
        let st = self.state.lock();
        let entries = st
            .list
            .iter()
            .map(|n| DirEntry {
                name: n.name.clone(),
                ino: n.ino,
                ntype: n.kind,
            })
            .collect();
        drop(st);
        Ok(super::vfs::dents_with_dots(dir, entries, pos))
    }

    fn can_read(&self, node: &Node) -> bool {
        let rdev = node.inner.lock().rdev;
        chardev(super::node::dev_major(rdev))
            .map(|d| d.can_read(super::node::dev_minor(rdev)))
            .unwrap_or(false)
    }

    fn can_write(&self, node: &Node) -> bool {
        let rdev = node.inner.lock().rdev;
        chardev(super::node::dev_major(rdev))
            .map(|d| d.can_write(super::node::dev_minor(rdev)))
            .unwrap_or(false)
    }

    fn statfs(&self) -> KResult<StatFs> {
        Ok(StatFs {
            block_size: 512,
            files: self.state.lock().list.len() as u64,
            ..StatFs::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::make_dev;
    use super::*;

    #[test]
    fn inodes_assigned_in_registration_order() {
        let fs = DevFs::new(5);
        let a = fs.register("ttyS0", make_dev(4, 64), 0o620, NodeType::CharDev);
        let b = fs.register("null", make_dev(1, 3), 0o666, NodeType::CharDev);
        assert!(b > a);
        assert_eq!(a, DevFs::ROOT_INO + 1);
    }

    #[test]
    fn getdents_walks_dots_then_registration_order() {
        let fs = DevFs::new(5);
        fs.register("hda", make_dev(3, 0), 0o660, NodeType::BlockDev);
        fs.register("hda1", make_dev(3, 1), 0o660, NodeType::BlockDev);
        let root = Node::new(5, DevFs::ROOT_INO);
        fs.read_inode(&root).unwrap();

        let names: Vec<String> = fs
            .getdents(&root, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, alloc::vec![".", "..", "hda", "hda1"]);
    }

    #[test]
    fn finddir_resolves_registered_names() {
        let fs = DevFs::new(5);
        let ino = fs.register("console", make_dev(5, 1), 0o600, NodeType::CharDev);
        let root = Node::new(5, DevFs::ROOT_INO);
        let entry = fs.finddir(&root, "console").unwrap();
        assert_eq!(entry.ino, ino);
        assert_eq!(fs.finddir(&root, "nope").unwrap_err(), Errno::ENOENT);
    }

    struct Echo;
    impl CharDev for Echo {
        fn read(&self, _m: u32, buf: &mut [u8], _nb: bool) -> KResult<usize> {
            for b in buf.iter_mut() {
                *b = b'e';
            }
            Ok(buf.len())
        }
        fn write(&self, _m: u32, buf: &[u8]) -> KResult<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn device_io_dispatches_through_the_switch() {
        let fs = DevFs::new(6);
        register_chardev(250, Arc::new(Echo));
        let ino = fs.register("echo", make_dev(250, 0), 0o666, NodeType::CharDev);
        let node = Node::new(6, ino);
        fs.read_inode(&node).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&node, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"eeee");
        assert_eq!(fs.write(&node, 0, b"hi").unwrap(), 2);
    }
}
