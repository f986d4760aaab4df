pub mod alock;
pub mod dentry;
pub mod devfs;
pub mod fd;
pub mod node;
pub mod pipe;
pub mod procfs;
pub mod tmpfs;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, BlockOutcome, Pid};

use fd::{FileKind, OpenFile, O_ACCMODE, O_APPEND, O_CREAT, O_RDONLY, O_TRUNC};
use node::{make_dev, NodeType};

/// Device numbers for the synthetic filesystems.
pub const TMPFS_DEV: node::DevId = 1;
pub const DEVFS_DEV: node::DevId = 2;
pub const PROCFS_DEV: node::DevId = 3;

static DEVFS: Once<Arc<devfs::DevFs>> = Once::new();

pub fn devfs_instance() -> Option<&'static Arc<devfs::DevFs>> {
    DEVFS.get()
}

/// Mount the boot filesystems: tmpfs at `/`, devfs at `/dev`, procfs at
/// `/proc`; seed the conventional directories.
pub fn init() {
    let root = tmpfs::TmpFs::new(TMPFS_DEV);
    let dev_ino = root.mkdir_at(tmpfs::TmpFs::ROOT_INO, "dev").unwrap_or(0);
    let proc_ino = root.mkdir_at(tmpfs::TmpFs::ROOT_INO, "proc").unwrap_or(0);
    let _ = root.mkdir_at(tmpfs::TmpFs::ROOT_INO, "tmp");
    let _ = root.mkdir_at(tmpfs::TmpFs::ROOT_INO, "etc");
    let _ = root.mkdir_at(tmpfs::TmpFs::ROOT_INO, "bin");

    let devfs_inst = devfs::DevFs::new(DEVFS_DEV);
    let procfs_inst = procfs::ProcFs::new(PROCFS_DEV);

    let mut vfs = vfs::VFS.lock();
    vfs.mount(TMPFS_DEV, tmpfs::TmpFs::ROOT_INO, None, root, "rootfs")
        .expect("root mount cannot fail");
    vfs.mount(
        DEVFS_DEV,
        devfs::DevFs::ROOT_INO,
        Some((TMPFS_DEV, dev_ino)),
        devfs_inst.clone(),
        "devfs",
    )
    .expect("devfs mount cannot fail");
    vfs.mount(
        PROCFS_DEV,
        procfs::ProcFs::ROOT_INO,
        Some((TMPFS_DEV, proc_ino)),
        procfs_inst,
        "procfs",
    )
    .expect("procfs mount cannot fail");
    drop(vfs);

    DEVFS.call_once(|| devfs_inst);
    crate::log_info!("vfs: tmpfs /, devfs /dev, procfs /proc mounted");
}

/// Registered device nodes, for `/proc/devices`.
pub fn registered_devices() -> Vec<(String, node::DevId)> {
    devfs_instance().map(|d| d.nodes()).unwrap_or_default()
}

/// Open a path into an `OpenFile`. `O_CREAT` creates regular files in
/// the containing directory.
pub fn open_file(path: &str, flags: u32) -> KResult<Arc<OpenFile>> {
    let mut vfs = vfs::VFS.lock();
    let node = match vfs.namei(path) {
        Ok(n) => n,
        Err(Errno::ENOENT) if flags & O_CREAT != 0 => {
            let (dir_path, name) = split_path(path)?;
            let dir = vfs.namei(dir_path)?;
            let ops = vfs.ops_for(dir.dev)?;
            let ino = ops.alloc_inode()?;
            if let Err(e) = ops.addir(&dir, name, ino) {
                vfs.release_node(&dir)?;
                return Err(e);
            }
            vfs.release_node(&dir)?;
            vfs.get_node(dir.dev, ino)?
        }
        Err(e) => return Err(e),
    };

    let acc = flags & O_ACCMODE;
    if node.is_dir() && acc != O_RDONLY {
        vfs.release_node(&node)?;
        return Err(Errno::EISDIR);
    }

    if flags & O_TRUNC != 0 && !node.is_dir() {
        vfs.truncate_node(&node, 0)?;
    }

    dentry::remember(node.dev, node.ino, path);

    // Device nodes route to their driver at read/write time; ttys get
    // their own kind so the line discipline sees the traffic.
    let kind = {
        let inner = node.inner.lock();
        match inner.ntype {
            NodeType::CharDev if node::dev_major(inner.rdev) == crate::tty::TTY_MAJOR => {
                FileKind::Tty(node::dev_minor(inner.rdev) as usize)
            }
            _ => FileKind::Node(node.clone()),
        }
    };
    if matches!(kind, FileKind::Tty(_)) {
        vfs.release_node(&node)?;
    }
    drop(vfs);

    let file = OpenFile::new(kind, flags, path);
    if flags & O_APPEND != 0 {
        if let FileKind::Node(n) = &file.kind {
            *file.pos.lock() = n.inner.lock().size;
        }
    }
    Ok(file)
}

fn split_path(path: &str) -> KResult<(&str, &str)> {
    let path = path.trim_end_matches('/');
    let idx = path.rfind('/').ok_or(Errno::EINVAL)?;
    let (dir, name) = path.split_at(idx);
    let name = &name[1..];
    if name.is_empty() {
        return Err(Errno::EINVAL);
    }
    Ok((if dir.is_empty() { "/" } else { dir }, name))
}

/// Read through an open file, advancing its offset. Blocks on empty
/// pipes and ttys per their disciplines.
pub fn file_read(file: &Arc<OpenFile>, buf: &mut [u8]) -> KResult<usize> {
    if !file.readable() {
        return Err(Errno::EBADF);
    }
    match &file.kind {
        FileKind::Node(node) => {
            let ops = vfs::VFS.lock().ops_for(node.dev)?;
            let mut pos = file.pos.lock();
            let n = ops.read(node, *pos, buf)?;
            *pos += n as u64;
            Ok(n)
        }
        FileKind::PipeRead(pipe) => pipe_read(pipe, buf, file.nonblocking()),
        FileKind::PipeWrite(_) => Err(Errno::EBADF),
        FileKind::Tty(minor) => crate::tty::tty_read(*minor, buf, file.nonblocking()),
    }
}

/// Write through an open file.
pub fn file_write(file: &Arc<OpenFile>, buf: &[u8]) -> KResult<usize> {
    if !file.writable() {
        return Err(Errno::EBADF);
    }
    match &file.kind {
        FileKind::Node(node) => {
            let ops = vfs::VFS.lock().ops_for(node.dev)?;
            let mut pos = file.pos.lock();
            if *file.flags.lock() & O_APPEND != 0 {
                *pos = node.inner.lock().size;
            }
            let n = ops.write(node, *pos, buf)?;
            *pos += n as u64;
            Ok(n)
        }
        FileKind::PipeWrite(pipe) => pipe_write(pipe, buf, file.nonblocking()),
        FileKind::PipeRead(_) => Err(Errno::EBADF),
        FileKind::Tty(minor) => crate::tty::tty_write(*minor, buf),
    }
}

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

pub fn file_lseek(file: &Arc<OpenFile>, offset: i64, whence: u32) -> KResult<u64> {
    let node = match &file.kind {
        FileKind::Node(n) => n.clone(),
        _ => return Err(Errno::ESPIPE),
    };
    let mut pos = file.pos.lock();
    let size = node.inner.lock().size;
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => *pos as i64,
        SEEK_END => size as i64,
        _ => return Err(Errno::EINVAL),
    };
    let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
    if target < 0 {
        return Err(Errno::EINVAL);
    }
    *pos = target as u64;
    Ok(*pos)
}

/// Close bookkeeping shared by `close`, exec and exit: drop this pid's
/// advisory locks on the node and release the cache reference when this
/// was the last open-file handle.
pub fn file_closed(file: &Arc<OpenFile>, pid: Pid) {
    if let FileKind::Node(node) = &file.kind {
        let woke = node.alocks.lock().remove_all_for(pid);
        if woke {
            scheduler::wake_all(node.channel());
        }
        // Two strong refs mean: ours plus the fd table slot being
        // dropped; nobody else holds the file.
        if Arc::strong_count(file) <= 2 {
            let _ = vfs::VFS.lock().release_node(node);
        }
    }
    // Pipe endpoint counts adjust in OpenFile::drop; wake both sides so
    // peers notice EOF / EPIPE.
    match &file.kind {
        FileKind::PipeRead(p) | FileKind::PipeWrite(p) => {
            scheduler::wake_all(p.read_channel());
            scheduler::wake_all(p.write_channel());
        }
        _ => {}
    }
}

/// Blocking pipe read: EOF only after the last writer is gone.
fn pipe_read(pipe: &Arc<pipe::Pipe>, buf: &mut [u8], nonblock: bool) -> KResult<usize> {
    loop {
        let n = pipe.read(buf);
        if n > 0 {
            scheduler::wake_all(pipe.write_channel());
            return Ok(n);
        }
        if pipe.writers() == 0 {
            return Ok(0);
        }
        if nonblock {
            return Err(Errno::EAGAIN);
        }
        if scheduler::block_task(pipe.read_channel(), true) == BlockOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

/// Blocking pipe write; a pipe with no readers raises SIGPIPE and
/// returns EPIPE.
fn pipe_write(pipe: &Arc<pipe::Pipe>, buf: &[u8], nonblock: bool) -> KResult<usize> {
    let mut written = 0;
    loop {
        if pipe.readers() == 0 {
            if let Some(cur) = scheduler::current() {
                crate::signals::send_signal(&cur, crate::signals::SIGPIPE, None);
            }
            return Err(Errno::EPIPE);
        }
        written += pipe.write(&buf[written..]);
        if written > 0 {
            scheduler::wake_all(pipe.read_channel());
        }
        if written == buf.len() {
            return Ok(written);
        }
        if nonblock {
            return if written > 0 {
                Ok(written)
            } else {
                Err(Errno::EAGAIN)
            };
        }
        if scheduler::block_task(pipe.write_channel(), true) == BlockOutcome::Interrupted {
            return if written > 0 {
                Ok(written)
            } else {
                Err(Errno::EINTR)
            };
        }
    }
}

/// Create the standard device nodes once the drivers are up.
pub fn populate_dev() {
    if let Some(devfs) = devfs_instance() {
        devfs.register("console", make_dev(crate::tty::TTY_MAJOR, 0), 0o600, NodeType::CharDev);
        devfs.register("tty0", make_dev(crate::tty::TTY_MAJOR, 0), 0o620, NodeType::CharDev);
        devfs.register("tty1", make_dev(crate::tty::TTY_MAJOR, 1), 0o620, NodeType::CharDev);
        devfs.register("null", make_dev(1, 3), 0o666, NodeType::CharDev);
        devfs.register("zero", make_dev(1, 5), 0o666, NodeType::CharDev);
    }
}

/// `/dev/null` and `/dev/zero`.
pub struct MemDev;

impl devfs::CharDev for MemDev {
    fn read(&self, minor: u32, buf: &mut [u8], _nonblock: bool) -> KResult<usize> {
        match minor {
            3 => Ok(0),
            5 => {
                buf.fill(0);
                Ok(buf.len())
            }
            _ => Err(Errno::ENXIO),
        }
    }

    fn write(&self, minor: u32, buf: &[u8]) -> KResult<usize> {
        match minor {
            3 | 5 => Ok(buf.len()),
            _ => Err(Errno::ENXIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_handles_root_and_nested() {
        assert_eq!(split_path("/etc/passwd").unwrap(), ("/etc", "passwd"));
        assert_eq!(split_path("/top").unwrap(), ("/", "top"));
        assert!(split_path("nope").is_err());
    }
}
