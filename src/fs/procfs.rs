//! procfs: text views over kernel state.
//!
//! Inode numbers pack `(dir_class, subdir_class, id)` into bit-fields,
//! so a node stands alone without a backing object. Files are produced
//! by content generators on every read; `pos` indexes into the
//! generated buffer.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bit_field::BitField;

use crate::errno::{Errno, KResult};
use crate::scheduler::{self, TaskState};

use super::node::{DevId, DirEntry, FsOps, InodeNum, Node, NodeType};

// dir_class values.
const DIR_ROOT: u64 = 1;
const DIR_NET: u64 = 2;
const DIR_SYS: u64 = 3;
const DIR_TTY: u64 = 4;
const DIR_BUS_PCI: u64 = 5;
const DIR_PID: u64 = 6;

// file ids under the root.
const F_VERSION: u64 = 1;
const F_UPTIME: u64 = 2;
const F_MEMINFO: u64 = 3;
const F_STAT: u64 = 4;
const F_MOUNTS: u64 = 5;
const F_DEVICES: u64 = 6;
const F_FILESYSTEMS: u64 = 7;
const F_INTERRUPTS: u64 = 8;
const F_MODULES: u64 = 9;
const F_KSYMS: u64 = 10;

// file ids under net/.
const F_NET_ARP: u64 = 1;
const F_NET_RESOLV: u64 = 2;

// file ids under bus/pci/.
const F_PCI_DEVICES: u64 = 1;

// per-pid subdir_class values (0 = the directory itself).
const PF_STAT: u64 = 1;
const PF_STATM: u64 = 2;
const PF_STATUS: u64 = 3;
const PF_MAPS: u64 = 4;
const PF_LIMITS: u64 = 5;
const PF_TIMERS: u64 = 6;
const PF_IO: u64 = 7;

/// Pack `(dir_class, subdir_class, id)` into an inode number.
pub fn encode_ino(dir: u64, sub: u64, id: u64) -> InodeNum {
    let mut ino = 0u64;
    ino.set_bits(28..36, dir);
    ino.set_bits(20..28, sub);
    ino.set_bits(0..20, id);
    ino
}

pub fn decode_ino(ino: InodeNum) -> (u64, u64, u64) {
    (ino.get_bits(28..36), ino.get_bits(20..28), ino.get_bits(0..20))
}

pub struct ProcFs {
    pub dev: DevId,
}

impl ProcFs {
    pub const ROOT_INO: InodeNum = 0x1000_0000; // encode(DIR_ROOT, 0, 0)

    pub fn new(dev: DevId) -> Arc<ProcFs> {
        Arc::new(ProcFs { dev })
    }

    fn generate(&self, ino: InodeNum) -> KResult<String> {
        let (dir, sub, id) = decode_ino(ino);
        match dir {
            DIR_ROOT => generate_root_file(id),
            DIR_NET => generate_net_file(id),
            DIR_BUS_PCI => generate_pci_file(id),
            DIR_PID => generate_pid_file(id as i32, sub),
            _ => Err(Errno::ENOENT),
        }
    }

    fn is_directory(ino: InodeNum) -> bool {
        let (dir, sub, id) = decode_ino(ino);
        match dir {
            DIR_ROOT => id == 0,
            DIR_NET | DIR_SYS | DIR_TTY | DIR_BUS_PCI => id == 0,
            DIR_PID => sub == 0,
            _ => false,
        }
    }
}

fn root_files() -> &'static [(&'static str, u64)] {
    &[
        ("version", F_VERSION),
        ("uptime", F_UPTIME),
        ("meminfo", F_MEMINFO),
        ("stat", F_STAT),
        ("mounts", F_MOUNTS),
        ("devices", F_DEVICES),
        ("filesystems", F_FILESYSTEMS),
        ("interrupts", F_INTERRUPTS),
        ("modules", F_MODULES),
        ("ksyms", F_KSYMS),
    ]
}

fn pid_files() -> &'static [(&'static str, u64)] {
    &[
        ("stat", PF_STAT),
        ("statm", PF_STATM),
        ("status", PF_STATUS),
        ("maps", PF_MAPS),
        ("limits", PF_LIMITS),
        ("timers", PF_TIMERS),
        ("io", PF_IO),
    ]
}

fn generate_root_file(id: u64) -> KResult<String> {
    match id {
        F_VERSION => Ok(format!(
            "Argon version {} (rustc) #1 SMP\n",
            env!("CARGO_PKG_VERSION")
        )),
        F_UPTIME => {
            let secs = crate::time::seconds();
            Ok(format!("{}.{:02} {}.00\n", secs, 0, secs))
        }
        F_MEMINFO => {
            let (used, free, heap_used, heap_total) = crate::memory::meminfo();
            let page_kib = crate::memory::PAGE_SIZE / 1024;
            Ok(format!(
                "MemTotal: {:>10} kB\nMemFree: {:>11} kB\nKernelHeapTotal: {:>6} kB\nKernelHeapUsed: {:>7} kB\n",
                (used + free) as u64 * page_kib,
                free as u64 * page_kib,
                heap_total / 1024,
                heap_used / 1024,
            ))
        }
        F_STAT => {
            let mut out = format!("ticks {}\n", crate::time::ticks());
            let tasks = scheduler::list_tasks();
            let running = tasks
                .iter()
                .filter(|(_, _, s)| *s == TaskState::Running)
                .count();
            out.push_str(&format!(
                "procs_total {}\nprocs_running {}\n",
                tasks.len(),
                running
            ));
            Ok(out)
        }
        F_MOUNTS => {
            let vfs = super::vfs::VFS.lock();
            let mut out = String::new();
            for m in vfs.mounts() {
                out.push_str(&format!(
                    "{} dev{} {} rw 0 0\n",
                    m.source,
                    m.dev,
                    m.ops.name()
                ));
            }
            Ok(out)
        }
        F_DEVICES => {
            let mut out = String::from("Character devices:\n");
            for (name, rdev) in super::registered_devices() {
                out.push_str(&format!(
                    "{:>4} {}\n",
                    super::node::dev_major(rdev),
                    name
                ));
            }
            Ok(out)
        }
        F_FILESYSTEMS => Ok(String::from(
            "nodev\ttmpfs\nnodev\tdevfs\nnodev\tprocfs\nnodev\tpipefs\n",
        )),
        F_INTERRUPTS => Ok(crate::interrupts::interrupt_counts()),
        F_MODULES => Ok(String::new()),
        F_KSYMS => Ok(String::new()),
        _ => Err(Errno::ENOENT),
    }
}

fn generate_net_file(id: u64) -> KResult<String> {
    match id {
        F_NET_ARP => {
            let mut out =
                String::from("IP address       HW type     Flags       HW address            Device\n");
            for entry in crate::net::arp::entries_snapshot() {
                out.push_str(&format!(
                    "{:<16} 0x1         0x2         {:<21} {}\n",
                    entry.0, entry.1, entry.2
                ));
            }
            Ok(out)
        }
        F_NET_RESOLV => Ok(String::from("nameserver 0.0.0.0\n")),
        _ => Err(Errno::ENOENT),
    }
}

fn generate_pci_file(id: u64) -> KResult<String> {
    match id {
        F_PCI_DEVICES => {
            let mut out = String::new();
            for dev in crate::pci::devices_snapshot() {
                out.push_str(&format!(
                    "{:02x}{:02x}\t{:04x}{:04x}\t{:x}\n",
                    dev.bus, dev.slot, dev.vendor, dev.device, dev.irq_line
                ));
            }
            Ok(out)
        }
        _ => Err(Errno::ENOENT),
    }
}

fn generate_pid_file(pid: i32, sub: u64) -> KResult<String> {
    let task = scheduler::task_by_pid(pid).ok_or(Errno::ENOENT)?;
    let name = task.name.lock().clone();
    match sub {
        PF_STAT => {
            let (state_ch, ppid, pgid, sid) = {
                let s = match task.state() {
                    TaskState::Running => 'R',
                    TaskState::Ready => 'R',
                    TaskState::Sleeping => 'S',
                    TaskState::Waiting => 'D',
                    TaskState::Stopped => 'T',
                    TaskState::Zombie => 'Z',
                };
                let ids = task.ids.lock();
                (s, ids.parent, ids.pgid, ids.sid)
            };
            Ok(format!(
                "{} ({}) {} {} {} {}\n",
                pid, name, state_ch, ppid, pgid, sid
            ))
        }
        PF_STATM => {
            let pages = task
                .user
                .lock()
                .as_ref()
                .map(|u| {
                    u.mem
                        .lock()
                        .regions
                        .iter()
                        .map(|r| r.pages())
                        .sum::<u64>()
                })
                .unwrap_or(0);
            Ok(format!("{} {} 0 0 0 0 0\n", pages, pages))
        }
        PF_STATUS => {
            let creds = *task.creds.lock();
            let signals = task.signals.lock();
            Ok(format!(
                "Name:\t{}\nState:\t{:?}\nPid:\t{}\nUid:\t{} {}\nGid:\t{} {}\nSigPnd:\t{:08x}\nSigBlk:\t{:08x}\n",
                name,
                task.state(),
                pid,
                creds.uid,
                creds.euid,
                creds.gid,
                creds.egid,
                signals.pending,
                signals.blocked,
            ))
        }
        PF_MAPS => {
            let mut out = String::new();
            if let Some(user) = task.user.lock().as_ref() {
                for r in &user.mem.lock().regions {
                    let prot = r.prot;
                    out.push_str(&format!(
                        "{:016x}-{:016x} {}{}{}p {:08x}\n",
                        r.start,
                        r.end,
                        if prot.contains(crate::memory::memregion::Prot::READ) { 'r' } else { '-' },
                        if prot.contains(crate::memory::memregion::Prot::WRITE) { 'w' } else { '-' },
                        if prot.contains(crate::memory::memregion::Prot::EXEC) { 'x' } else { '-' },
                        r.file_off,
                    ));
                }
            }
            Ok(out)
        }
        PF_LIMITS => Ok(String::from(
            "Limit                     Soft Limit           Hard Limit\nMax stack size            8388608              unlimited\nMax open files            64                   64\n",
        )),
        PF_TIMERS => {
            let timers = task.timers.lock();
            let mut out = String::new();
            for t in &timers.posix {
                out.push_str(&format!(
                    "ID: {} signal: {} overrun: {}\n",
                    t.id, t.signo, t.overrun
                ));
            }
            Ok(out)
        }
        PF_IO => Ok(String::from(
            "rchar: 0\nwchar: 0\nsyscr: 0\nsyscw: 0\n",
        )),
        _ => Err(Errno::ENOENT),
    }
}

impl FsOps for ProcFs {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn read_inode(&self, node: &Node) -> KResult<()> {
        let mut inner = node.inner.lock();
        if Self::is_directory(node.ino) {
            inner.ntype = NodeType::Directory;
            inner.mode = 0o555;
            inner.links = 2;
        } else {
            // Generated on demand; size is unknowable up front.
            inner.ntype = NodeType::Regular;
            inner.mode = 0o444;
            inner.links = 1;
        }
        Ok(())
    }

    fn read(&self, node: &Node, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let text = self.generate(node.ino)?;
        let bytes = text.as_bytes();
        let off = off as usize;
        if off >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - off);
        buf[..n].copy_from_slice(&bytes[off..off + n]);
        Ok(n)
    }

    fn finddir(&self, dir: &Node, name: &str) -> KResult<DirEntry> {
        let (dclass, _sub, _id) = decode_ino(dir.ino);
        match dclass {
            DIR_ROOT => {
                if let Some((_, id)) = root_files().iter().find(|(n, _)| *n == name) {
                    return Ok(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_ROOT, 0, *id),
                        ntype: NodeType::Regular,
                    });
                }
                match name {
                    "net" => Ok(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_NET, 0, 0),
                        ntype: NodeType::Directory,
                    }),
                    "sys" => Ok(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_SYS, 0, 0),
                        ntype: NodeType::Directory,
                    }),
                    "tty" => Ok(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_TTY, 0, 0),
                        ntype: NodeType::Directory,
                    }),
                    "bus" => Ok(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_BUS_PCI, 0, 0),
                        ntype: NodeType::Directory,
                    }),
                    _ => {
                        let pid: i32 = name.parse().map_err(|_| Errno::ENOENT)?;
                        scheduler::task_by_pid(pid).ok_or(Errno::ENOENT)?;
                        Ok(DirEntry {
                            name: String::from(name),
                            ino: encode_ino(DIR_PID, 0, pid as u64),
                            ntype: NodeType::Directory,
                        })
                    }
                }
            }
            DIR_NET => {
                let id = match name {
                    "arp" => F_NET_ARP,
                    "resolv.conf" => F_NET_RESOLV,
                    _ => return Err(Errno::ENOENT),
                };
                Ok(DirEntry {
                    name: String::from(name),
                    ino: encode_ino(DIR_NET, 0, id),
                    ntype: NodeType::Regular,
                })
            }
            DIR_BUS_PCI => match name {
                "pci" | "devices" => Ok(DirEntry {
                    name: String::from(name),
                    ino: encode_ino(DIR_BUS_PCI, 0, F_PCI_DEVICES),
                    ntype: NodeType::Regular,
                }),
                _ => Err(Errno::ENOENT),
            },
            DIR_PID => {
                let (_, _, pid) = decode_ino(dir.ino);
                let sub = pid_files()
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, s)| *s)
                    .ok_or(Errno::ENOENT)?;
                Ok(DirEntry {
                    name: String::from(name),
                    ino: encode_ino(DIR_PID, sub, pid),
                    ntype: NodeType::Regular,
                })
            }
            _ => Err(Errno::ENOENT),
        }
    }

    fn getdents(&self, dir: &Node, pos: usize) -> KResult<Vec<DirEntry>> {
        let (dclass, _sub, _) = decode_ino(dir.ino);
        let mut entries: Vec<DirEntry> = Vec::new();
        match dclass {
            DIR_ROOT => {
                for (name, id) in root_files() {
                    entries.push(DirEntry {
                        name: String::from(*name),
                        ino: encode_ino(DIR_ROOT, 0, *id),
                        ntype: NodeType::Regular,
                    });
                }
                for name in ["net", "sys", "tty", "bus"] {
                    entries.push(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(
                            match name {
                                "net" => DIR_NET,
                                "sys" => DIR_SYS,
                                "tty" => DIR_TTY,
                                _ => DIR_BUS_PCI,
                            },
                            0,
                            0,
                        ),
                        ntype: NodeType::Directory,
                    });
                }
                for (pid, _, _) in scheduler::list_tasks() {
                    entries.push(DirEntry {
                        name: format!("{}", pid),
                        ino: encode_ino(DIR_PID, 0, pid as u64),
                        ntype: NodeType::Directory,
                    });
                }
            }
            DIR_NET => {
                for (name, id) in [("arp", F_NET_ARP), ("resolv.conf", F_NET_RESOLV)] {
                    entries.push(DirEntry {
                        name: String::from(name),
                        ino: encode_ino(DIR_NET, 0, id),
                        ntype: NodeType::Regular,
                    });
                }
            }
            DIR_BUS_PCI => {
                entries.push(DirEntry {
                    name: String::from("devices"),
                    ino: encode_ino(DIR_BUS_PCI, 0, F_PCI_DEVICES),
                    ntype: NodeType::Regular,
                });
            }
            DIR_PID => {
                let (_, _, pid) = decode_ino(dir.ino);
                for (name, sub) in pid_files() {
                    entries.push(DirEntry {
                        name: String::from(*name),
                        ino: encode_ino(DIR_PID, *sub, pid),
                        ntype: NodeType::Regular,
                    });
                }
            }
            _ => {}
        }
        Ok(super::vfs::dents_with_dots(dir, entries, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_encoding_roundtrips() {
        let ino = encode_ino(DIR_PID, PF_MAPS, 4321);
        assert_eq!(decode_ino(ino), (DIR_PID, PF_MAPS, 4321));
        // Fields do not bleed into each other.
        let ino2 = encode_ino(DIR_NET, 0, F_NET_ARP);
        assert_ne!(ino, ino2);
        assert_eq!(decode_ino(ino2), (DIR_NET, 0, F_NET_ARP));
    }

    #[test]
    fn root_ino_is_a_directory() {
        assert!(ProcFs::is_directory(ProcFs::ROOT_INO));
        assert!(!ProcFs::is_directory(encode_ino(DIR_ROOT, 0, F_VERSION)));
        assert!(ProcFs::is_directory(encode_ino(DIR_PID, 0, 77)));
        assert!(!ProcFs::is_directory(encode_ino(DIR_PID, PF_STAT, 77)));
    }

    #[test]
    fn version_file_generates_text() {
        let fs = ProcFs::new(3);
        let node = Node::new(3, encode_ino(DIR_ROOT, 0, F_VERSION));
        fs.read_inode(&node).unwrap();
        let mut buf = [0u8; 64];
        let n = fs.read(&node, 0, &mut buf).unwrap();
        let text = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("Argon version"));

        // pos indexes into the same generated buffer.
        let mut tail = [0u8; 64];
        let m = fs.read(&node, 6, &mut tail).unwrap();
        assert_eq!(&buf[6..n], &tail[..m]);
    }

    #[test]
    fn pid_stat_reflects_a_live_task() {
        let task = crate::scheduler::new_task("proctest", false, 4);
        crate::scheduler::TASK_TABLE
            .lock()
            .insert(task.pid, task.clone());

        let fs = ProcFs::new(3);
        let root = Node::new(3, ProcFs::ROOT_INO);
        let entry = fs.finddir(&root, &alloc::format!("{}", task.pid)).unwrap();
        assert_eq!(entry.ntype, NodeType::Directory);

        let stat_ino = encode_ino(DIR_PID, PF_STAT, task.pid as u64);
        let node = Node::new(3, stat_ino);
        let mut buf = [0u8; 128];
        let n = fs.read(&node, 0, &mut buf).unwrap();
        let text = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.contains("(proctest)"));

        crate::scheduler::TASK_TABLE.lock().remove(&task.pid);
    }

    #[test]
    fn missing_pid_is_enoent() {
        let fs = ProcFs::new(3);
        let root = Node::new(3, ProcFs::ROOT_INO);
        assert_eq!(fs.finddir(&root, "999999").unwrap_err(), Errno::ENOENT);
        assert_eq!(fs.finddir(&root, "bogus").unwrap_err(), Errno::ENOENT);
    }
}
