//! Dentry cache: node identity to absolute path, for the procfs views
//! (`/proc/<pid>/cwd`, `maps`) that need to print a name for a node.

use alloc::collections::BTreeMap;
use alloc::string::String;

use lazy_static::lazy_static;
use spin::Mutex;

use super::node::{DevId, InodeNum};

lazy_static! {
    static ref DENTRIES: Mutex<BTreeMap<(DevId, InodeNum), String>> =
        Mutex::new(BTreeMap::new());
}

/// Record the path a node was reached by. Last resolution wins; that is
/// good enough for diagnostics.
pub fn remember(dev: DevId, ino: InodeNum, path: &str) {
    DENTRIES.lock().insert((dev, ino), String::from(path));
}

pub fn path_of(dev: DevId, ino: InodeNum) -> Option<String> {
    DENTRIES.lock().get(&(dev, ino)).cloned()
}

/// Unlink/umount invalidation.
pub fn forget(dev: DevId, ino: InodeNum) {
    DENTRIES.lock().remove(&(dev, ino));
}

pub fn forget_dev(dev: DevId) {
    DENTRIES.lock().retain(|(d, _), _| *d != dev);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_forget() {
        remember(9, 42, "/etc/passwd");
        assert_eq!(path_of(9, 42).as_deref(), Some("/etc/passwd"));
        remember(9, 42, "/etc/shadow");
        assert_eq!(path_of(9, 42).as_deref(), Some("/etc/shadow"));
        forget(9, 42);
        assert_eq!(path_of(9, 42), None);
    }
}
