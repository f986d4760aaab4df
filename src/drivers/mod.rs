pub mod keyboard;
pub mod sound;

use alloc::sync::Arc;

/// Major number for the audio device.
pub const SOUND_MAJOR: u32 = 14;

/// Bring up the platform drivers and their device nodes.
pub fn init() {
    keyboard::init();
    crate::fs::devfs::register_chardev(1, Arc::new(crate::fs::MemDev));
    crate::fs::devfs::register_chardev(crate::tty::TTY_MAJOR, Arc::new(TtyDev));
    crate::fs::devfs::register_chardev(SOUND_MAJOR, sound::SOUND.clone());
    crate::fs::populate_dev();
    if let Some(devfs) = crate::fs::devfs_instance() {
        devfs.register(
            "audio",
            crate::fs::node::make_dev(SOUND_MAJOR, 0),
            0o666,
            crate::fs::node::NodeType::CharDev,
        );
    }
}

/// Adapter putting the tty table behind the char-device switch.
pub struct TtyDev;

impl crate::fs::devfs::CharDev for TtyDev {
    fn read(&self, minor: u32, buf: &mut [u8], nonblock: bool) -> crate::errno::KResult<usize> {
        crate::tty::tty_read(minor as usize, buf, nonblock)
    }

    fn write(&self, minor: u32, buf: &[u8]) -> crate::errno::KResult<usize> {
        crate::tty::tty_write(minor as usize, buf)
    }

    fn can_read(&self, minor: u32) -> bool {
        crate::tty::tty_can_read(minor as usize)
    }

    fn can_write(&self, minor: u32) -> bool {
        crate::tty::tty_can_write(minor as usize)
    }
}
