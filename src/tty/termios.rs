//! Terminal attributes: the `termios` flag words and control
//! characters.

pub const NCCS: usize = 19;

// Control-character indices.
pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VTIME: usize = 5;
pub const VMIN: usize = 6;
pub const VSUSP: usize = 10;
pub const VEOL: usize = 11;
pub const VWERASE: usize = 14;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        /// CR on input becomes NL.
        const ICRNL = 0o400;
        /// Ignore CR.
        const IGNCR = 0o200;
        /// NL on input becomes CR.
        const INLCR = 0o100;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        /// Output post-processing on.
        const OPOST = 0o1;
        /// NL on output becomes CR-NL.
        const ONLCR = 0o4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        /// Generate signals from VINTR/VQUIT/VSUSP.
        const ISIG = 0o1;
        /// Canonical (line-cooked) input.
        const ICANON = 0o2;
        /// Echo input.
        const ECHO = 0o10;
        /// Echo erase as BS-SP-BS.
        const ECHOE = 0o20;
        /// Echo NL after VKILL.
        const ECHOK = 0o40;
        /// Echo control characters as ^X.
        const ECHOCTL = 0o1000;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Termios {
    pub iflag: InputFlags,
    pub oflag: OutputFlags,
    pub lflag: LocalFlags,
    pub cc: [u8; NCCS],
}

impl Termios {
    /// The boot defaults: cooked, echoing, signal-generating.
    pub fn sane() -> Self {
        let mut cc = [0u8; NCCS];
        cc[VINTR] = 0x03; // ^C
        cc[VQUIT] = 0x1C; // ^\
        cc[VERASE] = 0x7F;
        cc[VKILL] = 0x15; // ^U
        cc[VEOF] = 0x04; // ^D
        cc[VSUSP] = 0x1A; // ^Z
        cc[VWERASE] = 0x17; // ^W
        cc[VEOL] = 0;
        cc[VMIN] = 1;
        Termios {
            iflag: InputFlags::ICRNL,
            oflag: OutputFlags::OPOST | OutputFlags::ONLCR,
            lflag: LocalFlags::ISIG
                | LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK
                | LocalFlags::ECHOCTL,
            cc,
        }
    }

    pub fn canonical(&self) -> bool {
        self.lflag.contains(LocalFlags::ICANON)
    }
}
