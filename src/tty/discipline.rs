//! The line discipline: raw input bytes become cooked lines, erase and
//! kill editing, EOF handling, and signal generation for the foreground
//! process group.

use alloc::vec::Vec;

use super::queue::TtyQueue;
use super::termios::{
    InputFlags, LocalFlags, Termios, VEOF, VEOL, VERASE, VINTR, VKILL, VQUIT, VSUSP, VWERASE,
};

/// Job-control signals the input stream asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    Interrupt,
    Quit,
    Suspend,
}

#[derive(Default)]
pub struct InputOutcome {
    pub signals: Vec<InputSignal>,
    /// Lines completed during this drain (canonical mode).
    pub new_lines: usize,
    /// Bytes made available in raw mode.
    pub new_bytes: usize,
}

fn echo_byte(termios: &Termios, write_q: &mut TtyQueue, b: u8) {
    if !termios.lflag.contains(LocalFlags::ECHO) {
        return;
    }
    if b < 0x20 && b != b'\n' && b != b'\t' {
        if termios.lflag.contains(LocalFlags::ECHOCTL) {
            write_q.put(b'^');
            write_q.put(b + 0x40);
        }
    } else {
        write_q.put(b);
    }
}

fn echo_erase(termios: &Termios, write_q: &mut TtyQueue) {
    if termios.lflag.contains(LocalFlags::ECHO) && termios.lflag.contains(LocalFlags::ECHOE) {
        write_q.put(0x08);
        write_q.put(b' ');
        write_q.put(0x08);
    }
}

fn is_line_delim(termios: &Termios, b: u8) -> bool {
    b == b'\n' || (termios.cc[VEOL] != 0 && b == termios.cc[VEOL]) || b == termios.cc[VEOF]
}

/// Drain `read_q` into `secondary`, applying the discipline. Echo goes
/// to `write_q`; `delims` counts complete lines sitting in `secondary`.
pub fn copy_to_buf(
    termios: &Termios,
    read_q: &mut TtyQueue,
    secondary: &mut TtyQueue,
    write_q: &mut TtyQueue,
    delims: &mut usize,
) -> InputOutcome {
    let mut outcome = InputOutcome::default();

    while let Some(mut b) = read_q.get() {
        // Input translation first.
        if b == b'\r' {
            if termios.iflag.contains(InputFlags::IGNCR) {
                continue;
            }
            if termios.iflag.contains(InputFlags::ICRNL) {
                b = b'\n';
            }
        } else if b == b'\n' && termios.iflag.contains(InputFlags::INLCR) {
            b = b'\r';
        }

        if termios.lflag.contains(LocalFlags::ISIG) {
            let sig = if b == termios.cc[VINTR] {
                Some(InputSignal::Interrupt)
            } else if b == termios.cc[VQUIT] {
                Some(InputSignal::Quit)
            } else if b == termios.cc[VSUSP] {
                Some(InputSignal::Suspend)
            } else {
                None
            };
            if let Some(sig) = sig {
                outcome.signals.push(sig);
                echo_byte(termios, write_q, b);
                continue;
            }
        }

        if !termios.canonical() {
            if secondary.put(b) {
                outcome.new_bytes += 1;
                echo_byte(termios, write_q, b);
            }
            continue;
        }

        if b == termios.cc[VERASE] && termios.cc[VERASE] != 0 {
            if let Some(last) = secondary.peek_last() {
                if !is_line_delim(termios, last) {
                    secondary.unput();
                    echo_erase(termios, write_q);
                }
            }
            continue;
        }

        if b == termios.cc[VWERASE] && termios.cc[VWERASE] != 0 {
            // Trailing blanks, then the word itself.
            while let Some(last) = secondary.peek_last() {
                if last == b' ' || last == b'\t' {
                    secondary.unput();
                    echo_erase(termios, write_q);
                } else {
                    break;
                }
            }
            while let Some(last) = secondary.peek_last() {
                if last != b' ' && last != b'\t' && !is_line_delim(termios, last) {
                    secondary.unput();
                    echo_erase(termios, write_q);
                } else {
                    break;
                }
            }
            continue;
        }

        if b == termios.cc[VKILL] && termios.cc[VKILL] != 0 {
            while let Some(last) = secondary.peek_last() {
                if is_line_delim(termios, last) {
                    break;
                }
                secondary.unput();
                echo_erase(termios, write_q);
            }
            if termios.lflag.contains(LocalFlags::ECHOK) {
                echo_byte(termios, write_q, b'\n');
            }
            continue;
        }

        if b == termios.cc[VEOF] && termios.cc[VEOF] != 0 {
            // Line ends without the delimiter being delivered; the
            // marker byte is stripped by the reader.
            secondary.put(b);
            *delims += 1;
            outcome.new_lines += 1;
            continue;
        }

        if !secondary.put(b) {
            continue;
        }
        if b == b'\n' || (termios.cc[VEOL] != 0 && b == termios.cc[VEOL]) {
            *delims += 1;
            outcome.new_lines += 1;
        }
        echo_byte(termios, write_q, b);
    }

    outcome
}

/// Pull one cooked line (canonical) or whatever is there (raw) out of
/// `secondary` into `buf`. Returns the byte count; the caller has
/// already ensured data is available.
pub fn cooked_read(
    termios: &Termios,
    secondary: &mut TtyQueue,
    delims: &mut usize,
    buf: &mut [u8],
) -> usize {
    let mut n = 0;

    if !termios.canonical() {
        while n < buf.len() {
            match secondary.get() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        return n;
    }

    while n < buf.len() {
        let b = match secondary.get() {
            Some(b) => b,
            None => break,
        };
        if b == termios.cc[VEOF] && termios.cc[VEOF] != 0 {
            // EOF delimiter: consumed, never delivered.
            *delims = delims.saturating_sub(1);
            break;
        }
        buf[n] = b;
        n += 1;
        if b == b'\n' || (termios.cc[VEOL] != 0 && b == termios.cc[VEOL]) {
            *delims = delims.saturating_sub(1);
            break;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cooked_setup() -> (Termios, TtyQueue, TtyQueue, TtyQueue, usize) {
        (
            Termios::sane(),
            TtyQueue::new(),
            TtyQueue::new(),
            TtyQueue::new(),
            0,
        )
    }

    fn feed(read_q: &mut TtyQueue, bytes: &[u8]) {
        for &b in bytes {
            read_q.put(b);
        }
    }

    /// Scenario: `a b c BS d NL` reads back as `abd\n` — the erase
    /// removed `c`.
    #[test]
    fn canonical_read_with_erase() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"abc\x7Fd\n");
        let out = copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(out.new_lines, 1);
        assert_eq!(delims, 1);

        let mut buf = [0u8; 8];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"abd\n");
        assert_eq!(delims, 0);
    }

    #[test]
    fn read_returns_exactly_one_line() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"one\ntwo\n");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(delims, 2);

        let mut buf = [0u8; 32];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"one\n");
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"two\n");
    }

    #[test]
    fn eof_terminates_without_delivering_the_marker() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"partial\x04");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(delims, 1);

        let mut buf = [0u8; 32];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"partial");
    }

    #[test]
    fn bare_eof_makes_an_empty_read() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"\x04");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(delims, 1);
        let mut buf = [0u8; 8];
        assert_eq!(cooked_read(&t, &mut sec, &mut delims, &mut buf), 0);
    }

    #[test]
    fn kill_erases_the_whole_line() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"doomed\x15ok\n");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        let mut buf = [0u8; 16];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"ok\n");
    }

    #[test]
    fn werase_removes_one_word() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"keep drop\x17\n");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        let mut buf = [0u8; 16];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"keep \n");
    }

    #[test]
    fn erase_cannot_cross_a_completed_line() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"done\n\x7F\x7Fx\n");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        let mut buf = [0u8; 16];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"done\n");
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"x\n");
    }

    #[test]
    fn isig_produces_signals_not_bytes() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"ab\x03cd\x1A\n");
        let out = copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(
            out.signals,
            alloc::vec![InputSignal::Interrupt, InputSignal::Suspend]
        );
        let mut buf = [0u8; 16];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"abcd\n");
    }

    #[test]
    fn isig_off_passes_control_bytes_through() {
        let (mut t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        t.lflag -= LocalFlags::ISIG;
        feed(&mut rq, b"\x03\n");
        let out = copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert!(out.signals.is_empty());
        let mut buf = [0u8; 4];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"\x03\n");
    }

    #[test]
    fn cr_translates_to_nl_with_icrnl() {
        let (t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        feed(&mut rq, b"line\r");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        assert_eq!(delims, 1);
        let mut buf = [0u8; 8];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"line\n");
    }

    #[test]
    fn raw_mode_delivers_bytes_immediately() {
        let (mut t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        t.lflag -= LocalFlags::ICANON;
        feed(&mut rq, b"x\x7Fy");
        let out = copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        // No erase processing: all three bytes arrive.
        assert_eq!(out.new_bytes, 3);
        let mut buf = [0u8; 8];
        let n = cooked_read(&t, &mut sec, &mut delims, &mut buf);
        assert_eq!(&buf[..n], b"x\x7Fy");
    }

    #[test]
    fn echo_visualizes_control_characters() {
        let (mut t, mut rq, mut sec, mut wq, mut delims) = cooked_setup();
        t.lflag -= LocalFlags::ISIG; // let ^C through as input
        feed(&mut rq, b"\x03");
        copy_to_buf(&t, &mut rq, &mut sec, &mut wq, &mut delims);
        let echoed: Vec<u8> = core::iter::from_fn(|| wq.get()).collect();
        assert_eq!(&echoed, b"^C");
    }
}
