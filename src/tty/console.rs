//! Console writer: a VT100/ANSI subset over a cell buffer, mirrored to
//! the VGA text screen for the active tty.
//!
//! CSI parameters land in `par[0..NPAR]`; empty parameters (`;;`) read
//! as zero, matching terminals that treat 0 as "default".

use alloc::vec;
use alloc::vec::Vec;

pub const NPAR: usize = 16;
pub const DEFAULT_ROWS: usize = 25;
pub const DEFAULT_COLS: usize = 80;

const TAB_STOP: usize = 8;

/// One character cell: glyph plus VGA-style attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: u8,
    pub attr: u8,
}

const BLANK: Cell = Cell {
    ch: b' ',
    attr: 0x07,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parser {
    Normal,
    Escape,
    Csi,
    SelectG0,
    SelectG1,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Attrs: u8 {
        const BOLD = 1;
        const UNDERLINE = 2;
        const REVERSE = 4;
    }
}

pub struct Console {
    pub rows: usize,
    pub cols: usize,
    pub cursor_row: usize,
    pub cursor_col: usize,
    fg: u8,
    bg: u8,
    attrs: Attrs,
    pub scroll_top: usize,
    pub scroll_bottom: usize, // inclusive
    pub autowrap: bool,
    pub cursor_visible: bool,
    pub app_keypad: bool,
    pub app_cursor: bool,
    /// VT100 line-drawing set selected as G1 and shifted in.
    g1_active: bool,

    parser: Parser,
    npar: usize,
    par: [u16; NPAR],
    question: bool,

    main: Vec<Cell>,
    alt: Vec<Cell>,
    pub alt_active: bool,
    saved_cursor: Option<(usize, usize, u8, u8, Attrs)>,

    /// Mirror cell stores to the VGA text buffer (active console only).
    pub mirror_vga: bool,
}

impl Console {
    pub fn new(rows: usize, cols: usize) -> Console {
        Console {
            rows,
            cols,
            cursor_row: 0,
            cursor_col: 0,
            fg: 7,
            bg: 0,
            attrs: Attrs::empty(),
            scroll_top: 0,
            scroll_bottom: rows - 1,
            autowrap: true,
            cursor_visible: true,
            app_keypad: false,
            app_cursor: false,
            g1_active: false,
            parser: Parser::Normal,
            npar: 0,
            par: [0; NPAR],
            question: false,
            main: vec![BLANK; rows * cols],
            alt: vec![BLANK; rows * cols],
            alt_active: false,
            saved_cursor: None,
            mirror_vga: false,
        }
    }

    fn buffer(&mut self) -> &mut Vec<Cell> {
        if self.alt_active {
            &mut self.alt
        } else {
            &mut self.main
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        let buf = if self.alt_active { &self.alt } else { &self.main };
        buf[row * self.cols + col]
    }

    /// Row contents as text, for diagnostics and tests.
    pub fn row_text(&self, row: usize) -> Vec<u8> {
        (0..self.cols).map(|c| self.cell(row, c).ch).collect()
    }

    fn attr_byte(&self) -> u8 {
        let (mut fg, mut bg) = (self.fg, self.bg);
        if self.attrs.contains(Attrs::REVERSE) {
            core::mem::swap(&mut fg, &mut bg);
        }
        if self.attrs.contains(Attrs::BOLD) {
            fg |= 8;
        }
        (bg << 4) | (fg & 0x0F)
    }

    fn store(&mut self, row: usize, col: usize, cell: Cell) {
        let cols = self.cols;
        self.buffer()[row * cols + col] = cell;
        self.mirror(row, col, cell);
    }

    #[cfg(not(test))]
    fn mirror(&self, row: usize, col: usize, cell: Cell) {
        if !self.mirror_vga {
            return;
        }
        // VGA text memory through the kernel physical window.
        let base = crate::memory::paging::phys_to_ptr(x86_64::PhysAddr::new(0xB8000))
            as *mut volatile::Volatile<u16>;
        let word = ((cell.attr as u16) << 8) | cell.ch as u16;
        unsafe {
            (*base.add(row * self.cols + col)).write(word);
        }
    }

    #[cfg(test)]
    fn mirror(&self, _row: usize, _col: usize, _cell: Cell) {}

    fn clear_range(&mut self, from: usize, to: usize) {
        for i in from..to {
            let (row, col) = (i / self.cols, i % self.cols);
            self.store(row, col, BLANK);
        }
    }

    /// Copy rows `[top+1 ..= bottom]` up one and blank the bottom row.
    fn scroll_up(&mut self) {
        let cols = self.cols;
        let (top, bottom) = (self.scroll_top, self.scroll_bottom);
        for row in top..bottom {
            for col in 0..cols {
                let below = self.cell(row + 1, col);
                self.store(row, col, below);
            }
        }
        for col in 0..cols {
            self.store(bottom, col, BLANK);
        }
    }

    fn newline(&mut self) {
        if self.cursor_row >= self.scroll_bottom {
            self.scroll_up();
            self.cursor_row = self.scroll_bottom;
        } else {
            self.cursor_row += 1;
        }
    }

    /// Feed one output byte through the state machine.
    pub fn put_byte(&mut self, b: u8) {
        match self.parser {
            Parser::Normal => self.put_normal(b),
            Parser::Escape => self.put_escape(b),
            Parser::Csi => self.put_csi(b),
            Parser::SelectG0 => {
                // 'B' = Latin, '0' = line drawing; tracked, not rendered.
                self.parser = Parser::Normal;
            }
            Parser::SelectG1 => {
                self.g1_active = b == b'0';
                self.parser = Parser::Normal;
            }
        }
    }

    fn put_normal(&mut self, b: u8) {
        match b {
            0x1B => self.parser = Parser::Escape,
            b'\n' => self.newline(),
            b'\r' => self.cursor_col = 0,
            b'\t' => {
                self.cursor_col = ((self.cursor_col / TAB_STOP) + 1) * TAB_STOP;
                if self.cursor_col >= self.cols {
                    self.cursor_col = self.cols - 1;
                }
            }
            0x08 => {
                if self.cursor_col > 0 {
                    self.cursor_col -= 1;
                }
            }
            0x07 => {} // bell
            b if b >= 0x20 => {
                if self.cursor_col >= self.cols {
                    if self.autowrap {
                        self.cursor_col = 0;
                        self.newline();
                    } else {
                        self.cursor_col = self.cols - 1;
                    }
                }
                let cell = Cell {
                    ch: b,
                    attr: self.attr_byte(),
                };
                let (row, col) = (self.cursor_row, self.cursor_col);
                self.store(row, col, cell);
                self.cursor_col += 1;
            }
            _ => {}
        }
    }

    fn put_escape(&mut self, b: u8) {
        match b {
            b'[' => {
                self.parser = Parser::Csi;
                self.npar = 0;
                self.par = [0; NPAR];
                self.question = false;
            }
            b'(' => self.parser = Parser::SelectG0,
            b')' => self.parser = Parser::SelectG1,
            b'7' => {
                self.saved_cursor =
                    Some((self.cursor_row, self.cursor_col, self.fg, self.bg, self.attrs));
                self.parser = Parser::Normal;
            }
            b'8' => {
                if let Some((r, c, fg, bg, attrs)) = self.saved_cursor {
                    self.cursor_row = r.min(self.rows - 1);
                    self.cursor_col = c.min(self.cols - 1);
                    self.fg = fg;
                    self.bg = bg;
                    self.attrs = attrs;
                }
                self.parser = Parser::Normal;
            }
            b'M' => {
                // Reverse linefeed.
                if self.cursor_row == self.scroll_top {
                    self.scroll_down();
                } else {
                    self.cursor_row -= 1;
                }
                self.parser = Parser::Normal;
            }
            _ => self.parser = Parser::Normal,
        }
    }

    fn scroll_down(&mut self) {
        let cols = self.cols;
        let (top, bottom) = (self.scroll_top, self.scroll_bottom);
        for row in (top..bottom).rev() {
            for col in 0..cols {
                let above = self.cell(row, col);
                self.store(row + 1, col, above);
            }
        }
        for col in 0..cols {
            self.store(top, col, BLANK);
        }
    }

    fn put_csi(&mut self, b: u8) {
        match b {
            b'0'..=b'9' => {
                let slot = self.npar.min(NPAR - 1);
                self.par[slot] = self.par[slot].saturating_mul(10) + (b - b'0') as u16;
            }
            b';' => {
                // An empty parameter stays zero.
                if self.npar < NPAR - 1 {
                    self.npar += 1;
                }
            }
            b'?' => self.question = true,
            _ => {
                self.npar += 1;
                self.dispatch_csi(b);
                self.parser = Parser::Normal;
            }
        }
    }

    fn param(&self, i: usize, default: u16) -> u16 {
        let v = self.par.get(i).copied().unwrap_or(0);
        if v == 0 {
            default
        } else {
            v
        }
    }

    fn dispatch_csi(&mut self, cmd: u8) {
        match cmd {
            b'A' => {
                let n = self.param(0, 1) as usize;
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            b'B' => {
                let n = self.param(0, 1) as usize;
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
            }
            b'C' => {
                let n = self.param(0, 1) as usize;
                self.cursor_col = (self.cursor_col + n).min(self.cols - 1);
            }
            b'D' => {
                let n = self.param(0, 1) as usize;
                self.cursor_col = self.cursor_col.saturating_sub(n);
            }
            b'H' | b'f' => {
                let row = self.param(0, 1) as usize;
                let col = self.param(1, 1) as usize;
                self.cursor_row = (row - 1).min(self.rows - 1);
                self.cursor_col = (col - 1).min(self.cols - 1);
            }
            b'J' => {
                let cursor = self.cursor_row * self.cols + self.cursor_col;
                let end = self.rows * self.cols;
                match self.par[0] {
                    0 => self.clear_range(cursor, end),
                    1 => self.clear_range(0, cursor + 1),
                    2 | 3 => {
                        self.clear_range(0, end);
                        self.cursor_row = 0;
                        self.cursor_col = 0;
                    }
                    _ => {}
                }
            }
            b'K' => {
                let row_start = self.cursor_row * self.cols;
                let cursor = row_start + self.cursor_col;
                match self.par[0] {
                    0 => self.clear_range(cursor, row_start + self.cols),
                    1 => self.clear_range(row_start, cursor + 1),
                    2 => self.clear_range(row_start, row_start + self.cols),
                    _ => {}
                }
            }
            b'm' => self.graphic_rendition(),
            b'r' => {
                let top = self.param(0, 1) as usize;
                let bottom = self.param(1, self.rows as u16) as usize;
                if top < bottom && bottom <= self.rows {
                    self.scroll_top = top - 1;
                    self.scroll_bottom = bottom - 1;
                    self.cursor_row = self.scroll_top;
                    self.cursor_col = 0;
                }
            }
            b'h' | b'l' => {
                let set = cmd == b'h';
                if self.question {
                    for i in 0..self.npar {
                        match self.par[i] {
                            1 => self.app_cursor = set,
                            7 => self.autowrap = set,
                            25 => self.cursor_visible = set,
                            47 | 1049 => {
                                if self.alt_active != set {
                                    self.alt_active = set;
                                    if set {
                                        let end = self.rows * self.cols;
                                        self.clear_range(0, end);
                                        self.cursor_row = 0;
                                        self.cursor_col = 0;
                                    }
                                }
                            }
                            66 => self.app_keypad = set,
                            _ => {}
                        }
                    }
                }
            }
            b's' => {
                self.saved_cursor =
                    Some((self.cursor_row, self.cursor_col, self.fg, self.bg, self.attrs));
            }
            b'u' => {
                if let Some((r, c, _, _, _)) = self.saved_cursor {
                    self.cursor_row = r.min(self.rows - 1);
                    self.cursor_col = c.min(self.cols - 1);
                }
            }
            _ => {}
        }
    }

    fn graphic_rendition(&mut self) {
        let count = self.npar.max(1);
        let mut i = 0;
        while i < count {
            match self.par[i] {
                0 => {
                    self.fg = 7;
                    self.bg = 0;
                    self.attrs = Attrs::empty();
                }
                1 => self.attrs |= Attrs::BOLD,
                4 => self.attrs |= Attrs::UNDERLINE,
                7 => self.attrs |= Attrs::REVERSE,
                22 => self.attrs -= Attrs::BOLD,
                24 => self.attrs -= Attrs::UNDERLINE,
                27 => self.attrs -= Attrs::REVERSE,
                30..=37 => self.fg = (self.par[i] - 30) as u8,
                39 => self.fg = 7,
                40..=47 => self.bg = (self.par[i] - 40) as u8,
                49 => self.bg = 0,
                // 256-color select: 38;5;N / 48;5;N, folded to 16.
                38 | 48 => {
                    if i + 2 < NPAR && self.par[i + 1] == 5 {
                        let color = (self.par[i + 2] & 0x0F) as u8;
                        if self.par[i] == 38 {
                            self.fg = color;
                        } else {
                            self.bg = color;
                        }
                        i += 2;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_byte(b);
        }
    }

    /// Push the whole buffer to the mirror (console switch).
    pub fn repaint(&mut self) {
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = self.cell(row, col);
                self.mirror(row, col, cell);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(console: &Console, row: usize, len: usize) -> alloc::string::String {
        let bytes = console.row_text(row);
        alloc::string::String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    #[test]
    fn plain_text_advances_cursor() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"hello");
        assert_eq!(text(&c, 0, 5), "hello");
        assert_eq!((c.cursor_row, c.cursor_col), (0, 5));
    }

    #[test]
    fn newline_and_carriage_return() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"ab\r\ncd");
        assert_eq!(text(&c, 0, 2), "ab");
        assert_eq!(text(&c, 1, 2), "cd");
    }

    #[test]
    fn cursor_movement_with_defaults_and_params() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[5;10H");
        assert_eq!((c.cursor_row, c.cursor_col), (4, 9));
        c.write_bytes(b"\x1b[2A\x1b[3C\x1b[B\x1b[D");
        assert_eq!((c.cursor_row, c.cursor_col), (3, 11));
        // Empty params mean 1: ESC[H homes.
        c.write_bytes(b"\x1b[H");
        assert_eq!((c.cursor_row, c.cursor_col), (0, 0));
    }

    #[test]
    fn empty_csi_parameters_are_tolerated() {
        let mut c = Console::new(25, 80);
        // ESC[;5H — missing row parameter defaults to 1.
        c.write_bytes(b"\x1b[;5H");
        assert_eq!((c.cursor_row, c.cursor_col), (0, 4));
    }

    #[test]
    fn erase_line_modes() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"0123456789");
        c.write_bytes(b"\x1b[5G"); // unknown final byte: ignored
        c.cursor_col = 5;
        c.write_bytes(b"\x1b[K");
        assert_eq!(text(&c, 0, 10), "01234     ");

        c.write_bytes(b"\x1b[2K");
        assert_eq!(text(&c, 0, 10), "          ");
    }

    #[test]
    fn erase_display_to_end() {
        let mut c = Console::new(4, 4);
        c.write_bytes(b"aaaa\r\nbbbb\r\ncccc");
        c.cursor_row = 1;
        c.cursor_col = 2;
        c.write_bytes(b"\x1b[0J");
        assert_eq!(text(&c, 1, 4), "bb  ");
        assert_eq!(text(&c, 2, 4), "    ");
        assert_eq!(text(&c, 0, 4), "aaaa");
    }

    #[test]
    fn full_clear_homes_cursor() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"junk\x1b[2J");
        assert_eq!((c.cursor_row, c.cursor_col), (0, 0));
        assert_eq!(text(&c, 0, 4), "    ");
    }

    #[test]
    fn scrolling_past_bottom_moves_rows_up() {
        let mut c = Console::new(3, 8);
        c.write_bytes(b"one\r\ntwo\r\nthree\r\nfour");
        // "one" scrolled off; rows now two/three/four.
        assert_eq!(text(&c, 0, 3), "two");
        assert_eq!(text(&c, 1, 5), "three");
        assert_eq!(text(&c, 2, 4), "four");
    }

    #[test]
    fn scroll_region_bounds_scrolling() {
        let mut c = Console::new(5, 8);
        c.write_bytes(b"head\r\n");
        c.write_bytes(b"\x1b[2;4r"); // rows 1..3 scroll, row 0 pinned
        c.write_bytes(b"a\r\nb\r\nc\r\nd\r\ne");
        assert_eq!(text(&c, 0, 4), "head");
        // Rows within the region rolled; the last writes stay inside.
        assert_eq!(c.scroll_top, 1);
        assert_eq!(c.scroll_bottom, 3);
        assert_eq!(text(&c, 4, 4), "    ");
    }

    #[test]
    fn autowrap_wraps_and_can_be_disabled() {
        let mut c = Console::new(3, 4);
        c.write_bytes(b"abcdef");
        assert_eq!(text(&c, 0, 4), "abcd");
        assert_eq!(text(&c, 1, 2), "ef");

        let mut c2 = Console::new(3, 4);
        c2.write_bytes(b"\x1b[?7l");
        c2.write_bytes(b"abcdef");
        // Without autowrap the last column keeps being overwritten.
        assert_eq!(text(&c2, 0, 4), "abcf");
        assert_eq!(c2.cursor_row, 0);
    }

    #[test]
    fn sgr_colors_and_reset() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[1;31;44mX");
        let cell = c.cell(0, 0);
        // bold red on blue: fg 1|8, bg 4.
        assert_eq!(cell.attr, (4 << 4) | (1 | 8));
        c.write_bytes(b"\x1b[0mY");
        assert_eq!(c.cell(0, 1).attr, 0x07);
    }

    #[test]
    fn sgr_reverse_swaps_colors() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[31;7mZ");
        // reverse of red-on-black is black-on-red.
        assert_eq!(c.cell(0, 0).attr, 1 << 4);
    }

    #[test]
    fn sgr_256_color_folds_into_16() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[38;5;12mQ");
        assert_eq!(c.cell(0, 0).attr & 0x0F, 12);
    }

    #[test]
    fn alt_buffer_switch_preserves_main() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"main text");
        c.write_bytes(b"\x1b[?1049h");
        assert!(c.alt_active);
        c.write_bytes(b"alt");
        assert_eq!(text(&c, 0, 3), "alt");
        c.write_bytes(b"\x1b[?1049l");
        assert!(!c.alt_active);
        assert_eq!(text(&c, 0, 9), "main text");
    }

    #[test]
    fn mode_set_reset_private_flags() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[?25l");
        assert!(!c.cursor_visible);
        c.write_bytes(b"\x1b[?25h");
        assert!(c.cursor_visible);
        c.write_bytes(b"\x1b[?1h");
        assert!(c.app_cursor);
    }

    #[test]
    fn save_restore_cursor() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b[10;20H\x1b7\x1b[H");
        assert_eq!((c.cursor_row, c.cursor_col), (0, 0));
        c.write_bytes(b"\x1b8");
        assert_eq!((c.cursor_row, c.cursor_col), (9, 19));
    }

    #[test]
    fn tab_advances_to_next_stop() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"ab\tx");
        assert_eq!(c.cell(0, 8).ch, b'x');
    }

    #[test]
    fn charset_selection_is_parsed() {
        let mut c = Console::new(25, 80);
        c.write_bytes(b"\x1b)0\x1b(Bok");
        assert_eq!(text(&c, 0, 2), "ok");
    }
}
