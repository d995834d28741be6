//! Cutting a drawable text window out of the scrollback.
//!
//! The renderer only ever sees plain, printable ASCII lines. Output is read
//! from `scroll_tail` forward; long lines wrap onto the next row and a few
//! editing control bytes are applied instead of drawn.

use crate::ring::RingBuffer;

/// Drawn in place of bytes that have no printable form.
pub const DEFAULT_PLACEHOLDER: u8 = b'?';

const TAB_WIDTH: usize = 8;

/// Scanned bytes per visible cell before extraction gives up.
const SCAN_BUDGET_PER_CELL: usize = 4;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// Pixel metrics handed over by the font/render stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Empty border on every side of the window.
    pub padding: u32,
    /// Horizontal advance of one monospace glyph.
    pub advance: u32,
    /// Vertical distance between baselines.
    pub line_height: u32,
}

impl Layout {
    /// How many character cells fit in a `width` x `height` pixel window.
    pub fn viewport(&self, width: u32, height: u32) -> Viewport {
        let inner = |size: u32, step: u32| -> usize {
            let border = self.padding.saturating_mul(2);
            if step == 0 || border.saturating_add(step) >= size {
                return 0;
            }
            ((size - border) / step) as usize
        };
        Viewport {
            cols: inner(width, self.advance),
            rows: inner(height, self.line_height),
        }
    }
}

/// Size of the visible text area in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub cols: usize,
    pub rows: usize,
}

impl Viewport {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self { cols, rows }
    }

    /// Extract the visible window of `ring` at this size.
    pub fn extract(&self, ring: &RingBuffer, placeholder: u8) -> Vec<String> {
        extract_window(ring, self.cols, self.rows, placeholder)
    }

    /// Place `scroll_tail` so the window's last row holds the newest output.
    ///
    /// Counts display rows, not logical lines: a wrapped line takes as many
    /// rows as [`extract_window`] gives it, and the window may start part way
    /// into a long line.
    pub fn scroll_to_bottom(&self, ring: &mut RingBuffer) {
        if self.cols == 0 || self.rows == 0 {
            ring.scroll_to_bottom(0);
            return;
        }

        let head = ring.head();
        let mut start = ring.line_start(head);
        let mut rows = self.rows_between(ring, start, head);
        while rows < self.rows {
            let Some(previous) = ring.previous_line_start(start) else {
                break;
            };
            rows += self.rows_between(ring, previous, start);
            start = previous;
        }

        let skip = rows.saturating_sub(self.rows);
        let anchor = self.wrapped_row_start(ring, start, head, skip);
        ring.set_scroll_tail(anchor);
    }

    /// Whether everything from `scroll_tail` to `head` fits in the window.
    pub fn shows_bottom(&self, ring: &RingBuffer) -> bool {
        if self.cols == 0 {
            return ring.scroll_tail() == ring.head();
        }
        let mut counter = RowCounter::new(self.cols);
        for (_, byte) in ring.bytes_between(ring.scroll_tail(), ring.head()) {
            counter.feed(byte);
            if counter.rows > self.rows {
                return false;
            }
        }
        counter.total() <= self.rows
    }

    fn rows_between(&self, ring: &RingBuffer, from: usize, to: usize) -> usize {
        let mut counter = RowCounter::new(self.cols);
        for (_, byte) in ring.bytes_between(from, to) {
            counter.feed(byte);
        }
        counter.total()
    }

    /// Position of the byte that opens wrapped row `skip` of the line at `from`.
    fn wrapped_row_start(&self, ring: &RingBuffer, from: usize, to: usize, skip: usize) -> usize {
        if skip == 0 {
            return from;
        }
        let mut counter = RowCounter::new(self.cols);
        let mut row = 0;
        for (pos, byte) in ring.bytes_between(from, to) {
            if counter.feed(byte) {
                row += 1;
                if row == skip {
                    return pos;
                }
            }
        }
        from
    }
}

/// Row bookkeeping that mirrors how [`extract_window`] lays bytes out.
struct RowCounter {
    width: usize,
    /// Cells used on the current row.
    col: usize,
    /// Rows already finished.
    rows: usize,
}

impl RowCounter {
    fn new(width: usize) -> Self {
        Self {
            width,
            col: 0,
            rows: 0,
        }
    }

    /// Account for `byte`. Returns `true` when it wraps onto a new row.
    fn feed(&mut self, byte: u8) -> bool {
        match byte {
            b'\n' => {
                self.rows += 1;
                self.col = 0;
            }
            b'\r' => {}
            BACKSPACE | DELETE => self.col = self.col.saturating_sub(1),
            b'\t' => {
                let stop = ((self.col / TAB_WIDTH + 1) * TAB_WIDTH).min(self.width);
                self.col = self.col.max(stop);
            }
            _ if self.col == self.width => {
                self.rows += 1;
                self.col = 1;
                return true;
            }
            _ => self.col += 1,
        }
        false
    }

    /// Rows including a non-empty row still being filled.
    fn total(&self) -> usize {
        self.rows + usize::from(self.col > 0)
    }
}

/// Copy lines out of `ring` starting at its `scroll_tail`.
///
/// Returns at most `max_height` lines of at most `max_width` printable bytes
/// each. `\n` ends a line, `\r` is ignored, backspace and DEL erase the
/// previous byte of the current line, tabs expand to the next tab stop, and
/// every other non-printable byte becomes `placeholder`.
///
/// Work is bounded by the window size rather than the buffer size.
pub fn extract_window(
    ring: &RingBuffer,
    max_width: usize,
    max_height: usize,
    placeholder: u8,
) -> Vec<String> {
    let mut window = WindowBuilder::new(max_width, max_height);
    if window.is_full() {
        return window.lines;
    }

    let placeholder = if placeholder.is_ascii_graphic() || placeholder == b' ' {
        placeholder as char
    } else {
        DEFAULT_PLACEHOLDER as char
    };
    let budget = max_width
        .saturating_mul(max_height)
        .saturating_mul(SCAN_BUDGET_PER_CELL);

    let (first, second) = ring.visible();
    for &byte in first.iter().chain(second).take(budget) {
        match byte {
            b'\n' => window.end_line(),
            b'\r' => {}
            BACKSPACE | DELETE => {
                window.line.pop();
            }
            b'\t' => {
                let stop = (window.line.len() / TAB_WIDTH + 1) * TAB_WIDTH;
                let stop = stop.min(max_width);
                while window.line.len() < stop && !window.is_full() {
                    window.push(' ');
                }
            }
            b' '..=b'~' => window.push(byte as char),
            _ => window.push(placeholder),
        }
        if window.is_full() {
            return window.lines;
        }
    }

    window.finish()
}

struct WindowBuilder {
    lines: Vec<String>,
    line: String,
    max_width: usize,
    max_height: usize,
}

impl WindowBuilder {
    fn new(max_width: usize, max_height: usize) -> Self {
        Self {
            lines: Vec::with_capacity(max_height.min(256)),
            line: String::with_capacity(max_width.min(1024)),
            max_width,
            max_height,
        }
    }

    fn is_full(&self) -> bool {
        self.max_width == 0 || self.lines.len() >= self.max_height
    }

    fn push(&mut self, c: char) {
        if self.line.len() == self.max_width {
            self.end_line();
            if self.is_full() {
                return;
            }
        }
        self.line.push(c);
    }

    fn end_line(&mut self) {
        self.lines.push(std::mem::take(&mut self.line));
    }

    fn finish(mut self) -> Vec<String> {
        if !self.line.is_empty() && !self.is_full() {
            self.end_line();
        }
        self.lines
    }
}
