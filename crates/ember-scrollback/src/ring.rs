//! Fixed-capacity circular byte store for terminal output.
//!
//! Holds the most recent output of a session between the collector thread
//! (which writes) and the consumer (which reads and scrolls). One slot is
//! always left empty so `head == tail` means "empty" without a separate
//! counter, which caps the usable space at `capacity - 1` bytes.
//!
//! Three indices are tracked, all taken modulo the capacity:
//!
//! - `head` — next write position.
//! - `tail` — oldest retained byte.
//! - `scroll_tail` — first byte of the visible window. It never precedes
//!   `tail` and never follows `head`.

use crate::scroll::ScrollDirection;

/// Smallest capacity that can hold any data at all.
pub const MIN_CAPACITY: usize = 2;

/// What happens to incoming bytes that do not fit in the free space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Keep the existing history; the surplus of the incoming write is dropped.
    DropNewest,
    /// Advance `tail` past the oldest bytes so the whole write fits.
    #[default]
    EvictOldest,
}

impl OverflowPolicy {
    /// Map the `overwrite_oldest` setting to a policy.
    pub fn from_overwrite_oldest(overwrite_oldest: bool) -> Self {
        if overwrite_oldest {
            OverflowPolicy::EvictOldest
        } else {
            OverflowPolicy::DropNewest
        }
    }

    pub fn overwrites_oldest(self) -> bool {
        self == OverflowPolicy::EvictOldest
    }
}

/// What a single [`RingBuffer::write`] did with its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes of this write that are now held in the buffer.
    pub stored: usize,
    /// Incoming bytes discarded under [`OverflowPolicy::DropNewest`].
    pub dropped: usize,
    /// Distance `tail` moved under [`OverflowPolicy::EvictOldest`].
    pub evicted: usize,
}

impl WriteOutcome {
    /// Whether the write ran into the capacity limit.
    pub fn overflowed(&self) -> bool {
        self.dropped > 0 || self.evicted > 0
    }
}

/// A fixed-capacity circular byte buffer with a scrollable window.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    scroll_tail: usize,
    policy: OverflowPolicy,
}

impl RingBuffer {
    /// Create an empty ring buffer.
    ///
    /// Capacities below [`MIN_CAPACITY`] are raised to it.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            scroll_tail: 0,
            policy,
        }
    }

    /// Size of the backing array. At most `capacity() - 1` bytes are held.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.distance(self.tail, self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that can be written before the overflow policy kicks in.
    pub fn free(&self) -> usize {
        self.capacity() - 1 - self.len()
    }

    /// Next write position.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Position of the oldest retained byte.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Position of the first visible byte.
    pub fn scroll_tail(&self) -> usize {
        self.scroll_tail
    }

    /// Store `data`, applying the overflow policy when it exceeds [`free`](Self::free).
    ///
    /// Never fails: overflow is reported through the returned [`WriteOutcome`].
    pub fn write(&mut self, data: &[u8]) -> WriteOutcome {
        let cap = self.capacity();
        let free = self.free();
        let mut outcome = WriteOutcome::default();
        let mut data = data;
        // Leading bytes of `data` that the rest of the same write overwrites.
        let mut skip = 0;

        if data.len() > free {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    outcome.dropped = data.len() - free;
                    data = &data[..free];
                }
                OverflowPolicy::EvictOldest => {
                    let shortfall = data.len() - free;
                    let scroll_offset = self.distance(self.tail, self.scroll_tail);
                    self.tail = self.advance(self.tail, shortfall);
                    if scroll_offset < shortfall {
                        self.scroll_tail = self.tail;
                    }
                    outcome.evicted = shortfall;
                    skip = data.len().saturating_sub(cap - 1);
                }
            }
        }

        let kept = &data[skip..];
        let start = self.advance(self.head, skip);
        let first = kept.len().min(cap - start);
        self.buf[start..start + first].copy_from_slice(&kept[..first]);
        self.buf[..kept.len() - first].copy_from_slice(&kept[first..]);

        self.head = self.advance(self.head, data.len());
        outcome.stored = kept.len();
        outcome
    }

    /// Longest contiguous run of retained bytes starting at `tail`.
    ///
    /// Stops at `head` or at the end of the backing array, whichever comes
    /// first. Call [`consume`](Self::consume) and then `read_span` again to
    /// reach data that wrapped around.
    pub fn read_span(&self) -> &[u8] {
        if self.head >= self.tail {
            &self.buf[self.tail..self.head]
        } else {
            &self.buf[self.tail..]
        }
    }

    /// Release up to `n` bytes from the tail. Returns how many were released.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        let scroll_offset = self.distance(self.tail, self.scroll_tail);
        self.tail = self.advance(self.tail, n);
        if scroll_offset < n {
            self.scroll_tail = self.tail;
        }
        n
    }

    /// Move the visible window by `lines` logical lines.
    ///
    /// Scrolling up stops at `tail`; scrolling down stops at the start of the
    /// line `head` is on. Returns the number of lines actually moved.
    pub fn scroll(&mut self, direction: ScrollDirection, lines: usize) -> usize {
        let mut moved = 0;
        match direction {
            ScrollDirection::Up => {
                let mut pos = self.line_start(self.scroll_tail);
                while moved < lines {
                    match self.previous_line_start(pos) {
                        Some(prev) => pos = prev,
                        None => break,
                    }
                    moved += 1;
                }
                self.scroll_tail = pos;
            }
            ScrollDirection::Down => {
                let mut pos = self.scroll_tail;
                while moved < lines {
                    match self.next_line_start(pos) {
                        Some(next) => pos = next,
                        None => break,
                    }
                    moved += 1;
                }
                self.scroll_tail = pos;
            }
        }
        moved
    }

    /// Place the window so its last `rows` lines end at `head`.
    pub fn scroll_to_bottom(&mut self, rows: usize) {
        self.scroll_tail = self.head;
        // A trailing newline leaves an empty current line that takes no row.
        let lines = if self.line_start(self.head) == self.head {
            rows
        } else {
            rows.saturating_sub(1)
        };
        self.scroll(ScrollDirection::Up, lines);
    }

    /// Retained bytes that sit above the visible window.
    pub fn hidden_len(&self) -> usize {
        self.distance(self.tail, self.scroll_tail)
    }

    /// Bytes from `scroll_tail` to `head`, split where they wrap.
    pub fn visible(&self) -> (&[u8], &[u8]) {
        if self.head >= self.scroll_tail {
            (&self.buf[self.scroll_tail..self.head], &[])
        } else {
            (&self.buf[self.scroll_tail..], &self.buf[..self.head])
        }
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.capacity() - from) % self.capacity()
    }

    fn advance(&self, idx: usize, n: usize) -> usize {
        (idx + n % self.capacity()) % self.capacity()
    }

    fn retreat(&self, idx: usize) -> usize {
        (idx + self.capacity() - 1) % self.capacity()
    }

    /// Move the window start to `pos`, which must lie in `[tail, head]`.
    pub(crate) fn set_scroll_tail(&mut self, pos: usize) {
        debug_assert!(self.distance(self.tail, pos) <= self.len());
        self.scroll_tail = pos;
    }

    /// Retained bytes from `from` up to `to`, with their positions.
    pub(crate) fn bytes_between(&self, from: usize, to: usize) -> impl Iterator<Item = (usize, u8)> + '_ {
        (0..self.distance(from, to)).map(move |i| {
            let pos = self.advance(from, i);
            (pos, self.buf[pos])
        })
    }

    /// Walk back from `pos` to the first byte of its line, not past `tail`.
    pub(crate) fn line_start(&self, mut pos: usize) -> usize {
        while pos != self.tail && self.buf[self.retreat(pos)] != b'\n' {
            pos = self.retreat(pos);
        }
        pos
    }

    pub(crate) fn previous_line_start(&self, pos: usize) -> Option<usize> {
        if pos == self.tail {
            return None;
        }
        Some(self.line_start(self.retreat(pos)))
    }

    fn next_line_start(&self, mut pos: usize) -> Option<usize> {
        while pos != self.head {
            let byte = self.buf[pos];
            pos = self.advance(pos, 1);
            if byte == b'\n' {
                return Some(pos);
            }
        }
        None
    }
}
