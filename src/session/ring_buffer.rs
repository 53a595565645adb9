//! Bounded terminal output history
//!
//! A fixed arena of line slots indexed by write position. Each slot holds the
//! raw bytes of one output line including its `\n`; bytes after the last
//! newline wait in a partial tail until the line completes. Lines longer than
//! `max_line_bytes` are split across several slots.
//!
//! Two bounds apply at once: the slot count, and the total bytes of stored
//! lines plus the partial tail. Whichever is hit first evicts the oldest
//! lines.

use bytes::{Bytes, BytesMut};

pub struct RingBuffer {
    slots: Vec<Bytes>,
    /// Slot of the oldest line
    head: usize,
    len: usize,
    /// Bytes held by stored lines (partial tail excluded)
    line_bytes: usize,
    partial: BytesMut,
    max_bytes: usize,
    max_line_bytes: usize,
    total_lines: u64,
}

impl RingBuffer {
    pub fn new(max_lines: usize, max_bytes: usize, max_line_bytes: usize) -> Self {
        let max_lines = max_lines.max(1);
        let max_bytes = max_bytes.max(1);
        Self {
            slots: vec![Bytes::new(); max_lines],
            head: 0,
            len: 0,
            line_bytes: 0,
            partial: BytesMut::new(),
            max_bytes,
            max_line_bytes: max_line_bytes.clamp(1, max_bytes),
            total_lines: 0,
        }
    }

    /// Append raw output
    pub fn push(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            match data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.extend_partial(&data[..=pos]);
                    let line = self.partial.split().freeze();
                    if !line.is_empty() {
                        self.push_line(line);
                    }
                    data = &data[pos + 1..];
                }
                None => {
                    self.extend_partial(data);
                    data = &[];
                }
            }
        }
        self.enforce_byte_cap();
    }

    fn extend_partial(&mut self, mut data: &[u8]) {
        while self.partial.len() + data.len() > self.max_line_bytes {
            let room = self.max_line_bytes - self.partial.len();
            self.partial.extend_from_slice(&data[..room]);
            let line = self.partial.split().freeze();
            self.push_line(line);
            data = &data[room..];
        }
        self.partial.extend_from_slice(data);
    }

    fn push_line(&mut self, line: Bytes) {
        let capacity = self.slots.len();
        if self.len == capacity {
            self.evict_oldest();
        }
        let slot = (self.head + self.len) % capacity;
        self.line_bytes += line.len();
        self.slots[slot] = line;
        self.len += 1;
        self.total_lines += 1;
    }

    fn evict_oldest(&mut self) {
        if self.len == 0 {
            return;
        }
        let old = std::mem::take(&mut self.slots[self.head]);
        self.line_bytes -= old.len();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
    }

    fn enforce_byte_cap(&mut self) {
        while self.len > 0 && self.line_bytes + self.partial.len() > self.max_bytes {
            self.evict_oldest();
        }
    }

    fn line(&self, index: usize) -> &Bytes {
        &self.slots[(self.head + index) % self.slots.len()]
    }

    /// Complete lines currently held
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.partial.is_empty()
    }

    /// Stored bytes, partial tail included
    pub fn byte_len(&self) -> usize {
        self.line_bytes + self.partial.len()
    }

    /// Lines ever stored, evicted ones included
    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Everything held, oldest first, partial tail last. Used for replay.
    pub fn snapshot(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.byte_len());
        for i in 0..self.len {
            out.extend_from_slice(self.line(i));
        }
        out.extend_from_slice(&self.partial);
        out.freeze()
    }

    /// Last `count` lines as text with ANSI escapes stripped and line
    /// endings trimmed. A non-empty partial tail counts as the newest line.
    pub fn tail_lines(&self, count: usize) -> Vec<String> {
        let has_partial = !self.partial.is_empty();
        let available = self.len + usize::from(has_partial);
        let take = count.min(available);
        let mut lines = Vec::with_capacity(take);

        let from_ring = take - usize::from(has_partial && take > 0);
        for i in (self.len - from_ring)..self.len {
            lines.push(render_line(self.line(i)));
        }
        if has_partial && take > 0 {
            lines.push(render_line(&self.partial));
        }
        lines
    }
}

fn render_line(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&stripped)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_and_partial_tail() {
        let mut ring = RingBuffer::new(10, 1024, 256);
        ring.push(b"first\r\nsecond\r\nthi");
        assert_eq!(ring.len(), 2);
        ring.push(b"rd\r\n$ ");
        assert_eq!(ring.len(), 3);

        assert_eq!(ring.tail_lines(10), vec!["first", "second", "third", "$ "]);
        assert_eq!(ring.tail_lines(2), vec!["third", "$ "]);
        assert_eq!(&ring.snapshot()[..], b"first\r\nsecond\r\nthird\r\n$ ");
    }

    #[test]
    fn test_line_cap_evicts_oldest_first() {
        let mut ring = RingBuffer::new(3, 1024, 256);
        for i in 0..5 {
            ring.push(format!("line{}\n", i).as_bytes());
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.total_lines(), 5);
        assert_eq!(ring.tail_lines(10), vec!["line2", "line3", "line4"]);
    }

    #[test]
    fn test_byte_cap_never_exceeded() {
        let mut ring = RingBuffer::new(1000, 64, 16);
        for i in 0..100 {
            ring.push(format!("entry-{:03}\n", i).as_bytes());
            assert!(ring.byte_len() <= 64);
        }
        let tail = ring.tail_lines(1);
        assert_eq!(tail, vec!["entry-099"]);
    }

    #[test]
    fn test_long_line_is_split() {
        let mut ring = RingBuffer::new(10, 1024, 4);
        ring.push(b"abcdefghij\n");
        assert_eq!(ring.tail_lines(10), vec!["abcd", "efgh", "ij"]);
        assert_eq!(&ring.snapshot()[..], b"abcdefghij\n");
    }

    #[test]
    fn test_ansi_is_stripped_for_consumers_only() {
        let mut ring = RingBuffer::new(10, 1024, 256);
        ring.push(b"\x1b[32mok\x1b[0m done\r\n");
        assert_eq!(ring.tail_lines(1), vec!["ok done"]);
        assert!(ring.snapshot().starts_with(b"\x1b[32m"));
    }

    #[test]
    fn test_empty_ring() {
        let ring = RingBuffer::new(4, 64, 16);
        assert!(ring.is_empty());
        assert!(ring.tail_lines(5).is_empty());
        assert!(ring.snapshot().is_empty());
    }
}
