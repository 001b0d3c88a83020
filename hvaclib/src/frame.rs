//! Reassembly of the IO board's mixed binary/text serial stream.
//!
//! The board interleaves three kinds of traffic on one line:
//!
//! 1. Binary command responses: `0x10 <cmd> <status> <len_hi> <len_lo>
//!    <payload[len]>`.
//! 2. Protocol notices: text lines whose fifth byte is `P`, carrying
//!    dot-separated tokens (`FROM IOCONTROLLER . IOCONTROLLER UP` marks a
//!    board boot).
//! 3. Free-form printable text terminated by `\n` or `\r`.
//!
//! Bytes drain into a single fixed buffer; [`ReframeBuffer::assemble`]
//! walks it incrementally, copying complete records into a [`LineTable`]
//! and leaving partial ones for the next pass. `\n`/`\r` inside a binary
//! record are payload, so the binary branch is checked first.

use tracing::{debug, error};

/// Size of the raw receive buffer and of one line-table slot.
pub const SERIAL_BUF_SIZE: usize = 1024;

/// Number of slots in a line table.
pub const LINE_TABLE_ENTRIES: usize = 128;

/// First byte of every binary record.
pub const BINARY_MARKER: u8 = 0x10;

/// Bytes in a binary record before the payload (marker, cmd, status, len).
const BINARY_HEADER: usize = 5;

/// One reassembled message awaiting digestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEntry {
    /// A complete binary command response.
    Binary {
        /// Command code this record responds to.
        cmd: u8,
        /// Status byte; meaning is command specific.
        status: u8,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// A complete text line, terminator stripped.
    Text(String),
}

/// Fixed array of reassembled frames, consumed by the worker's digest pass.
#[derive(Debug)]
pub struct LineTable {
    slots: Vec<Option<LineEntry>>,
    index: usize,
}

impl Default for LineTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LineTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            slots: (0..LINE_TABLE_ENTRIES).map(|_| None).collect(),
            index: 0,
        }
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Appends an entry, wrapping (and overwriting) when the table fills.
    pub fn push(&mut self, entry: LineEntry) {
        self.slots[self.index] = Some(entry);
        self.index += 1;

        if self.index == LINE_TABLE_ENTRIES {
            debug!("line table wrap around");
            self.index = 0;
        }
    }

    /// Takes every occupied slot in order, leaving the table empty.
    pub fn drain(&mut self) -> Vec<LineEntry> {
        let drained: Vec<LineEntry> = self.slots.iter_mut().filter_map(Option::take).collect();
        self.index = 0;
        drained
    }

    /// Moves occupied slots to the front, preserving order.
    ///
    /// Used when a digest pass leaves entries behind; the insertion index
    /// ends up just past the last occupied slot.
    pub fn compact(&mut self) {
        let mut front = 0;
        for i in 0..LINE_TABLE_ENTRIES {
            if self.slots[i].is_some() {
                if i != front {
                    self.slots.swap(front, i);
                }
                front += 1;
            }
        }
        self.index = front % LINE_TABLE_ENTRIES;
    }
}

/// Incremental reassembly state over the raw receive buffer.
#[derive(Debug)]
pub struct ReframeBuffer {
    buf: Box<[u8; SERIAL_BUF_SIZE]>,
    /// One past the last byte received.
    write_idx: usize,
    /// Scan position of the assembler.
    scan_idx: usize,
    /// Start of the text run being accumulated.
    text_start: usize,
}

impl Default for ReframeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReframeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; SERIAL_BUF_SIZE]),
            write_idx: 0,
            scan_idx: 0,
            text_start: 0,
        }
    }

    /// Whether any unconsumed bytes are buffered.
    pub fn has_data(&self) -> bool {
        self.write_idx > 0
    }

    /// The writable tail of the buffer for draining the port into.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_idx..]
    }

    /// Records that `n` bytes were read into [`Self::space`].
    ///
    /// A full buffer with no complete record is a protocol bug on the
    /// wire; the indexes reset and the data is lost.
    pub fn commit(&mut self, n: usize) {
        self.write_idx += n;

        if self.write_idx >= SERIAL_BUF_SIZE {
            error!("serial receive buffer overflowed; data has been lost");
            self.reset();
        }
    }

    /// Clears all indexes, discarding buffered bytes.
    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.scan_idx = 0;
        self.text_start = 0;
    }

    /// Extracts every complete record into `table`.
    ///
    /// Partial records stay buffered; a wholly consumed buffer resets the
    /// indexes so the next drain starts at zero.
    pub fn assemble(&mut self, table: &mut LineTable) {
        while self.scan_idx < self.write_idx {
            let byte = self.buf[self.scan_idx];

            if byte == BINARY_MARKER {
                if !self.take_binary(table) {
                    // Header or payload incomplete; wait for more bytes.
                    break;
                }
                continue;
            }

            if byte == b'\n' || byte == b'\r' {
                self.take_text(table);
                self.scan_idx += 1;
                continue;
            }

            self.scan_idx += 1;
        }

        if self.scan_idx >= self.write_idx && self.text_start >= self.write_idx {
            self.reset();
        }
    }

    /// Copies one binary record out, if fully present. Returns false when
    /// more bytes are needed.
    fn take_binary(&mut self, table: &mut LineTable) -> bool {
        let start = self.scan_idx;

        if self.write_idx < start + BINARY_HEADER {
            return false;
        }

        let length =
            u16::from_be_bytes([self.buf[start + 3], self.buf[start + 4]]) as usize;
        let end = start + BINARY_HEADER + length;

        if end > SERIAL_BUF_SIZE {
            error!(
                record_end = end,
                "binary record exceeds buffer; resetting indexes, data lost"
            );
            self.reset();
            return false;
        }

        if self.write_idx < end {
            return false;
        }

        table.push(LineEntry::Binary {
            cmd: self.buf[start + 1],
            status: self.buf[start + 2],
            payload: self.buf[start + BINARY_HEADER..end].to_vec(),
        });

        self.scan_idx = end;
        self.text_start = end;
        true
    }

    /// Copies the accumulated text run ending at the current terminator.
    fn take_text(&mut self, table: &mut LineTable) {
        if self.scan_idx > self.text_start {
            let run = &self.buf[self.text_start..self.scan_idx];
            table.push(LineEntry::Text(
                String::from_utf8_lossy(run).into_owned(),
            ));
        }

        self.text_start = self.scan_idx + 1;
    }
}

// ── Protocol notices ────────────────────────────────────────────────

/// Whether a text line is a protocol notice (fifth byte is `P`).
pub fn is_protocol_notice(line: &str) -> bool {
    line.as_bytes().get(4) == Some(&b'P')
}

/// Splits the token portion of a notice on `.`, trimming each token.
///
/// Tokens follow the last `|` when one is present.
pub fn notice_tokens(line: &str) -> Vec<String> {
    let body = match line.rfind('|') {
        Some(idx) => &line[idx + 1..],
        None => line,
    };

    body.split('.')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether a token list announces a (re)boot of the board controller.
pub fn announces_boot(tokens: &[String]) -> bool {
    tokens.len() >= 2 && tokens[0] == "FROM IOCONTROLLER" && tokens[1] == "IOCONTROLLER UP"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer: &mut ReframeBuffer, bytes: &[u8]) {
        buffer.space()[..bytes.len()].copy_from_slice(bytes);
        buffer.commit(bytes.len());
    }

    #[test]
    fn test_whole_binary_record() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        feed(&mut buffer, &[0x10, 0x02, 0x01, 0x00, 0x01, 0x05]);
        buffer.assemble(&mut table);

        let entries = table.drain();
        assert_eq!(
            entries,
            vec![LineEntry::Binary {
                cmd: 0x02,
                status: 0x01,
                payload: vec![0x05],
            }]
        );
        assert!(!buffer.has_data());
    }

    #[test]
    fn test_binary_record_split_across_reads() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        // Header only: nothing assembles yet.
        feed(&mut buffer, &[0x10, 0x01, 0x01, 0x00, 0x04, 0xAA]);
        buffer.assemble(&mut table);
        assert_eq!(table.occupied(), 0);

        // Remainder of the payload arrives.
        feed(&mut buffer, &[0xBB, 0xCC, 0xDD]);
        buffer.assemble(&mut table);

        let entries = table.drain();
        assert_eq!(
            entries,
            vec![LineEntry::Binary {
                cmd: 0x01,
                status: 0x01,
                payload: vec![0xAA, 0xBB, 0xCC, 0xDD],
            }]
        );
    }

    #[test]
    fn test_text_lines_and_blank_skips() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        feed(&mut buffer, b"hello board\n\r\nsecond\r");
        buffer.assemble(&mut table);

        let entries = table.drain();
        assert_eq!(
            entries,
            vec![
                LineEntry::Text("hello board".to_string()),
                LineEntry::Text("second".to_string()),
            ]
        );
    }

    #[test]
    fn test_newline_inside_binary_payload() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        // Payload contains 0x0A; must not be treated as a terminator.
        feed(&mut buffer, &[0x10, 0x01, 0x01, 0x00, 0x02, 0x0A, 0x0D]);
        buffer.assemble(&mut table);

        let entries = table.drain();
        assert_eq!(
            entries,
            vec![LineEntry::Binary {
                cmd: 0x01,
                status: 0x01,
                payload: vec![0x0A, 0x0D],
            }]
        );
    }

    #[test]
    fn test_mixed_text_then_binary() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        let mut bytes = b"BOOT MSG\n".to_vec();
        bytes.extend_from_slice(&[0x10, 0x02, 0x01, 0x00, 0x01, 0x0F]);
        feed(&mut buffer, &bytes);
        buffer.assemble(&mut table);

        let entries = table.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], LineEntry::Text("BOOT MSG".to_string()));
        assert!(matches!(entries[1], LineEntry::Binary { cmd: 0x02, .. }));
    }

    #[test]
    fn test_unterminated_text_stays_buffered() {
        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();

        feed(&mut buffer, b"partial line");
        buffer.assemble(&mut table);
        assert_eq!(table.occupied(), 0);
        assert!(buffer.has_data());

        feed(&mut buffer, b" done\n");
        buffer.assemble(&mut table);
        assert_eq!(
            table.drain(),
            vec![LineEntry::Text("partial line done".to_string())]
        );
    }

    #[test]
    fn test_overflow_resets() {
        let mut buffer = ReframeBuffer::new();
        let n = buffer.space().len();
        for b in buffer.space().iter_mut() {
            *b = b'x';
        }
        buffer.commit(n);
        assert!(!buffer.has_data());
    }

    #[test]
    fn test_table_compact_bumps_to_front() {
        let mut table = LineTable::new();
        table.push(LineEntry::Text("a".to_string()));
        table.push(LineEntry::Text("b".to_string()));
        table.push(LineEntry::Text("c".to_string()));

        // Simulate a digest that consumed the middle entry.
        table.slots[1] = None;
        table.compact();

        assert_eq!(table.occupied(), 2);
        assert_eq!(table.slots[0], Some(LineEntry::Text("a".to_string())));
        assert_eq!(table.slots[1], Some(LineEntry::Text("c".to_string())));
        assert_eq!(table.index, 2);
    }

    #[test]
    fn test_protocol_notice_detection() {
        let line = "0001P|FROM IOCONTROLLER . IOCONTROLLER UP";
        assert!(is_protocol_notice(line));
        assert!(!is_protocol_notice("hello"));

        let tokens = notice_tokens(line);
        assert_eq!(tokens, vec!["FROM IOCONTROLLER", "IOCONTROLLER UP"]);
        assert!(announces_boot(&tokens));

        let other = notice_tokens("0002P|FROM IOCONTROLLER . DIAG . OK");
        assert!(!announces_boot(&other));
    }
}
