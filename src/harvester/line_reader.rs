// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Read};

/// One line as read from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Line content with the `\n` or `\r\n` terminator removed.
    pub text: Vec<u8>,
    /// Bytes consumed from the source, terminator included.
    pub len: usize,
    /// The line reached the maximum size before a terminator was seen.
    pub split: bool,
}

/// Splits a byte source into lines.
///
/// Reads go through a working buffer of `buffer_size` bytes. A line longer
/// than the buffer is accumulated across refills, and reads are constrained
/// so that no more than `max_line` bytes of a single line are ever held. Once
/// that limit is reached without a terminator the held bytes are returned
/// with `split` set and reading continues with the rest of the line.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pending: Vec<u8>,
    max_line: usize,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, buffer_size: usize, max_line: usize) -> Self {
        let max_line = max_line.max(1);
        Self {
            inner,
            buf: vec![0; buffer_size.clamp(1, max_line)],
            start: 0,
            end: 0,
            pending: Vec::new(),
            max_line,
        }
    }

    /// Returns the next complete line, or `None` at EOF. Bytes of an
    /// unterminated trailing line stay buffered and are returned once the
    /// terminator arrives.
    pub fn read_line(&mut self) -> io::Result<Option<RawLine>> {
        loop {
            if let Some(pos) = self.buf[self.start..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let mut text = std::mem::take(&mut self.pending);
                text.extend_from_slice(&self.buf[self.start..self.start + pos]);
                self.start += pos + 1;

                let len = text.len() + 1;
                if text.last() == Some(&b'\r') {
                    text.pop();
                }
                return Ok(Some(RawLine {
                    text,
                    len,
                    split: false,
                }));
            }

            let held = self.pending.len() + (self.end - self.start);
            if held >= self.max_line {
                let mut text = std::mem::take(&mut self.pending);
                text.extend_from_slice(&self.buf[self.start..self.end]);
                self.start = 0;
                self.end = 0;
                let len = text.len();
                return Ok(Some(RawLine {
                    text,
                    len,
                    split: true,
                }));
            }

            if self.fill(self.max_line - held)? == 0 {
                return Ok(None);
            }
        }
    }

    /// Discards everything buffered, used after the source was repositioned.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.pending.clear();
    }

    /// Bytes of an unterminated line held while waiting for its terminator.
    pub fn buffered_len(&self) -> usize {
        self.pending.len() + (self.end - self.start)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn fill(&mut self, limit: usize) -> io::Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        if self.end == self.buf.len() {
            self.pending.extend_from_slice(&self.buf[..self.end]);
            self.end = 0;
        }

        let space = (self.buf.len() - self.end).min(limit);
        loop {
            match self.inner.read(&mut self.buf[self.end..self.end + space]) {
                Ok(n) => {
                    self.end += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines<R: Read>(reader: &mut LineReader<R>) -> Vec<RawLine> {
        let mut out = Vec::new();
        while let Some(line) = reader.read_line().unwrap() {
            out.push(line);
        }
        out
    }

    fn line(text: &str, len: usize, split: bool) -> RawLine {
        RawLine {
            text: text.as_bytes().to_vec(),
            len,
            split,
        }
    }

    #[test]
    fn reads_lf_and_crlf() {
        let mut reader = LineReader::new(Cursor::new(b"a\nbb\r\n\nccc\n".to_vec()), 4, 100);
        assert_eq!(
            vec![
                line("a", 2, false),
                line("bb", 4, false),
                line("", 1, false),
                line("ccc", 4, false),
            ],
            lines(&mut reader)
        );
    }

    #[test]
    fn unterminated_line_waits_for_terminator() {
        let mut reader = LineReader::new(Cursor::new(b"one\ntw".to_vec()), 16, 100);
        assert_eq!(Some(line("one", 4, false)), reader.read_line().unwrap());
        assert_eq!(None, reader.read_line().unwrap());
        assert_eq!(2, reader.buffered_len());

        let cursor = reader.get_mut();
        let position = cursor.position();
        cursor.get_mut().extend_from_slice(b"o\n");
        cursor.set_position(position);

        assert_eq!(Some(line("two", 4, false)), reader.read_line().unwrap());
        assert_eq!(0, reader.buffered_len());
    }

    #[test]
    fn long_lines_accumulate_across_refills() {
        let text = "x".repeat(50);
        let input = format!("{}\nend\n", text);
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()), 8, 100);
        assert_eq!(
            vec![line(&text, 51, false), line("end", 4, false)],
            lines(&mut reader)
        );
    }

    #[test]
    fn lines_over_the_limit_are_split() {
        let mut reader = LineReader::new(Cursor::new(b"abcdefghij\nk\n".to_vec()), 4, 6);
        assert_eq!(
            vec![
                line("abcdef", 6, true),
                line("ghij", 5, false),
                line("k", 2, false),
            ],
            lines(&mut reader)
        );
    }

    #[test]
    fn line_of_exactly_max_bytes_is_whole() {
        let mut reader = LineReader::new(Cursor::new(b"abc\nabcd\n".to_vec()), 2, 4);
        assert_eq!(
            vec![
                line("abc", 4, false),
                line("abcd", 4, true),
                line("", 1, false),
            ],
            lines(&mut reader)
        );
    }

    #[test]
    fn empty_source() {
        let mut reader = LineReader::new(Cursor::new(Vec::new()), 4, 4);
        assert_eq!(None, reader.read_line().unwrap());
    }

    #[test]
    fn reset_drops_partial_data() {
        let mut reader = LineReader::new(Cursor::new(b"partial".to_vec()), 16, 100);
        assert_eq!(None, reader.read_line().unwrap());
        reader.reset();

        let cursor = reader.get_mut();
        *cursor = Cursor::new(b"fresh\n".to_vec());
        assert_eq!(Some(line("fresh", 6, false)), reader.read_line().unwrap());
    }
}
