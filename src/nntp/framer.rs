//! C9: blocking, bounded-size framed I/O over a full-duplex byte stream.
//! No async runtime per the design notes ("Coroutines / async: Not
//! required. Use blocking I/O with per-fd timeouts") -- one thread per
//! connection is the intended deployment shape.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const DEFAULT_MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    Eof,
    LineTooLong,
    Timeout,
    Error,
}

/// Lets the framer apply a per-call read timeout without hard-coding a
/// `TcpStream`; any transport that can report a deadline to the kernel
/// implements this.
pub trait SetReadTimeout {
    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()>;
}

impl SetReadTimeout for TcpStream {
    fn set_read_timeout(&mut self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }
}

/// A framed line/multiline reader-writer over `S`. Owns a growable read
/// buffer capped at `max_line` bytes; `S` is expected to be a blocking
/// stream (a non-blocking or async transport does not fit this contract).
pub struct Framer<S> {
    stream: S,
    buf: Vec<u8>,
    /// Bytes in `buf[..filled]` are valid; bytes before `consumed` have
    /// already been returned to the caller.
    filled: usize,
    consumed: usize,
    max_line: usize,
}

impl<S: Read + Write + SetReadTimeout> Framer<S> {
    pub fn new(stream: S) -> Self {
        Framer { stream, buf: vec![0u8; 4096], filled: 0, consumed: 0, max_line: DEFAULT_MAX_LINE }
    }

    pub fn with_max_line(stream: S, max_line: usize) -> Self {
        Framer { stream, buf: vec![0u8; 4096], filled: 0, consumed: 0, max_line }
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buf.copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }
    }

    fn fill_more(&mut self, timeout: Duration) -> Result<bool, ReadStatus> {
        self.compact();
        if self.filled == self.buf.len() {
            if self.buf.len() >= self.max_line {
                return Err(ReadStatus::LineTooLong);
            }
            let grown = (self.buf.len() * 2).min(self.max_line);
            self.buf.resize(grown, 0);
        }
        self.stream.set_read_timeout(Some(timeout)).map_err(|_| ReadStatus::Error)?;
        match self.stream.read(&mut self.buf[self.filled..]) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.filled += n;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Err(ReadStatus::Timeout)
            }
            Err(_) => Err(ReadStatus::Error),
        }
    }

    /// Reads one CRLF-terminated line, stripping the CRLF. Returns
    /// `LineTooLong` (discarding input up to the next line boundary) if the
    /// buffer would have to grow past `max_line`.
    pub fn read_line(&mut self, timeout: Duration) -> Result<String, ReadStatus> {
        loop {
            if let Some(pos) = find_crlf(&self.buf[self.consumed..self.filled]) {
                let line_end = self.consumed + pos;
                let line = String::from_utf8_lossy(&self.buf[self.consumed..line_end]).into_owned();
                self.consumed = line_end + 2;
                return Ok(line);
            }

            match self.fill_more(timeout) {
                Ok(true) => continue,
                Ok(false) => {
                    return if self.consumed < self.filled {
                        let line = String::from_utf8_lossy(&self.buf[self.consumed..self.filled]).into_owned();
                        self.consumed = self.filled;
                        Ok(line)
                    } else {
                        Err(ReadStatus::Eof)
                    };
                }
                Err(ReadStatus::LineTooLong) => {
                    self.discard_to_next_line(timeout)?;
                    return Err(ReadStatus::LineTooLong);
                }
                Err(status) => return Err(status),
            }
        }
    }

    fn discard_to_next_line(&mut self, timeout: Duration) -> Result<(), ReadStatus> {
        loop {
            if let Some(pos) = find_crlf(&self.buf[self.consumed..self.filled]) {
                self.consumed = self.consumed + pos + 2;
                return Ok(());
            }
            self.filled = 0;
            self.consumed = 0;
            match self.fill_more(timeout) {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(ReadStatus::LineTooLong) => {
                    self.filled = 0;
                    self.consumed = 0;
                    continue;
                }
                Err(status) => return Err(status),
            }
        }
    }

    /// Reads and whitespace-splits one command line.
    pub fn read_command(&mut self, timeout: Duration) -> Result<Vec<String>, ReadStatus> {
        let line = self.read_line(timeout)?;
        Ok(line.split_whitespace().map(|s| s.to_string()).collect())
    }

    /// Reads a dot-stuffed multiline block, returning the raw bytes
    /// including the terminating `\r\n.\r\n`. The terminator is detected
    /// with a 4-byte backtrack window so it is found even when split
    /// across separate underlying reads.
    pub fn read_multiline(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, ReadStatus> {
        let mut out = Vec::new();
        loop {
            if self.consumed < self.filled {
                out.extend_from_slice(&self.buf[self.consumed..self.filled]);
                self.consumed = self.filled;
            }

            if out.len() > max_bytes {
                return Err(ReadStatus::LineTooLong);
            }

            let scan_from = out.len().saturating_sub(4 + 3);
            if let Some(rel) = find_terminator(&out[scan_from..]) {
                let end = scan_from + rel + 5; // "\r\n.\r\n".len()
                out.truncate(end);
                self.consumed = self.filled; // already copied into out
                return Ok(out);
            }

            match self.fill_more(timeout) {
                Ok(true) => continue,
                Ok(false) => return Err(ReadStatus::Eof),
                Err(status) => return Err(status),
            }
        }
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r\n")
    }

    pub fn respond(&mut self, code: u32, text: &str) -> io::Result<()> {
        self.write_line(&format!("{} {}", code, text))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(5).position(|w| w == b"\r\n.\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory transport that can be fed bytes one chunk at a time,
    /// simulating a 1-byte-per-read stress feed.
    struct MemStream {
        chunks: VecDeque<Vec<u8>>,
        out: Vec<u8>,
    }

    impl MemStream {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            MemStream { chunks: chunks.into_iter().collect(), out: Vec::new() }
        }
    }

    impl Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    impl Write for MemStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SetReadTimeout for MemStream {
        fn set_read_timeout(&mut self, _dur: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn one_byte_chunks(data: &[u8]) -> Vec<Vec<u8>> {
        data.iter().map(|b| vec![*b]).collect()
    }

    #[test]
    fn read_line_strips_crlf() {
        let stream = MemStream::new(vec![b"HELP\r\n".to_vec()]);
        let mut framer = Framer::new(stream);
        let line = framer.read_line(Duration::from_secs(1)).unwrap();
        assert_eq!(line, "HELP");
    }

    #[test]
    fn read_line_in_one_byte_chunks() {
        let data = b"QUIT\r\n";
        let stream = MemStream::new(one_byte_chunks(data));
        let mut framer = Framer::new(stream);
        let line = framer.read_line(Duration::from_secs(1)).unwrap();
        assert_eq!(line, "QUIT");
    }

    #[test]
    fn framer_stress_many_lines_one_byte_at_a_time() {
        let mut expected = Vec::new();
        let mut wire = Vec::new();
        for n in 1..=50usize {
            let line = "x".repeat(n);
            wire.extend_from_slice(line.as_bytes());
            wire.extend_from_slice(b"\r\n");
            expected.push(line);
        }
        let stream = MemStream::new(one_byte_chunks(&wire));
        let mut framer = Framer::new(stream);
        for want in expected {
            let got = framer.read_line(Duration::from_secs(1)).unwrap();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn read_multiline_detects_terminator_split_across_reads() {
        let data = b"line one\r\nline two\r\n.\r\n";
        let stream = MemStream::new(one_byte_chunks(data));
        let mut framer = Framer::new(stream);
        let block = framer.read_multiline(1024, Duration::from_secs(1)).unwrap();
        assert_eq!(block, data);
    }

    #[test]
    fn read_line_too_long_is_reported_and_resyncs() {
        let long_line = "a".repeat(200);
        let wire = format!("{}\r\nshort\r\n", long_line);
        let stream = MemStream::new(vec![wire.into_bytes()]);
        let mut framer = Framer::with_max_line(stream, 64);
        let err = framer.read_line(Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, ReadStatus::LineTooLong);
        let next = framer.read_line(Duration::from_secs(1)).unwrap();
        assert_eq!(next, "short");
    }

    #[test]
    fn respond_writes_ntn_sp_text_crlf() {
        let stream = MemStream::new(vec![]);
        let mut framer = Framer::new(stream);
        framer.respond(281, "ok").unwrap();
        assert_eq!(framer.stream.out, b"281 ok\r\n");
    }
}
