// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw file descriptor I/O with fixed buffers, usable on the crash path.

use crate::shared::constants::REPORT_WRITE_BUFFER_SIZE;
use crate::shared::log::write_all_raw;
use libc::{c_int, c_void};
use std::ffi::CStr;

fn open_raw(path: &CStr, flags: c_int) -> Result<c_int, i32> {
    // SAFETY: `path` is a valid C string.
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, 0o644 as libc::c_uint) };
    if fd < 0 {
        Err(errno::errno().0)
    } else {
        Ok(fd)
    }
}

/// Accumulates writes in a fixed buffer and hands them to `write(2)` when the buffer fills or
/// on [BufferedWriter::flush]. The file is flushed and closed on drop.
pub struct BufferedWriter {
    fd: c_int,
    buffer: [u8; REPORT_WRITE_BUFFER_SIZE],
    position: usize,
    failed: bool,
}

impl BufferedWriter {
    /// Creates or truncates `path`.
    pub fn create(path: &CStr) -> Result<Self, i32> {
        let fd = open_raw(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)?;
        Ok(Self::from_fd(fd))
    }

    /// Takes ownership of `fd`.
    pub fn from_fd(fd: c_int) -> Self {
        Self {
            fd,
            buffer: [0; REPORT_WRITE_BUFFER_SIZE],
            position: 0,
            failed: false,
        }
    }

    pub fn write(&mut self, mut bytes: &[u8]) -> bool {
        if self.failed {
            return false;
        }
        if bytes.len() > self.buffer.len() - self.position && !self.flush() {
            return false;
        }
        if bytes.len() > self.buffer.len() {
            return self.write_through(bytes);
        }
        while !bytes.is_empty() {
            let take = bytes.len().min(self.buffer.len() - self.position);
            self.buffer[self.position..self.position + take].copy_from_slice(&bytes[..take]);
            self.position += take;
            bytes = &bytes[take..];
        }
        true
    }

    pub fn flush(&mut self) -> bool {
        if self.position == 0 {
            return !self.failed;
        }
        let position = std::mem::take(&mut self.position);
        if !self.failed && !write_all_raw(self.fd, &self.buffer[..position]) {
            self.record_failure();
        }
        !self.failed
    }

    /// Whether any write has failed. Later writes are dropped once one failed.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn write_through(&mut self, bytes: &[u8]) -> bool {
        if !write_all_raw(self.fd, bytes) {
            self.record_failure();
        }
        !self.failed
    }

    fn record_failure(&mut self) {
        crash_error!("Could not write to fd {}: errno {}", self.fd, errno::errno().0);
        self.failed = true;
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.flush();
        // SAFETY: the writer owns the descriptor.
        unsafe { libc::close(self.fd) };
    }
}

/// Reads a file through a fixed buffer, handing out chunks or lines.
pub struct BufferedReader<const N: usize> {
    fd: c_int,
    buffer: [u8; N],
    start: usize,
    end: usize,
}

impl<const N: usize> BufferedReader<N> {
    pub fn open(path: &CStr) -> Result<Self, i32> {
        let fd = open_raw(path, libc::O_RDONLY)?;
        Ok(Self {
            fd,
            buffer: [0; N],
            start: 0,
            end: 0,
        })
    }

    fn fill(&mut self) -> bool {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        loop {
            // SAFETY: the destination is the free tail of the buffer.
            let read = unsafe {
                libc::read(
                    self.fd,
                    self.buffer[self.end..].as_mut_ptr() as *mut c_void,
                    N - self.end,
                )
            };
            if read < 0 && errno::errno().0 == libc::EINTR {
                continue;
            }
            if read <= 0 {
                return false;
            }
            self.end += read as usize;
            return true;
        }
    }

    /// The next chunk of the file, empty at the end.
    pub fn read_chunk(&mut self) -> &[u8] {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
            self.fill();
        }
        let chunk = &self.buffer[self.start..self.end];
        self.start = self.end;
        chunk
    }

    /// The next line without its terminator, or `None` at the end of the file.
    /// Lines longer than the buffer are split.
    pub fn read_line(&mut self) -> Option<&[u8]> {
        loop {
            if let Some(offset) = self.buffer[self.start..self.end]
                .iter()
                .position(|b| *b == b'\n')
            {
                let line_start = self.start;
                self.start += offset + 1;
                return Some(&self.buffer[line_start..line_start + offset]);
            }
            let full = self.start == 0 && self.end == N;
            if full || !self.fill() {
                if self.start == self.end {
                    return None;
                }
                let line_start = self.start;
                self.start = self.end;
                return Some(&self.buffer[line_start..self.end]);
            }
        }
    }
}

impl<const N: usize> Drop for BufferedReader<N> {
    fn drop(&mut self) {
        // SAFETY: the reader owns the descriptor.
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_writes_larger_than_buffer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.txt");
        let big = vec![b'x'; REPORT_WRITE_BUFFER_SIZE * 3 + 7];
        {
            let mut writer = BufferedWriter::create(&c_path(&path)).unwrap();
            assert!(writer.write(b"head:"));
            assert!(writer.write(&big));
            assert!(writer.write(b":tail"));
        }
        let contents = std::fs::read(&path)?;
        assert_eq!(contents.len(), big.len() + 10);
        assert!(contents.starts_with(b"head:x"));
        assert!(contents.ends_with(b"x:tail"));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reads_lines_including_unterminated_last() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "first\nsecond line\n\nlast")?;
        let mut reader = BufferedReader::<8>::open(&c_path(&path)).unwrap();
        let mut lines = vec![];
        while let Some(line) = reader.read_line() {
            lines.push(String::from_utf8(line.to_vec())?);
        }
        assert_eq!(lines, vec!["first", "second l", "ine", "", "last"]);
        Ok(())
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = BufferedReader::<16>::open(c"/nonexistent/crashee/file");
        assert_eq!(result.err(), Some(libc::ENOENT));
    }
}
