// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ffi::CStr;
use std::fmt;

/// A fixed capacity text buffer usable from a signal handler.
/// Writes past the capacity are dropped at a char boundary rather than failing, so a
/// long log line or key is truncated instead of lost.
/// One byte is always kept free for a NUL terminator.
#[derive(Clone)]
pub struct FmtBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FmtBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole chars are ever copied in, see `push_str`.
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    /// Returns the contents as a C string.
    /// Fails if the contents contain an interior NUL.
    pub fn as_c_str(&mut self) -> Option<&CStr> {
        self.buf[self.len] = 0;
        CStr::from_bytes_with_nul(&self.buf[..=self.len]).ok()
    }

    pub fn push_str(&mut self, s: &str) -> bool {
        let room = N.saturating_sub(1).saturating_sub(self.len);
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        take == s.len()
    }

    /// Drops the last `count` bytes.
    pub fn truncate_by(&mut self, count: usize) {
        self.len = self.len.saturating_sub(count);
    }
}

impl<const N: usize> Default for FmtBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FmtBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for FmtBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_truncates_at_capacity() {
        let mut buf = FmtBuf::<8>::new();
        write!(buf, "{}", "abcdefghij").unwrap();
        assert_eq!(buf.as_str(), "abcdefg");
        assert_eq!(buf.as_c_str().unwrap().to_bytes(), b"abcdefg");
    }

    #[test]
    fn test_truncates_at_char_boundary() {
        let mut buf = FmtBuf::<5>::new();
        assert!(!buf.push_str("abé€"));
        assert_eq!(buf.as_str(), "abé");
    }

    #[test]
    fn test_formats_hex() {
        let mut buf = FmtBuf::<32>::new();
        write!(buf, "stack@0x{:016x}", 0xdead_beefusize).unwrap();
        assert_eq!(buf.as_str(), "stack@0x00000000deadbeef");
    }
}
