// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread enumeration and naming through `/proc`, without allocating.

use crate::shared::constants::MAX_CAPTURED_THREADS;
use std::ffi::CStr;

pub type ThreadId = libc::pid_t;

/// A fixed capacity list of thread ids. Threads beyond the capacity are counted but dropped.
#[derive(Debug, Clone, Copy)]
pub struct ThreadList {
    threads: [ThreadId; MAX_CAPTURED_THREADS],
    len: usize,
    dropped: usize,
}

impl ThreadList {
    pub const fn new() -> Self {
        Self {
            threads: [0; MAX_CAPTURED_THREADS],
            len: 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, thread: ThreadId) -> bool {
        if self.len == self.threads.len() {
            self.dropped += 1;
            return false;
        }
        self.threads[self.len] = thread;
        self.len += 1;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.dropped = 0;
    }

    pub fn as_slice(&self) -> &[ThreadId] {
        &self.threads[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<ThreadId> {
        self.as_slice().get(index).copied()
    }

    pub fn index_of(&self, thread: ThreadId) -> Option<usize> {
        self.as_slice().iter().position(|t| *t == thread)
    }

    /// Number of threads that did not fit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_thread_id() -> ThreadId {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
}

/// On Linux the main thread's id is the process id.
pub fn main_thread_id() -> ThreadId {
    // SAFETY: getpid has no preconditions.
    unsafe { libc::getpid() }
}

/// Fills `list` with the ids of every thread of this process.
/// Only `open`, `getdents64` and `close` are called, all async-signal-safe.
pub fn enumerate_threads(list: &mut ThreadList) -> bool {
    const TASK_DIR: &CStr = c"/proc/self/task";
    list.clear();

    // SAFETY: the path is a valid C string.
    let fd = unsafe {
        libc::open(
            TASK_DIR.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return false;
    }

    // Aligned for the u64 fields at the start of each `linux_dirent64`.
    #[repr(C, align(8))]
    struct DirentBuffer([u8; 2048]);
    let mut buffer = DirentBuffer([0; 2048]);

    loop {
        // SAFETY: the buffer is live and its length is passed along.
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buffer.0.as_mut_ptr(),
                buffer.0.len(),
            )
        };
        if read <= 0 {
            break;
        }
        let entries = &buffer.0[..read as usize];
        let mut offset = 0;
        // struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
        while offset + 19 < entries.len() {
            let reclen = u16::from_ne_bytes([entries[offset + 16], entries[offset + 17]]) as usize;
            if reclen == 0 || offset + reclen > entries.len() {
                break;
            }
            let name = &entries[offset + 19..offset + reclen];
            let name = &name[..name.iter().position(|b| *b == 0).unwrap_or(name.len())];
            if let Some(tid) = parse_decimal(name) {
                list.push(tid as ThreadId);
            }
            offset += reclen;
        }
    }

    // SAFETY: the fd was opened above.
    unsafe { libc::close(fd) };
    !list.is_empty()
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, b| {
        b.is_ascii_digit()
            .then(|| acc.checked_mul(10)?.checked_add((b - b'0') as u64))
            .flatten()
    })
}

/// Best effort string formatting with no async signal un-safe calls.
/// Writes the decimal form of `val` into `buf`, returning the number of bytes used.
pub(crate) fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Reads the kernel name of `thread` from `/proc/self/task/{tid}/comm` into `buffer`.
pub fn thread_name(thread: ThreadId, buffer: &mut [u8; 64]) -> Option<&str> {
    let mut path_buf = [0u8; 64];
    let mut idx = 0usize;
    let prefix = b"/proc/self/task/";
    path_buf[..prefix.len()].copy_from_slice(prefix);
    idx += prefix.len();
    idx += write_decimal(&mut path_buf[idx..], thread as u64)?;
    let suffix = b"/comm";
    path_buf[idx..idx + suffix.len()].copy_from_slice(suffix);
    idx += suffix.len();
    // null-terminate
    if idx >= path_buf.len() {
        return None;
    }
    path_buf[idx] = 0;

    // SAFETY: the path is NUL terminated above.
    let fd = unsafe { libc::open(path_buf.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        // Missing / unreadable; the thread has probably exited.
        return None;
    }
    let mut len = 0usize;
    while len < buffer.len() {
        // SAFETY: reads into the unused tail of `buffer`.
        let read_count = unsafe {
            libc::read(
                fd,
                buffer[len..].as_mut_ptr() as *mut libc::c_void,
                buffer.len() - len,
            )
        };
        if read_count <= 0 {
            break;
        }
        len += read_count as usize;
    }
    // Best-effort close
    let _ = unsafe { libc::close(fd) };

    let name = std::str::from_utf8(&buffer[..len]).ok()?.trim_end_matches('\n');
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(b"1234"), Some(1234));
        assert_eq!(parse_decimal(b"."), None);
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"12a"), None);
    }

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 8];
        assert_eq!(write_decimal(&mut buf, 4096), Some(4));
        assert_eq!(&buf[..4], b"4096");
        assert_eq!(write_decimal(&mut buf[..2], 4096), None);
    }

    #[test]
    fn test_thread_list_truncates() {
        let mut list = ThreadList::new();
        for tid in 0..(MAX_CAPTURED_THREADS as ThreadId + 3) {
            list.push(tid);
        }
        assert_eq!(list.len(), MAX_CAPTURED_THREADS);
        assert_eq!(list.dropped(), 3);
        assert_eq!(list.index_of(5), Some(5));
        assert_eq!(list.index_of(MAX_CAPTURED_THREADS as ThreadId), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_enumerate_sees_spawned_thread_and_its_name() {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("crashee-named".to_string())
            .spawn(move || {
                tid_tx.send(current_thread_id()).unwrap();
                done_rx.recv().unwrap();
            })
            .unwrap();
        let tid = tid_rx.recv().unwrap();

        let mut list = ThreadList::new();
        assert!(enumerate_threads(&mut list));
        assert!(list.index_of(current_thread_id()).is_some());
        assert!(list.index_of(tid).is_some());

        let mut buffer = [0u8; 64];
        assert_eq!(thread_name(tid, &mut buffer), Some("crashee-named"));

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
