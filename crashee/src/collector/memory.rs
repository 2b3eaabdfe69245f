// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-isolated reads of arbitrary addresses.
//!
//! Every pointer chased while writing a report (register values, stack words, object fields)
//! goes through [copy_safely]. The copy is done by the kernel via `process_vm_readv` on our own
//! pid: an unmapped or protected source makes the syscall fail with `EFAULT` instead of raising
//! `SIGSEGV` inside the crash handler. Kernels or sandboxes refusing that syscall fall back to
//! pushing the range through a pipe, where `write(2)` reports `EFAULT` the same way.

use libc::{c_void, iovec};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

static VM_READV_UNAVAILABLE: AtomicBool = AtomicBool::new(false);
const PIPE_CHUNK: usize = 4096;

/// Copies `dst.len()` bytes starting at `src` into `dst`.
/// Returns false, leaving `dst` in an unspecified state, if any byte of the source range is
/// not readable.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> bool {
    if dst.is_empty() {
        return true;
    }
    if src == 0 || src.checked_add(dst.len()).is_none() {
        return false;
    }
    if !VM_READV_UNAVAILABLE.load(Relaxed) {
        let local = iovec {
            iov_base: dst.as_mut_ptr() as *mut c_void,
            iov_len: dst.len(),
        };
        let remote = iovec {
            iov_base: src as *mut c_void,
            iov_len: dst.len(),
        };
        // SAFETY: `local` describes a live, writable buffer. The remote range is only read by
        // the kernel, which validates it.
        let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if copied >= 0 {
            return copied as usize == dst.len();
        }
        match errno::errno().0 {
            libc::ENOSYS | libc::EPERM => VM_READV_UNAVAILABLE.store(true, Relaxed),
            _ => return false,
        }
    }
    copy_via_pipe(src, dst)
}

fn copy_via_pipe(src: usize, dst: &mut [u8]) -> bool {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        return false;
    }
    let [read_fd, write_fd] = fds;
    let mut ok = true;
    let mut offset = 0;
    while ok && offset < dst.len() {
        let chunk = (dst.len() - offset).min(PIPE_CHUNK);
        // SAFETY: the kernel validates the source range and fails with EFAULT.
        let written =
            unsafe { libc::write(write_fd, (src + offset) as *const c_void, chunk) };
        if written != chunk as isize {
            ok = false;
            break;
        }
        // SAFETY: the destination is a live slice of at least `chunk` bytes.
        let read = unsafe {
            libc::read(read_fd, dst[offset..].as_mut_ptr() as *mut c_void, chunk)
        };
        ok = read == chunk as isize;
        offset += chunk;
    }
    // SAFETY: both descriptors were opened above.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
    ok
}

/// Copies as many bytes as are readable from the start of the range, stopping at the first
/// unreadable page. Returns the number of bytes copied.
pub fn copy_max_possible(src: usize, dst: &mut [u8]) -> usize {
    if copy_safely(src, dst) {
        return dst.len();
    }
    let page_size = page_size::get();
    let mut copied = 0;
    while copied < dst.len() {
        let address = src + copied;
        let to_page_end = page_size - (address % page_size);
        let chunk = to_page_end.min(dst.len() - copied);
        if !copy_safely(address, &mut dst[copied..copied + chunk]) {
            break;
        }
        copied += chunk;
    }
    copied
}

/// Reads one machine word.
pub fn read_word(address: usize) -> Option<usize> {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    copy_safely(address, &mut bytes).then(|| usize::from_ne_bytes(bytes))
}

pub fn is_memory_readable(address: usize, len: usize) -> bool {
    let mut scratch = [0u8; 64];
    let mut checked = 0;
    while checked < len {
        let chunk = (len - checked).min(scratch.len());
        if !copy_safely(address + checked, &mut scratch[..chunk]) {
            return false;
        }
        checked += chunk;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_copy_valid_buffer() {
        let source = *b"notable string";
        let mut dst = [0u8; 14];
        assert!(copy_safely(source.as_ptr() as usize, &mut dst));
        assert_eq!(&dst, b"notable string");
        assert_eq!(read_word(&source as *const _ as usize).map(|_| ()), Some(()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_copy_rejects_null_and_unmapped() {
        let mut dst = [0u8; 8];
        assert!(!copy_safely(0, &mut dst));
        assert!(!copy_safely(8, &mut dst));
        assert!(!copy_safely(usize::MAX - 4, &mut dst));
        assert_eq!(read_word(16), None);
        assert!(!is_memory_readable(16, 8));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_copy_max_possible_stops_at_guard_page() {
        let page_size = page_size::get();
        // SAFETY: anonymous private mapping, unmapped at the end of the test.
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                2 * page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(base, libc::MAP_FAILED);
            assert_eq!(
                libc::mprotect(
                    (base as usize + page_size) as *mut c_void,
                    page_size,
                    libc::PROT_NONE
                ),
                0
            );
            let start = base as usize + page_size - 16;
            let mut dst = [0u8; 64];
            assert_eq!(copy_max_possible(start, &mut dst), 16);
            assert!(is_memory_readable(start, 16));
            assert!(!is_memory_readable(start, 17));
            libc::munmap(base, 2 * page_size);
        }
    }
}
