// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-safe logging.
//!
//! Code running on the crash path cannot use `tracing`: subscribers allocate and take locks.
//! The `crash_*!` macros format into a stack buffer and hand the bytes to `write(2)`, both on
//! stderr and on the console log file that is later embedded in the report's `debug` block.

use super::fmt_buf::FmtBuf;
use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI32, AtomicU8};
use std::sync::Mutex;

const LOG_LINE_CAPACITY: usize = 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static LOG_FD: AtomicI32 = AtomicI32::new(-1);
static LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, SeqCst);
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(SeqCst)
}

/// Redirects the console log to `path`, or stops writing to a file when `None`.
/// The previous file descriptor is closed.
pub fn set_log_filename(path: Option<&Path>, overwrite: bool) -> std::io::Result<()> {
    let mut guard = LOG_PATH.lock().unwrap_or_else(|e| e.into_inner());
    let new_fd = match path {
        Some(path) => OpenOptions::new()
            .create(true)
            .write(true)
            .append(!overwrite)
            .truncate(overwrite)
            .open(path)?
            .into_raw_fd(),
        None => -1,
    };
    let old_fd = LOG_FD.swap(new_fd, SeqCst);
    if old_fd >= 0 {
        // SAFETY: the fd came from `into_raw_fd` above and is owned by this module.
        unsafe { libc::close(old_fd) };
    }
    *guard = path.map(Path::to_path_buf);
    Ok(())
}

/// Truncates the console log file, keeping it as the log target.
pub fn clear_log_file() -> std::io::Result<()> {
    let path = LOG_PATH
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    match path {
        Some(path) => set_log_filename(Some(&path), true),
        None => Ok(()),
    }
}

/// Writes all of `bytes` to `fd`, retrying on short writes and EINTR.
/// Only calls `write(2)`, which is async-signal-safe.
pub(crate) fn write_all_raw(fd: libc::c_int, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length come from a live slice.
        let written = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            return false;
        }
        if written == 0 {
            return false;
        }
        bytes = &bytes[written as usize..];
    }
    true
}

#[doc(hidden)]
pub fn write_log_line(level: LogLevel, file: &str, line: u32, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let file = file.rsplit('/').next().unwrap_or(file);
    let mut buf = FmtBuf::<LOG_LINE_CAPACITY>::new();
    let _ = write!(buf, "{}: {}:{}: ", level.as_str(), file, line);
    let _ = buf.write_fmt(args);
    if buf.len() == LOG_LINE_CAPACITY - 1 {
        buf.truncate_by(1);
    }
    buf.push_str("\n");

    let fd = LOG_FD.load(SeqCst);
    if fd >= 0 {
        write_all_raw(fd, buf.as_bytes());
    }
    write_all_raw(libc::STDERR_FILENO, buf.as_bytes());
}

#[macro_export]
#[doc(hidden)]
macro_rules! crash_log {
    ($level:expr, $($arg:tt)+) => {
        $crate::shared::log::write_log_line($level, file!(), line!(), format_args!($($arg)+))
    };
}

#[macro_export]
#[doc(hidden)]
macro_rules! crash_error {
    ($($arg:tt)+) => { $crate::crash_log!($crate::shared::log::LogLevel::Error, $($arg)+) };
}

#[macro_export]
#[doc(hidden)]
macro_rules! crash_warn {
    ($($arg:tt)+) => { $crate::crash_log!($crate::shared::log::LogLevel::Warn, $($arg)+) };
}

#[macro_export]
#[doc(hidden)]
macro_rules! crash_info {
    ($($arg:tt)+) => { $crate::crash_log!($crate::shared::log::LogLevel::Info, $($arg)+) };
}

#[macro_export]
#[doc(hidden)]
macro_rules! crash_debug {
    ($($arg:tt)+) => { $crate::crash_log!($crate::shared::log::LogLevel::Debug, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_log_file_receives_lines_and_clears() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ConsoleLog.txt");
        set_log_filename(Some(&path), true)?;

        crash_error!("suspending {} threads", 3);
        let contents = std::fs::read_to_string(&path)?;
        assert!(contents.contains("ERROR: log.rs:"), "{contents}");
        assert!(contents.contains("suspending 3 threads\n"), "{contents}");

        clear_log_file()?;
        assert!(!std::fs::read_to_string(&path)?.contains("suspending 3 threads"));

        crash_warn!("after clear");
        assert!(std::fs::read_to_string(&path)?.contains("after clear"));

        set_log_filename(None, false)?;
        crash_warn!("not in the file");
        assert!(!std::fs::read_to_string(&path)?.contains("not in the file"));
        Ok(())
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Trace);
        assert!(enabled(LogLevel::Error));
    }
}
