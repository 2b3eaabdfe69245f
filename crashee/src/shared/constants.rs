// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const CRASHEE_REPORT_VERSION: &str = "3.2.0";

/// Threads captured per crash. Extra threads are dropped and logged.
pub const MAX_CAPTURED_THREADS: usize = 100;
/// Threads the reporter itself depends on and never suspends.
pub const MAX_RESERVED_THREADS: usize = 10;

pub const MAX_PATH_LENGTH: usize = 500;
pub const REPORT_WRITE_BUFFER_SIZE: usize = 1024;
pub const JSON_MAX_CONTAINER_DEPTH: usize = 200;

/// Frames kept by a backtrace buffer.
pub const MAX_BACKTRACE_FRAMES: usize = 256;
/// Frames written per thread backtrace.
pub const MAX_STACK_DEPTH: usize = 100;
/// A walk that is still producing frames past this depth is treated as a
/// stack overflow.
pub const STACK_OVERFLOW_THRESHOLD: usize = 150;

pub const DEFAULT_MEMORY_SEARCH_DEPTH: i32 = 15;
pub const MIN_STRING_LENGTH: usize = 4;
pub const MAX_STRING_CHECK_LENGTH: usize = 500;
pub const MAX_INTROSPECTED_IVARS: usize = 10;
pub const MAX_INTROSPECTED_STRING_LENGTH: usize = 200;

/// Words searched for notable addresses behind/ahead of the stack pointer.
pub const STACK_NOTABLE_SEARCH_BACK_DISTANCE: usize = 20;
pub const STACK_NOTABLE_SEARCH_FORWARD_DISTANCE: usize = 10;
/// Words dumped behind/ahead of the stack pointer.
pub const STACK_CONTENTS_PUSHED_DISTANCE: usize = 20;
pub const STACK_CONTENTS_POPPED_DISTANCE: usize = 10;

pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;
pub const DEFAULT_DEADLOCK_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
/// How long suspension waits for every signalled thread to park.
pub const SUSPEND_TIMEOUT: Duration = Duration::from_millis(250);

pub const APP_STATE_FORMAT_VERSION: i64 = 1;

pub const REPORTS_DIR: &str = "Reports";
pub const DATA_DIR: &str = "Data";
pub const CRASH_STATE_FILE: &str = "CrashState.json";
pub const CONSOLE_LOG_FILE: &str = "ConsoleLog.txt";
