// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exceptions the application reports itself, fatal or not.

use super::event::{CrashEvent, CrashKind, EVENT_ID_LENGTH};
use super::{handle_exception, notify_fatal_exception_captured, MonitorApi, MonitorType};
use crate::collector::machine_context::MachineContext;
use crate::collector::stack_cursor::StackCursor;
use crate::collector::threads::{current_thread_id, ThreadList};
use crate::context::context;
use crate::monitor::event::format_event_id;
use crate::shared::constants::MAX_STACK_DEPTH;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

/// What the application says about the exception it reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserException<'a> {
    pub name: &'a str,
    pub reason: Option<&'a str>,
    pub language: Option<&'a str>,
    pub line_of_code: Option<&'a str>,
    /// JSON array describing the stack in the reporter's own terms.
    pub stack_trace: Option<&'a str>,
    /// Suspend and record every thread rather than only the caller.
    pub log_all_threads: bool,
    /// Abort once the report is written.
    pub terminate_program: bool,
}

pub struct UserReportedMonitor {
    enabled: AtomicBool,
}

impl UserReportedMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    /// Writes a report for `exception`. Aborts afterwards if it asks to terminate the program.
    ///
    /// Returns false if the monitor is disabled and nothing was reported.
    #[inline(never)]
    pub fn report(&self, exception: &UserException<'_>) -> bool {
        if !self.is_enabled() {
            tracing::warn!(
                "User reported exception monitor is not installed. Exception {} has not been recorded",
                exception.name
            );
            return false;
        }
        let suspension = &context().suspension;
        if exception.terminate_program {
            notify_fatal_exception_captured(false);
        }

        let threads = if exception.log_all_threads {
            suspension.suspend_environment();
            suspension.thread_list()
        } else {
            let mut threads = ThreadList::new();
            threads.push(current_thread_id());
            threads
        };
        let machine = MachineContext::for_current_thread(true, threads);
        let cursor = StackCursor::capture_current(None, MAX_STACK_DEPTH);

        // Every user report gets its own id, as several can be written by one process.
        let id = uuid::Uuid::new_v4();
        let mut id_buffer = [0u8; EVENT_ID_LENGTH];
        let event_id = format_event_id(id.as_bytes(), &mut id_buffer);

        let mut event = CrashEvent::new(
            event_id,
            CrashKind::UserReported {
                name: exception.name,
                language: exception.language,
                line_of_code: exception.line_of_code,
                custom_stack_trace: exception.stack_trace,
                terminate_program: exception.terminate_program,
            },
            &machine,
            cursor,
        );
        event.crash_reason = exception.reason;
        handle_exception(&mut event);

        if exception.log_all_threads {
            suspension.resume_environment();
        }
        if exception.terminate_program {
            std::process::abort();
        }
        true
    }
}

impl Default for UserReportedMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for UserReportedMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::USER_REPORTED
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}
