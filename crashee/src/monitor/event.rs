// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The record built up during one crash episode.
//!
//! An event is created on the stack of the monitor that caught the crash, enriched by every
//! enabled monitor, then handed once to the report writer. Nothing in it owns heap memory: text
//! borrowed from the triggering monitor lives as long as the event, and text copied from other
//! monitors goes into fixed buffers.

use super::app_state::AppStats;
use super::system::{MemoryStats, SystemInfo};
use super::MonitorType;
use crate::collector::machine_context::MachineContext;
use crate::collector::stack_cursor::StackCursor;
use crate::shared::fields::exception_type;
use crate::shared::fmt_buf::FmtBuf;
use std::ffi::CStr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;

/// Length of a textual event id, `8-4-4-4-12` hex digits.
pub const EVENT_ID_LENGTH: usize = 36;

/// What kind of failure triggered the episode, with the details only that kind carries.
#[derive(Debug, Clone, Copy)]
pub enum CrashKind<'a> {
    KernelException {
        exception_type: i64,
        code: i64,
        subcode: i64,
    },
    Signal,
    NativeException {
        name: &'a str,
    },
    ManagedException {
        name: &'a str,
        user_info: Option<&'a str>,
    },
    UserReported {
        name: &'a str,
        language: Option<&'a str>,
        line_of_code: Option<&'a str>,
        /// JSON array describing the stack in the reporter's own terms.
        custom_stack_trace: Option<&'a str>,
        terminate_program: bool,
    },
    Deadlock,
}

impl CrashKind<'_> {
    /// The monitor that raises events of this kind.
    pub fn monitor_type(&self) -> MonitorType {
        match self {
            CrashKind::KernelException { .. } => MonitorType::KERNEL_EXCEPTION,
            CrashKind::Signal => MonitorType::SIGNAL,
            CrashKind::NativeException { .. } => MonitorType::NATIVE_EXCEPTION,
            CrashKind::ManagedException { .. } => MonitorType::MANAGED_EXCEPTION,
            CrashKind::UserReported { .. } => MonitorType::USER_REPORTED,
            CrashKind::Deadlock => MonitorType::MAIN_THREAD_DEADLOCK,
        }
    }

    /// Value of `crash.error.type`.
    pub fn report_type(&self) -> &'static str {
        match self {
            CrashKind::KernelException { .. } => exception_type::MACH,
            CrashKind::Signal => exception_type::SIGNAL,
            CrashKind::NativeException { .. } => exception_type::CPP_EXCEPTION,
            CrashKind::ManagedException { .. } => exception_type::NSEXCEPTION,
            CrashKind::UserReported { .. } => exception_type::USER,
            CrashKind::Deadlock => exception_type::DEADLOCK,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalDetails {
    pub signum: libc::c_int,
    pub sigcode: libc::c_int,
}

/// The last exception object the embedding runtime deallocated.
#[derive(Debug, Clone, Default)]
pub struct ZombieDetails {
    pub address: usize,
    pub name: FmtBuf<128>,
    pub reason: FmtBuf<256>,
}

#[derive(Debug, Clone)]
pub struct CrashEvent<'a> {
    pub event_id: &'a str,
    pub kind: CrashKind<'a>,
    /// Set when any monitor of the process ever had to run in a signal handler.
    pub requires_async_safety: bool,
    pub crashed_during_crash_handling: bool,
    pub registers_are_valid: bool,
    pub is_stack_overflow: bool,
    pub fault_address: usize,
    pub crash_reason: Option<&'a str>,
    pub offending_context: &'a MachineContext,
    /// Cursor over the offending thread's stack. The report writer walks a copy.
    pub stack_cursor: StackCursor,
    pub signal: SignalDetails,
    pub app_stats: AppStats,
    pub zombie: ZombieDetails,
    pub system: Option<&'a SystemInfo>,
    pub memory: MemoryStats,
    pub console_log_path: Option<&'a CStr>,
}

impl<'a> CrashEvent<'a> {
    pub fn new(
        event_id: &'a str,
        kind: CrashKind<'a>,
        offending_context: &'a MachineContext,
        stack_cursor: StackCursor,
    ) -> Self {
        Self {
            event_id,
            kind,
            requires_async_safety: false,
            crashed_during_crash_handling: false,
            registers_are_valid: false,
            is_stack_overflow: false,
            fault_address: 0,
            crash_reason: None,
            offending_context,
            stack_cursor,
            signal: SignalDetails::default(),
            app_stats: AppStats::default(),
            zombie: ZombieDetails::default(),
            system: None,
            memory: MemoryStats::default(),
            console_log_path: None,
        }
    }

    /// A report the application asked for while it keeps running.
    /// Such episodes do not tear monitoring down.
    pub fn is_snapshot(&self) -> bool {
        matches!(
            self.kind,
            CrashKind::UserReported {
                terminate_program: false,
                ..
            }
        )
    }
}

/// The id the next event of a monitor will carry. Regenerated in normal context, read on the
/// crash path without locking.
pub struct EventIdSlot {
    bytes: [AtomicU8; 16],
}

impl EventIdSlot {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU8 = AtomicU8::new(0);
        Self { bytes: [ZERO; 16] }
    }

    /// Draws a fresh random id. Allocates nothing, but reads the OS random source.
    pub fn regenerate(&self) {
        let id = uuid::Uuid::new_v4();
        for (slot, byte) in self.bytes.iter().zip(id.as_bytes()) {
            slot.store(*byte, Relaxed);
        }
    }

    pub fn load(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (byte, slot) in bytes.iter_mut().zip(&self.bytes) {
            *byte = slot.load(Relaxed);
        }
        bytes
    }

    /// The id in textual form, written into `buffer`.
    pub fn format<'b>(&self, buffer: &'b mut [u8; EVENT_ID_LENGTH]) -> &'b str {
        format_event_id(&self.load(), buffer)
    }
}

impl Default for EventIdSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats 16 random bytes as an uppercase `8-4-4-4-12` id into `buffer`.
pub fn format_event_id<'a>(bytes: &[u8; 16], buffer: &'a mut [u8; EVENT_ID_LENGTH]) -> &'a str {
    uuid::Uuid::from_bytes(*bytes)
        .hyphenated()
        .encode_upper(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(CrashKind::Signal.report_type(), "signal");
        assert_eq!(CrashKind::Deadlock.monitor_type(), MonitorType::MAIN_THREAD_DEADLOCK);
        assert_eq!(
            CrashKind::NativeException { name: "x" }.report_type(),
            "cpp_exception"
        );
    }

    #[test]
    fn test_only_non_terminating_user_reports_are_snapshots() {
        let context = MachineContext::empty();
        let user = |terminate_program| CrashKind::UserReported {
            name: "Boom",
            language: None,
            line_of_code: None,
            custom_stack_trace: None,
            terminate_program,
        };
        assert!(CrashEvent::new("id", user(false), &context, StackCursor::empty()).is_snapshot());
        assert!(!CrashEvent::new("id", user(true), &context, StackCursor::empty()).is_snapshot());
        assert!(!CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty()).is_snapshot());
    }

    #[test]
    fn test_event_id_format() {
        let mut buffer = [0u8; EVENT_ID_LENGTH];
        let id = format_event_id(&[0xab; 16], &mut buffer);
        assert_eq!(id, "ABABABAB-ABAB-ABAB-ABAB-ABABABABABAB");
    }

    #[test]
    fn test_event_id_slot_regenerates() {
        let slot = EventIdSlot::new();
        assert_eq!(slot.load(), [0; 16]);
        slot.regenerate();
        let first = slot.load();
        slot.regenerate();
        assert_ne!(first, slot.load());
        let mut buffer = [0u8; EVENT_ID_LENGTH];
        assert_eq!(slot.format(&mut buffer).len(), EVENT_ID_LENGTH);
    }
}
