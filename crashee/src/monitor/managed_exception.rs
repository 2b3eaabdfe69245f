// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Uncaught exceptions of a managed runtime embedding the reporter.
//!
//! The runtime catches its own exceptions and hands them over with the call stack it recorded
//! when the exception was thrown.

use super::event::{CrashEvent, CrashKind, EventIdSlot, EVENT_ID_LENGTH};
use super::{handle_exception, notify_fatal_exception_captured, MonitorApi, MonitorType};
use crate::collector::machine_context::MachineContext;
use crate::collector::stack_cursor::StackCursor;
use crate::context::context;
use crate::shared::constants::MAX_STACK_DEPTH;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

pub struct ManagedExceptionMonitor {
    enabled: AtomicBool,
    event_id: EventIdSlot,
}

impl ManagedExceptionMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            event_id: EventIdSlot::new(),
        }
    }

    /// Reports an uncaught exception. `call_stack` holds return addresses, innermost first.
    ///
    /// Returns false if the monitor is disabled and nothing was reported.
    pub fn report(
        &self,
        name: &str,
        reason: Option<&str>,
        user_info: Option<&str>,
        call_stack: &[usize],
    ) -> bool {
        if !self.is_enabled() {
            tracing::debug!("Managed exception monitor is disabled, not reporting {name}");
            return false;
        }
        crash_debug!("Trapped managed exception {}", name);
        let suspension = &context().suspension;
        notify_fatal_exception_captured(false);
        suspension.suspend_environment();

        let machine = MachineContext::for_current_thread(true, suspension.thread_list());
        let cursor = if call_stack.is_empty() {
            StackCursor::capture_current(None, MAX_STACK_DEPTH)
        } else {
            StackCursor::from_backtrace(call_stack, 0, MAX_STACK_DEPTH)
        };

        let mut id_buffer = [0u8; EVENT_ID_LENGTH];
        let event_id = self.event_id.format(&mut id_buffer);
        let mut event = CrashEvent::new(
            event_id,
            CrashKind::ManagedException { name, user_info },
            &machine,
            cursor,
        );
        event.crash_reason = reason;
        handle_exception(&mut event);

        suspension.resume_environment();
        true
    }
}

impl Default for ManagedExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for ManagedExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MANAGED_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, SeqCst) != enabled && enabled {
            self.event_id.regenerate();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}
