// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Uncaught native exceptions, which for Rust code are panics.
//!
//! The panic hook is registered on the first enable and never unregistered: the hook cannot be
//! swapped while another thread is panicking, so a disabled monitor leaves it in place and lets
//! panics through to the previous hook untouched.
//!
//! A panic that reaches the hook while the monitor is enabled is treated as fatal. It is
//! reported, the previous hook runs, and the process aborts.

use super::event::{CrashEvent, CrashKind, EventIdSlot, EVENT_ID_LENGTH};
use super::{handle_exception, notify_fatal_exception_captured, MonitorApi, MonitorType};
use crate::collector::machine_context::MachineContext;
use crate::collector::stack_cursor::StackCursor;
use crate::context::context;
use crate::shared::constants::MAX_STACK_DEPTH;
use crate::shared::fmt_buf::FmtBuf;
use std::fmt::Write as _;
use std::panic::{self, PanicHookInfo};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Once;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(std::ptr::null_mut());

const PANIC_REASON_CAPACITY: usize = 1024;

pub struct NativeExceptionMonitor {
    enabled: AtomicBool,
    event_id: EventIdSlot,
}

impl NativeExceptionMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            event_id: EventIdSlot::new(),
        }
    }
}

impl Default for NativeExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for NativeExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::NATIVE_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && !self.enabled.load(SeqCst) {
            self.event_id.regenerate();
            if std::thread::panicking() {
                crash_warn!("Cannot register the panic hook while panicking");
                return;
            }
            register_panic_hook();
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

/// Registers the panic hook once, keeping the previous one to chain to.
fn register_panic_hook() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let old_hook = panic::take_hook();
        PREVIOUS_PANIC_HOOK.store(Box::into_raw(Box::new(old_hook)), SeqCst);
        panic::set_hook(Box::new(handle_panic));
    });
}

fn call_previous_panic_hook(info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // SAFETY: set once from `Box::into_raw` and never freed.
        let old_hook = unsafe { &*old_hook_ptr };
        old_hook(info);
    }
}

fn handle_panic(info: &PanicHookInfo<'_>) {
    let monitor = &context().monitors.native_exception;
    if !monitor.is_enabled() {
        call_previous_panic_hook(info);
        return;
    }
    report_panic(monitor, info);
    call_previous_panic_hook(info);
    std::process::abort();
}

/// The type name shown as the exception name.
fn payload_type(info: &PanicHookInfo<'_>) -> &'static str {
    let payload = info.payload();
    if payload.is::<&str>() {
        "&str"
    } else if payload.is::<String>() {
        "alloc::string::String"
    } else {
        "core::panic::PanicPayload"
    }
}

/// `message at file:line:column`, truncated to the buffer.
fn panic_reason(info: &PanicHookInfo<'_>) -> FmtBuf<PANIC_REASON_CAPACITY> {
    let mut reason = FmtBuf::new();
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    let _ = reason.write_str(message);
    if let Some(location) = info.location() {
        let _ = write!(
            reason,
            " at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    reason
}

#[inline(never)]
fn report_panic(monitor: &NativeExceptionMonitor, info: &PanicHookInfo<'_>) {
    crash_debug!("Trapped panic");
    let suspension = &context().suspension;
    notify_fatal_exception_captured(false);
    suspension.suspend_environment();

    let machine = MachineContext::for_current_thread(true, suspension.thread_list());
    let cursor = StackCursor::capture_current(None, MAX_STACK_DEPTH);
    let reason = panic_reason(info);

    let mut id_buffer = [0u8; EVENT_ID_LENGTH];
    let event_id = monitor.event_id.format(&mut id_buffer);
    let mut event = CrashEvent::new(
        event_id,
        CrashKind::NativeException {
            name: payload_type(info),
        },
        &machine,
        cursor,
    );
    event.crash_reason = Some(reason.as_str());
    handle_exception(&mut event);

    suspension.resume_environment();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_panic_details() {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let detail = (payload_type(info), panic_reason(info).as_str().to_owned());
            *sink.lock().unwrap() = Some(detail);
        }));
        let outcome = panic::catch_unwind(|| panic!("boom {}", 7));
        panic::set_hook(previous);
        assert!(outcome.is_err());

        let (name, reason) = captured.lock().unwrap().take().unwrap();
        assert_eq!(name, "alloc::string::String");
        assert!(reason.starts_with("boom 7 at "), "{reason}");
        assert!(reason.contains("native_exception.rs"), "{reason}");
    }

    #[test]
    fn test_disabled_by_default() {
        let monitor = NativeExceptionMonitor::new();
        assert!(!monitor.is_enabled());
        assert_eq!(monitor.monitor_type(), MonitorType::NATIVE_EXCEPTION);
    }
}
