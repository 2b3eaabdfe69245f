// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enables monitors by mask and runs crash episodes through them.

use super::event::CrashEvent;
use super::{MonitorApi, MonitorType};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::OnceLock;

/// Receives every fully enriched event. Runs on the crash path.
pub type EventCallback = fn(&mut CrashEvent<'_>);

/// State of the monitor set shared by every crash episode.
///
/// The monitors themselves are passed in by the caller, in registration order, so that the
/// same state machine drives the process-wide monitors and test doubles.
pub struct MonitorRegistry {
    active: AtomicU32,
    /// Once a monitor had to run in a signal handler, async-unsafe monitors stay off.
    requires_async_safety: AtomicBool,
    handling_fatal_exception: AtomicBool,
    crashed_during_exception_handling: AtomicBool,
    debugger_warning_shown: AtomicBool,
    event_callback: OnceLock<EventCallback>,
}

impl MonitorRegistry {
    pub const fn new() -> Self {
        Self {
            active: AtomicU32::new(0),
            requires_async_safety: AtomicBool::new(false),
            handling_fatal_exception: AtomicBool::new(false),
            crashed_during_exception_handling: AtomicBool::new(false),
            debugger_warning_shown: AtomicBool::new(false),
            event_callback: OnceLock::new(),
        }
    }

    /// Sets the callback every episode ends in. Only the first call has an effect.
    pub fn set_event_callback(&self, callback: EventCallback) {
        if self.event_callback.set(callback).is_err() {
            tracing::debug!("Event callback already registered");
        }
    }

    pub fn active_monitors(&self) -> MonitorType {
        MonitorType::from_bits_truncate(self.active.load(SeqCst))
    }

    pub fn requires_async_safety(&self) -> bool {
        self.requires_async_safety.load(SeqCst)
    }

    pub fn is_handling_fatal_exception(&self) -> bool {
        self.handling_fatal_exception.load(SeqCst)
    }

    /// Enables the monitors in `mask` and disables the others, then records which monitors
    /// actually ended up enabled.
    ///
    /// Debugger-unsafe monitors are dropped from the mask when a debugger is attached, and
    /// async-unsafe ones once the process required async safety.
    pub fn set_active_monitors(&self, monitors: &[&dyn MonitorApi], mask: MonitorType) -> MonitorType {
        // The debugger check reads /proc, so it only runs when it can change the outcome. This is
        // also called from the crash path with an empty mask.
        let debugger_attached = mask.intersects(MonitorType::DEBUGGER_UNSAFE) && is_debugger_attached();
        self.apply_active_monitors(monitors, mask, debugger_attached)
    }

    fn apply_active_monitors(
        &self,
        monitors: &[&dyn MonitorApi],
        mut mask: MonitorType,
        debugger_attached: bool,
    ) -> MonitorType {
        if debugger_attached && mask.intersects(MonitorType::DEBUGGER_UNSAFE) {
            if !self.debugger_warning_shown.swap(true, SeqCst) {
                crash_warn!(
                    "The process is being traced. Crash monitoring that conflicts with a debugger is disabled."
                );
            }
            mask &= MonitorType::DEBUGGER_SAFE;
        }
        if self.requires_async_safety() && mask.intersects(MonitorType::ASYNC_UNSAFE) {
            crash_debug!(
                "Async-safe environment detected. Masking out unsafe monitors: {:#x}",
                mask.bits()
            );
            mask &= MonitorType::ASYNC_SAFE;
        }

        crash_debug!("Changing active monitors from {:#x} to {:#x}", self.active.load(SeqCst), mask.bits());

        let mut active = MonitorType::NONE;
        for monitor in monitors {
            monitor.set_enabled(mask.contains(monitor.monitor_type()));
            if monitor.is_enabled() {
                active |= monitor.monitor_type();
            } else if mask.contains(monitor.monitor_type()) {
                crash_warn!("Monitor {:#x} could not be enabled", monitor.monitor_type().bits());
            }
        }

        crash_debug!("Active monitors are now {:#x}", active.bits());
        self.active.store(active.bits(), SeqCst);
        active
    }

    /// Marks the start of a fatal crash episode. `is_async_safe_environment` tells whether the
    /// caller runs in a signal handler.
    ///
    /// Returns true if an episode was already running, which means the reporter itself crashed.
    /// Every monitor is disabled in that case.
    pub fn notify_fatal_exception_captured(
        &self,
        monitors: &[&dyn MonitorApi],
        is_async_safe_environment: bool,
    ) -> bool {
        if is_async_safe_environment {
            self.requires_async_safety.store(true, SeqCst);
        }
        if self.handling_fatal_exception.swap(true, SeqCst) {
            self.crashed_during_exception_handling.store(true, SeqCst);
        }
        let recrashed = self.crashed_during_exception_handling.load(SeqCst);
        if recrashed {
            crash_info!("Detected crash in the crash reporter. Uninstalling crash monitors.");
            self.set_active_monitors(monitors, MonitorType::NONE);
        }
        recrashed
    }

    /// Runs one episode: stamps the shared flags on `event`, lets each enabled monitor add its
    /// information in registration order, and calls the event callback once.
    ///
    /// After a fatal episode monitoring is torn down, leaving the crash to the default
    /// dispositions. Snapshots leave it running.
    pub fn handle_exception(&self, monitors: &[&dyn MonitorApi], event: &mut CrashEvent<'_>) {
        event.requires_async_safety = self.requires_async_safety();
        if self.crashed_during_exception_handling.load(SeqCst) {
            event.crashed_during_crash_handling = true;
        }
        for monitor in monitors {
            if monitor.is_enabled() {
                monitor.add_contextual_info(event);
            }
        }

        match self.event_callback.get() {
            Some(callback) => callback(event),
            None => crash_error!("No event callback registered, dropping crash event"),
        }

        if event.is_snapshot() {
            self.handling_fatal_exception.store(false, SeqCst);
        } else if self.handling_fatal_exception.load(SeqCst)
            && !self.crashed_during_exception_handling.load(SeqCst)
        {
            crash_debug!("Exception is fatal. Restoring original handlers.");
            self.set_active_monitors(monitors, MonitorType::NONE);
        }
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a tracer is attached, read from `TracerPid` in `/proc/self/status`.
pub fn is_debugger_attached() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
        Err(e) => {
            tracing::debug!("Could not read /proc/self/status: {e}");
            false
        }
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::machine_context::MachineContext;
    use crate::collector::stack_cursor::StackCursor;
    use crate::monitor::event::CrashKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeMonitor {
        monitor_type: MonitorType,
        enabled: AtomicBool,
        refuses: bool,
    }

    impl FakeMonitor {
        const fn new(monitor_type: MonitorType) -> Self {
            Self {
                monitor_type,
                enabled: AtomicBool::new(false),
                refuses: false,
            }
        }

        const fn refusing(monitor_type: MonitorType) -> Self {
            Self {
                monitor_type,
                enabled: AtomicBool::new(false),
                refuses: true,
            }
        }
    }

    impl MonitorApi for FakeMonitor {
        fn monitor_type(&self) -> MonitorType {
            self.monitor_type
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled && !self.refuses, SeqCst);
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(SeqCst)
        }

        fn add_contextual_info(&self, event: &mut CrashEvent<'_>) {
            // Records the order monitors were called in, one bit position per call.
            event.fault_address = event.fault_address * 0x1000 + self.monitor_type.bits() as usize;
        }
    }

    fn fakes() -> Vec<FakeMonitor> {
        vec![
            FakeMonitor::refusing(MonitorType::KERNEL_EXCEPTION),
            FakeMonitor::new(MonitorType::SIGNAL),
            FakeMonitor::new(MonitorType::NATIVE_EXCEPTION),
            FakeMonitor::new(MonitorType::USER_REPORTED),
            FakeMonitor::new(MonitorType::SYSTEM),
        ]
    }

    fn as_api(monitors: &[FakeMonitor]) -> Vec<&dyn MonitorApi> {
        monitors.iter().map(|m| m as &dyn MonitorApi).collect()
    }

    #[test]
    fn test_refusing_monitor_is_left_out_of_active_mask() {
        let registry = MonitorRegistry::new();
        let monitors = fakes();
        let active = registry.apply_active_monitors(&as_api(&monitors), MonitorType::ALL, false);
        assert_eq!(
            active,
            MonitorType::SIGNAL
                | MonitorType::NATIVE_EXCEPTION
                | MonitorType::USER_REPORTED
                | MonitorType::SYSTEM
        );
        assert_eq!(registry.active_monitors(), active);

        let active = registry.apply_active_monitors(&as_api(&monitors), MonitorType::SYSTEM, false);
        assert_eq!(active, MonitorType::SYSTEM);
        assert!(!monitors[1].is_enabled());
    }

    #[test]
    fn test_debugger_masks_out_unsafe_monitors() {
        let registry = MonitorRegistry::new();
        let monitors = fakes();
        for mask in [MonitorType::ALL, MonitorType::SIGNAL, MonitorType::MANUAL] {
            let active = registry.apply_active_monitors(&as_api(&monitors), mask, true);
            assert!(!active.intersects(MonitorType::DEBUGGER_UNSAFE), "{mask:?}");
        }
    }

    #[test]
    fn test_async_safety_is_sticky() {
        let registry = MonitorRegistry::new();
        let monitors = fakes();
        let apis = as_api(&monitors);
        registry.apply_active_monitors(&apis, MonitorType::ALL, false);

        assert!(!registry.notify_fatal_exception_captured(&apis, true));
        assert!(registry.requires_async_safety());

        for _ in 0..2 {
            let active = registry.apply_active_monitors(&apis, MonitorType::ALL, false);
            assert_eq!(active, MonitorType::SIGNAL);
        }
        // A later synchronous episode does not clear it.
        registry.notify_fatal_exception_captured(&apis, false);
        assert!(registry.requires_async_safety());
    }

    #[test]
    fn test_second_fatal_notification_is_a_recrash() {
        let registry = MonitorRegistry::new();
        let monitors = fakes();
        let apis = as_api(&monitors);
        registry.apply_active_monitors(&apis, MonitorType::ALL, false);

        assert!(!registry.notify_fatal_exception_captured(&apis, false));
        assert!(!registry.active_monitors().is_empty());
        assert!(registry.notify_fatal_exception_captured(&apis, false));
        assert_eq!(registry.active_monitors(), MonitorType::NONE);
        assert!(monitors.iter().all(|m| !m.is_enabled()));
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static SEEN: Mutex<Vec<(usize, bool)>> = Mutex::new(Vec::new());

    fn record_event(event: &mut CrashEvent<'_>) {
        CALLS.fetch_add(1, SeqCst);
        SEEN.lock()
            .unwrap()
            .push((event.fault_address, event.crashed_during_crash_handling));
    }

    #[test]
    fn test_handle_exception_enriches_then_tears_down() {
        let registry = MonitorRegistry::new();
        registry.set_event_callback(record_event);
        let monitors = fakes();
        let apis = as_api(&monitors);
        registry.apply_active_monitors(&apis, MonitorType::SIGNAL | MonitorType::SYSTEM, false);

        let context = MachineContext::empty();
        let user = CrashKind::UserReported {
            name: "Boom",
            language: None,
            line_of_code: None,
            custom_stack_trace: None,
            terminate_program: false,
        };
        let calls_before = CALLS.load(SeqCst);

        // A snapshot keeps monitoring on.
        registry.notify_fatal_exception_captured(&apis, false);
        let mut event = CrashEvent::new("id", user, &context, StackCursor::empty());
        registry.handle_exception(&apis, &mut event);
        assert_eq!(event.fault_address, 0x02 * 0x1000 + 0x40);
        assert!(!registry.is_handling_fatal_exception());
        assert_eq!(registry.active_monitors(), MonitorType::SIGNAL | MonitorType::SYSTEM);

        // A fatal episode turns it off.
        registry.notify_fatal_exception_captured(&apis, true);
        let mut event = CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty());
        registry.handle_exception(&apis, &mut event);
        assert!(event.requires_async_safety);
        assert!(!event.crashed_during_crash_handling);
        assert_eq!(registry.active_monitors(), MonitorType::NONE);

        assert!(CALLS.load(SeqCst) - calls_before >= 2);
    }

    #[test]
    fn test_recrash_is_stamped_on_event() {
        let registry = MonitorRegistry::new();
        registry.set_event_callback(record_event);
        let monitors = fakes();
        let apis = as_api(&monitors);
        registry.apply_active_monitors(&apis, MonitorType::ALL, false);

        registry.notify_fatal_exception_captured(&apis, false);
        assert!(registry.notify_fatal_exception_captured(&apis, false));
        let context = MachineContext::empty();
        let mut event = CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty());
        registry.handle_exception(&apis, &mut event);
        assert!(event.crashed_during_crash_handling);
        // Every monitor was already off, so none contributed.
        assert_eq!(event.fault_address, 0);
    }

    #[test]
    fn test_tracer_pid_parsing() {
        let status = "Name:\tcat\nState:\tR (running)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("TracerPid:\t0\n"), Some(0));
        assert_eq!(tracer_pid("Name:\tcat\n"), None);
    }
}
