// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Main thread deadlock detection.
//!
//! The application calls [DeadlockMonitor::heartbeat] from its main thread at least once per
//! watchdog interval. A watchdog thread wakes up every interval; if no heartbeat arrived since
//! its last check, the main thread is reported as deadlocked and the process aborts.
//!
//! The watchdog is only armed by the first heartbeat, so an application that never sends one
//! is never reported.

use super::event::{CrashEvent, CrashKind, EventIdSlot, EVENT_ID_LENGTH};
use super::{handle_exception, notify_fatal_exception_captured, MonitorApi, MonitorType};
use crate::collector::machine_context::MachineContext;
use crate::collector::stack_cursor::StackCursor;
use crate::collector::threads::{current_thread_id, main_thread_id};
use crate::context::context;
use crate::shared::constants::{DEFAULT_DEADLOCK_WATCHDOG_INTERVAL, MAX_STACK_DEPTH};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::OnceLock;
use std::time::Duration;

pub struct DeadlockMonitor {
    enabled: AtomicBool,
    event_id: EventIdSlot,
    interval_ms: AtomicU64,
    armed: AtomicBool,
    awaiting_heartbeat: AtomicBool,
    watchdog: OnceLock<std::thread::JoinHandle<()>>,
}

impl DeadlockMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            event_id: EventIdSlot::new(),
            interval_ms: AtomicU64::new(DEFAULT_DEADLOCK_WATCHDOG_INTERVAL.as_millis() as u64),
            armed: AtomicBool::new(false),
            awaiting_heartbeat: AtomicBool::new(false),
            watchdog: OnceLock::new(),
        }
    }

    /// Sets how long the main thread may go without a heartbeat. Zero turns the watchdog off.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms.store(interval.as_millis() as u64, SeqCst);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(SeqCst))
    }

    /// Tells the watchdog the main thread is responsive.
    pub fn heartbeat(&self) {
        self.awaiting_heartbeat.store(false, SeqCst);
        self.armed.store(true, SeqCst);
    }

    /// Called once per interval. True if no heartbeat arrived since the previous call.
    fn missed_heartbeat(&self) -> bool {
        self.armed.load(SeqCst) && self.awaiting_heartbeat.swap(true, SeqCst)
    }

    fn start_watchdog(&'static self) -> bool {
        if self.watchdog.get().is_some() {
            return true;
        }
        let spawned = std::thread::Builder::new()
            .name("crashee-deadlock-watchdog".to_owned())
            .spawn(move || self.watch());
        match spawned {
            Ok(handle) => {
                let _ = self.watchdog.set(handle);
                true
            }
            Err(e) => {
                tracing::error!("Could not start the deadlock watchdog: {e}");
                false
            }
        }
    }

    fn watch(&self) {
        context().suspension.add_reserved_thread(current_thread_id());
        loop {
            let interval = self.interval();
            if interval.is_zero() {
                std::thread::sleep(DEFAULT_DEADLOCK_WATCHDOG_INTERVAL);
                continue;
            }
            std::thread::sleep(interval);
            if self.is_enabled() && self.missed_heartbeat() {
                self.handle_deadlock();
            }
        }
    }

    fn handle_deadlock(&self) {
        crash_error!("Main thread missed its heartbeat. Reporting a deadlock.");
        let suspension = &context().suspension;
        suspension.suspend_environment();
        notify_fatal_exception_captured(false);

        let main_thread = main_thread_id();
        let machine = MachineContext::for_suspended_thread(
            main_thread,
            suspension.cpu_state_for(main_thread),
        )
        .into_crashed_context(suspension.thread_list());
        let cursor = StackCursor::from_machine_context(&machine, MAX_STACK_DEPTH);

        let mut id_buffer = [0u8; EVENT_ID_LENGTH];
        let event_id = self.event_id.format(&mut id_buffer);
        let mut event = CrashEvent::new(event_id, CrashKind::Deadlock, &machine, cursor);
        event.registers_are_valid = machine.has_cpu_state();
        handle_exception(&mut event);

        suspension.resume_environment();
        crash_info!("Calling abort()");
        std::process::abort();
    }
}

impl Default for DeadlockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for DeadlockMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MAIN_THREAD_DEADLOCK
    }

    fn set_enabled(&self, enabled: bool) {
        if !enabled {
            self.enabled.store(false, SeqCst);
            return;
        }
        if self.enabled.load(SeqCst) {
            return;
        }
        self.event_id.regenerate();
        // Do not carry a stale heartbeat into the new period.
        self.awaiting_heartbeat.store(false, SeqCst);
        if context().monitors.deadlock.start_watchdog() {
            self.enabled.store(true, SeqCst);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_watchdog_never_fires() {
        let monitor = DeadlockMonitor::new();
        assert!(!monitor.missed_heartbeat());
        assert!(!monitor.missed_heartbeat());
    }

    #[test]
    fn test_missed_heartbeat() {
        let monitor = DeadlockMonitor::new();
        monitor.heartbeat();
        // First check opens the period.
        assert!(!monitor.missed_heartbeat());
        monitor.heartbeat();
        assert!(!monitor.missed_heartbeat());
        // No heartbeat during this period.
        assert!(monitor.missed_heartbeat());
    }

    #[test]
    fn test_interval() {
        let monitor = DeadlockMonitor::new();
        assert_eq!(monitor.interval(), DEFAULT_DEADLOCK_WATCHDOG_INTERVAL);
        monitor.set_interval(Duration::from_millis(1500));
        assert_eq!(monitor.interval(), Duration::from_millis(1500));
    }
}
