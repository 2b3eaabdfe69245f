// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remembers the last exception object the embedding runtime deallocated, so that a crash caused
//! by a dangling reference to it can be traced back.

use super::event::{CrashEvent, ZombieDetails};
use super::{MonitorApi, MonitorType};
use crate::shared::fmt_buf::FmtBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Mutex;

pub struct ZombieMonitor {
    enabled: AtomicBool,
    last_exception: Mutex<ZombieDetails>,
}

impl ZombieMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            last_exception: Mutex::new(ZombieDetails {
                address: 0,
                name: FmtBuf::new(),
                reason: FmtBuf::new(),
            }),
        }
    }

    /// Records a deallocated exception. Name and reason are truncated to fit.
    pub fn notify_exception_deallocated(&self, address: usize, name: &str, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut last = self.last_exception.lock().unwrap_or_else(|e| e.into_inner());
        last.address = address;
        last.name.clear();
        last.name.push_str(name);
        last.reason.clear();
        last.reason.push_str(reason);
    }
}

impl Default for ZombieMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for ZombieMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::ZOMBIE
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, event: &mut CrashEvent<'_>) {
        match self.last_exception.try_lock() {
            Ok(last) => event.zombie = last.clone(),
            Err(_) => crash_warn!("Zombie record is locked, leaving it out of the report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::machine_context::MachineContext;
    use crate::collector::stack_cursor::StackCursor;
    use crate::monitor::event::CrashKind;

    #[test]
    fn test_records_only_when_enabled() {
        let monitor = ZombieMonitor::new();
        monitor.notify_exception_deallocated(0x10, "Ignored", "not enabled");

        let context = MachineContext::empty();
        let mut event = CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty());
        monitor.add_contextual_info(&mut event);
        assert_eq!(event.zombie.address, 0);

        monitor.set_enabled(true);
        monitor.notify_exception_deallocated(0xdead, "NSRangeException", "index 3 beyond bounds");
        monitor.add_contextual_info(&mut event);
        assert_eq!(event.zombie.address, 0xdead);
        assert_eq!(event.zombie.name.as_str(), "NSRangeException");
        assert_eq!(event.zombie.reason.as_str(), "index 3 beyond bounds");
    }
}
