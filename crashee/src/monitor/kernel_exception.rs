// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kernel level exceptions. Linux delivers these as signals, so this monitor never turns on and
//! the signal monitor does the work.

use super::{MonitorApi, MonitorType};

pub struct KernelExceptionMonitor;

impl KernelExceptionMonitor {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for KernelExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for KernelExceptionMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::KERNEL_EXCEPTION
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            crash_debug!("Kernel exceptions are reported as signals on this platform");
        }
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_to_enable() {
        let monitor = KernelExceptionMonitor::new();
        monitor.set_enabled(true);
        assert!(!monitor.is_enabled());
    }
}
