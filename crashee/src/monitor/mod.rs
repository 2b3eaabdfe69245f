// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The closed set of monitors, the mask selecting which of them run, and the registry that
//! enables them and dispatches crash events.

pub mod app_state;
pub mod deadlock;
pub mod event;
pub mod kernel_exception;
pub mod managed_exception;
pub mod native_exception;
pub mod registry;
pub mod signal;
pub mod system;
pub mod user;
pub mod zombie;

use crate::context::context;
use bitflags::bitflags;
use event::CrashEvent;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Aspects of the process that can be monitored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MonitorType: u32 {
        /// Kernel level exceptions. Not available on Linux, where they surface as signals.
        const KERNEL_EXCEPTION = 0x01;
        /// Fatal signals.
        const SIGNAL = 0x02;
        /// Uncaught native exceptions. For Rust code, panics.
        const NATIVE_EXCEPTION = 0x04;
        /// Uncaught exceptions of an embedding managed runtime.
        const MANAGED_EXCEPTION = 0x08;
        /// A main thread that stops answering heartbeats.
        const MAIN_THREAD_DEADLOCK = 0x10;
        /// Exceptions reported by the application itself.
        const USER_REPORTED = 0x20;
        /// Injects system information.
        const SYSTEM = 0x40;
        /// Tracks and injects application state.
        const APPLICATION_STATE = 0x80;
        /// Injects the last deallocated exception object.
        const ZOMBIE = 0x100;
    }
}

impl MonitorType {
    pub const NONE: Self = Self::empty();
    pub const ALL: Self = Self::all();
    pub const EXPERIMENTAL: Self = Self::MAIN_THREAD_DEADLOCK;
    pub const DEBUGGER_UNSAFE: Self = Self::KERNEL_EXCEPTION
        .union(Self::SIGNAL)
        .union(Self::NATIVE_EXCEPTION)
        .union(Self::MANAGED_EXCEPTION);
    /// Monitors whose handling may run in a signal handler.
    pub const ASYNC_SAFE: Self = Self::KERNEL_EXCEPTION.union(Self::SIGNAL);
    pub const OPTIONAL: Self = Self::ZOMBIE;
    pub const ASYNC_UNSAFE: Self = Self::ALL.difference(Self::ASYNC_SAFE);
    pub const DEBUGGER_SAFE: Self = Self::ALL.difference(Self::DEBUGGER_UNSAFE);
    pub const PRODUCTION_SAFE: Self = Self::ALL.difference(Self::EXPERIMENTAL);
    pub const PRODUCTION_SAFE_MINIMAL: Self = Self::PRODUCTION_SAFE.difference(Self::OPTIONAL);
    /// Add essential information to reports but never trigger one.
    pub const REQUIRED: Self = Self::SYSTEM.union(Self::APPLICATION_STATE);
    /// Only reports explicitly requested through the API are written.
    pub const MANUAL: Self = Self::REQUIRED.union(Self::USER_REPORTED);

    /// Name of a single monitor bit.
    pub fn name(self) -> Option<&'static str> {
        const NAMES: [(MonitorType, &str); 9] = [
            (MonitorType::KERNEL_EXCEPTION, "KernelException"),
            (MonitorType::SIGNAL, "Signal"),
            (MonitorType::NATIVE_EXCEPTION, "NativeException"),
            (MonitorType::MANAGED_EXCEPTION, "ManagedException"),
            (MonitorType::MAIN_THREAD_DEADLOCK, "MainThreadDeadlock"),
            (MonitorType::USER_REPORTED, "UserReported"),
            (MonitorType::SYSTEM, "System"),
            (MonitorType::APPLICATION_STATE, "ApplicationState"),
            (MonitorType::ZOMBIE, "Zombie"),
        ];
        NAMES
            .iter()
            .find(|(monitor, _)| *monitor == self)
            .map(|(_, name)| *name)
    }
}

impl Default for MonitorType {
    fn default() -> Self {
        Self::PRODUCTION_SAFE_MINIMAL
    }
}

/// What the registry needs from each monitor.
///
/// Implementations must not panic: `set_enabled` runs from the crash path when monitoring is
/// torn down, and `add_contextual_info` runs while the event is being built.
pub trait MonitorApi: Sync {
    fn monitor_type(&self) -> MonitorType;

    /// Turns the monitor on or off. A monitor that cannot turn on stays off, and reports so
    /// through [MonitorApi::is_enabled].
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Adds this monitor's information to an event raised by any monitor.
    fn add_contextual_info(&self, _event: &mut CrashEvent<'_>) {}
}

/// Every monitor, in registration order. Contextual info is added in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    KernelException,
    Signal,
    ManagedException,
    NativeException,
    Deadlock,
    Zombie,
    UserReported,
    System,
    AppState,
}

impl Monitor {
    pub const ALL: [Monitor; 9] = [
        Monitor::KernelException,
        Monitor::Signal,
        Monitor::ManagedException,
        Monitor::NativeException,
        Monitor::Deadlock,
        Monitor::Zombie,
        Monitor::UserReported,
        Monitor::System,
        Monitor::AppState,
    ];

    /// The process-wide instance of this monitor.
    pub fn api(self) -> &'static dyn MonitorApi {
        let monitors = &context().monitors;
        match self {
            Monitor::KernelException => &monitors.kernel_exception,
            Monitor::Signal => &monitors.signal,
            Monitor::ManagedException => &monitors.managed_exception,
            Monitor::NativeException => &monitors.native_exception,
            Monitor::Deadlock => &monitors.deadlock,
            Monitor::Zombie => &monitors.zombie,
            Monitor::UserReported => &monitors.user,
            Monitor::System => &monitors.system,
            Monitor::AppState => &monitors.app_state,
        }
    }
}

/// The registered monitors, in registration order.
pub fn registered_monitors() -> [&'static dyn MonitorApi; 9] {
    Monitor::ALL.map(Monitor::api)
}

/// Starts a fatal episode on the process-wide registry. Returns true on a recrash.
pub fn notify_fatal_exception_captured(is_async_safe_environment: bool) -> bool {
    context()
        .registry
        .notify_fatal_exception_captured(&registered_monitors(), is_async_safe_environment)
}

/// Runs `event` through the process-wide registry.
pub fn handle_exception(event: &mut CrashEvent<'_>) {
    context()
        .registry
        .handle_exception(&registered_monitors(), event)
}

/// Storage of every monitor's state.
pub struct Monitors {
    pub kernel_exception: kernel_exception::KernelExceptionMonitor,
    pub signal: signal::SignalMonitor,
    pub managed_exception: managed_exception::ManagedExceptionMonitor,
    pub native_exception: native_exception::NativeExceptionMonitor,
    pub deadlock: deadlock::DeadlockMonitor,
    pub zombie: zombie::ZombieMonitor,
    pub user: user::UserReportedMonitor,
    pub system: system::SystemMonitor,
    pub app_state: app_state::AppStateMonitor,
}

impl Monitors {
    pub const fn new() -> Self {
        Self {
            kernel_exception: kernel_exception::KernelExceptionMonitor::new(),
            signal: signal::SignalMonitor::new(),
            managed_exception: managed_exception::ManagedExceptionMonitor::new(),
            native_exception: native_exception::NativeExceptionMonitor::new(),
            deadlock: deadlock::DeadlockMonitor::new(),
            zombie: zombie::ZombieMonitor::new(),
            user: user::UserReportedMonitor::new(),
            system: system::SystemMonitor::new(),
            app_state: app_state::AppStateMonitor::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_masks() {
        assert_eq!(MonitorType::ALL.bits(), 0x1ff);
        assert_eq!(MonitorType::DEBUGGER_UNSAFE.bits(), 0x0f);
        assert_eq!(MonitorType::ASYNC_UNSAFE.bits(), 0x1fc);
        assert_eq!(MonitorType::PRODUCTION_SAFE_MINIMAL.bits(), 0x0ef);
        assert_eq!(MonitorType::MANUAL.bits(), 0xe0);
        assert!(!MonitorType::PRODUCTION_SAFE.contains(MonitorType::MAIN_THREAD_DEADLOCK));
    }

    #[test]
    fn test_registration_order_matches_types() {
        let types: Vec<MonitorType> = Monitor::ALL.iter().map(|m| m.api().monitor_type()).collect();
        assert_eq!(
            types,
            vec![
                MonitorType::KERNEL_EXCEPTION,
                MonitorType::SIGNAL,
                MonitorType::MANAGED_EXCEPTION,
                MonitorType::NATIVE_EXCEPTION,
                MonitorType::MAIN_THREAD_DEADLOCK,
                MonitorType::ZOMBIE,
                MonitorType::USER_REPORTED,
                MonitorType::SYSTEM,
                MonitorType::APPLICATION_STATE,
            ]
        );
        let all = types.into_iter().fold(MonitorType::NONE, |acc, t| acc | t);
        assert_eq!(all, MonitorType::ALL);
    }

    #[test]
    fn test_names_and_serde() -> anyhow::Result<()> {
        assert_eq!(MonitorType::SIGNAL.name(), Some("Signal"));
        assert_eq!(MonitorType::REQUIRED.name(), None);
        let json = serde_json::to_string(&MonitorType::MANUAL)?;
        assert_eq!(serde_json::from_str::<MonitorType>(&json)?, MonitorType::MANUAL);
        Ok(())
    }
}
