// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Catches the fatal signals.
//!
//! Note that the handler makes use of the following async-signal safe functions:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - clock_gettime
//! - getpid, tgkill (suspension)
//! - open, read, write, close, rename, unlink (report writing)
//! - raise
//! - sigaltstack
//! - sigaction

use super::event::{CrashEvent, CrashKind, EventIdSlot, SignalDetails, EVENT_ID_LENGTH};
use super::{handle_exception, notify_fatal_exception_captured, MonitorApi, MonitorType};
use crate::collector::machine_context::MachineContext;
use crate::collector::signal_info::{has_fault_address, signal_from_signum, UnknownSignal, FATAL_SIGNALS};
use crate::collector::stack_cursor::StackCursor;
use crate::context::context;
use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

const SIGNAL_COUNT: usize = FATAL_SIGNALS.len();

#[derive(Debug, thiserror::Error)]
pub enum SignalMonitorError {
    #[error("failed to allocate an alternative stack: {0}")]
    AltStackAllocation(std::io::Error),
    #[error("failed to set up alternative stack guard page: {0}")]
    AltStackGuard(std::io::Error),
    #[error("sigaltstack failed: {0}")]
    AltStack(std::io::Error),
    #[error(transparent)]
    UnknownSignal(#[from] UnknownSignal),
    #[error("unable to register handler for signal {signum}: {source}")]
    Sigaction {
        signum: c_int,
        #[source]
        source: nix::Error,
    },
}

pub struct SignalMonitor {
    enabled: AtomicBool,
    event_id: EventIdSlot,
    create_alt_stack: AtomicBool,
    use_alt_stack: AtomicBool,
    // Written only while `enabled` is false, by the single caller of `set_enabled` that flipped it.
    previous_handlers: UnsafeCell<[Option<SigAction>; SIGNAL_COUNT]>,
    previous_alt_stack: UnsafeCell<Option<libc::stack_t>>,
    alt_stack: AtomicPtr<c_void>,
    alt_stack_size: AtomicUsize,
}

// SAFETY: the cells are only written while enabling or disabling, which `enabled` serialises, and
// read by the handler while enabled.
unsafe impl Sync for SignalMonitor {}

impl SignalMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            event_id: EventIdSlot::new(),
            create_alt_stack: AtomicBool::new(true),
            use_alt_stack: AtomicBool::new(true),
            previous_handlers: UnsafeCell::new([None; SIGNAL_COUNT]),
            previous_alt_stack: UnsafeCell::new(None),
            alt_stack: AtomicPtr::new(ptr::null_mut()),
            alt_stack_size: AtomicUsize::new(0),
        }
    }

    /// Sets how the handler stack is chosen. Takes effect on the next enable.
    pub fn configure_alt_stack(&self, create_alt_stack: bool, use_alt_stack: bool) {
        self.create_alt_stack.store(create_alt_stack, SeqCst);
        self.use_alt_stack.store(use_alt_stack, SeqCst);
    }

    fn install(&self) -> Result<(), SignalMonitorError> {
        if self.create_alt_stack.load(SeqCst) {
            // SAFETY: no preconditions.
            unsafe { self.set_up_alt_stack()? };
        }
        let flags = if self.use_alt_stack.load(SeqCst) {
            SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK
        } else {
            SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER
        };
        let action = SigAction::new(SigHandler::SigAction(handle_signal), flags, SigSet::empty());

        // SAFETY: `enabled` is false, so neither the handler nor another enable reads this.
        let previous = unsafe { &mut *self.previous_handlers.get() };
        for (index, signum) in FATAL_SIGNALS.iter().enumerate() {
            let result = signal_from_signum(*signum)
                .map_err(SignalMonitorError::from)
                .and_then(|sig| {
                    // SAFETY: the handler only calls async-signal-safe functions.
                    unsafe { signal::sigaction(sig, &action) }
                        .map_err(|source| SignalMonitorError::Sigaction { signum: *signum, source })
                });
            match result {
                Ok(old) => previous[index] = Some(old),
                Err(e) => {
                    // Roll back what this call installed.
                    self.restore_handlers(previous);
                    // SAFETY: no preconditions.
                    unsafe { self.restore_alt_stack() };
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn restore_handlers(&self, previous: &mut [Option<SigAction>; SIGNAL_COUNT]) {
        for (index, signum) in FATAL_SIGNALS.iter().enumerate() {
            let Some(old) = previous[index].take() else {
                continue;
            };
            let Ok(sig) = signal_from_signum(*signum) else {
                continue;
            };
            // SAFETY: restores a handler that was installed before ours.
            if let Err(e) = unsafe { signal::sigaction(sig, &old) } {
                crash_error!("Could not restore handler of signal {}: {}", signum, e);
            }
        }
    }

    /// Allocates the alternate stack once, with a guard page below it, and makes it the calling
    /// thread's signal stack.
    unsafe fn set_up_alt_stack(&self) -> Result<(), SignalMonitorError> {
        let page_size = page_size::get();
        let mut stack_base = self.alt_stack.load(SeqCst);
        let mut stack_size = self.alt_stack_size.load(SeqCst);
        if stack_base.is_null() {
            stack_size = std::cmp::max(libc::SIGSTKSZ, 16 * page_size);
            let mapping = libc::mmap(
                ptr::null_mut(),
                stack_size + page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(SignalMonitorError::AltStackAllocation(std::io::Error::last_os_error()));
            }
            if libc::mprotect(mapping, page_size, libc::PROT_NONE) != 0 {
                let e = std::io::Error::last_os_error();
                libc::munmap(mapping, stack_size + page_size);
                return Err(SignalMonitorError::AltStackGuard(e));
            }
            stack_base = mapping.add(page_size);
            self.alt_stack.store(stack_base, SeqCst);
            self.alt_stack_size.store(stack_size, SeqCst);
        }

        let stack = libc::stack_t {
            ss_sp: stack_base,
            ss_flags: 0,
            ss_size: stack_size,
        };
        let mut old: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(&stack, &mut old) != 0 {
            return Err(SignalMonitorError::AltStack(std::io::Error::last_os_error()));
        }
        *self.previous_alt_stack.get() = Some(old);
        Ok(())
    }

    /// Gives the calling thread back the signal stack it had before ours. The mapping itself is
    /// kept for the next enable.
    ///
    /// A thread running on its signal stack cannot change it, so this is left for a later call
    /// from normal context. Returns whether the stack was restored.
    unsafe fn restore_alt_stack(&self) -> bool {
        if (*self.previous_alt_stack.get()).is_none() {
            return false;
        }
        if on_signal_stack() {
            crash_debug!("Running on the signal stack, keeping it");
            return false;
        }
        let Some(old) = (*self.previous_alt_stack.get()).take() else {
            return false;
        };
        let old = if old.ss_sp.is_null() {
            libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            }
        } else {
            old
        };
        if libc::sigaltstack(&old, ptr::null_mut()) != 0 {
            crash_error!("Could not restore the signal stack: errno {}", errno::errno().0);
            return false;
        }
        true
    }

    fn previous_handler(&self, signum: c_int) -> Option<SigAction> {
        let index = FATAL_SIGNALS.iter().position(|s| *s == signum)?;
        // SAFETY: read from the handler while the table is stable, see `previous_handlers`.
        unsafe { (*self.previous_handlers.get())[index] }
    }
}

impl Default for SignalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for SignalMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SIGNAL
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            if self.enabled.load(SeqCst) {
                return;
            }
            self.event_id.regenerate();
            match self.install() {
                Ok(()) => self.enabled.store(true, SeqCst),
                Err(e) => crash_error!("Could not install signal handlers: {}", e),
            }
        } else if self
            .enabled
            .compare_exchange(true, false, SeqCst, SeqCst)
            .is_ok()
        {
            // SAFETY: `enabled` was just flipped by this caller.
            unsafe {
                self.restore_handlers(&mut *self.previous_handlers.get());
                // Teardown after a fatal episode runs in the handler of the crashed thread,
                // which is not the thread the stack was installed on.
                if !context().registry.is_handling_fatal_exception() {
                    self.restore_alt_stack();
                }
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    /// Reports from other sources still carry a signal, as consumers expect one.
    fn add_contextual_info(&self, event: &mut CrashEvent<'_>) {
        if !matches!(event.kind, CrashKind::Signal) {
            event.signal = SignalDetails {
                signum: libc::SIGABRT,
                sigcode: 0,
            };
        }
    }
}

extern "C" fn handle_signal(signum: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let monitor = &context().monitors.signal;
    // Read before handling: a fatal episode restores the previous handlers.
    let previous = monitor.previous_handler(signum);
    crash_debug!("Trapped signal {}", signum);
    if monitor.is_enabled() {
        // SAFETY: called from an `SA_SIGINFO` handler with the kernel's arguments.
        unsafe { report_signal(monitor, signum, info, ucontext as *const ucontext_t) };
    }
    // SAFETY: forwards the kernel's arguments.
    unsafe { chain_signal_handler(signum, previous, info, ucontext) };
}

unsafe fn report_signal(
    monitor: &SignalMonitor,
    signum: c_int,
    info: *mut siginfo_t,
    ucontext: *const ucontext_t,
) {
    let suspension = &context().suspension;
    notify_fatal_exception_captured(true);
    suspension.suspend_environment();

    let mut machine = MachineContext::from_signal(ucontext, suspension.thread_list());
    // The unwinder gets through the signal frame on most targets. The frame pointer chain is the
    // fallback.
    let cursor = StackCursor::capture_from_fault(machine.instruction_address(), STACK_OVERFLOW_THRESHOLD)
        .unwrap_or_else(|| StackCursor::from_machine_context(&machine, STACK_OVERFLOW_THRESHOLD));
    machine.set_stack_overflow(cursor.walk_detects_overflow());

    let mut id_buffer = [0u8; EVENT_ID_LENGTH];
    let event_id = monitor.event_id.format(&mut id_buffer);
    let mut event = CrashEvent::new(event_id, CrashKind::Signal, &machine, cursor);
    event.registers_are_valid = true;
    event.is_stack_overflow = machine.is_stack_overflow();
    if !info.is_null() {
        event.signal = SignalDetails {
            signum: (*info).si_signo,
            sigcode: (*info).si_code,
        };
        if has_fault_address(signum) {
            event.fault_address = (*info).si_addr() as usize;
        }
    } else {
        event.signal.signum = signum;
    }
    handle_exception(&mut event);

    suspension.resume_environment();
}

/// Whether the calling thread is executing on its alternate signal stack.
fn on_signal_stack() -> bool {
    // SAFETY: an all-zero stack_t is valid, and a null new stack only queries.
    unsafe {
        let mut current: libc::stack_t = std::mem::zeroed();
        libc::sigaltstack(ptr::null(), &mut current) == 0 && current.ss_flags & libc::SS_ONSTACK != 0
    }
}

/// Hands the signal to whatever handled it before us.
///
/// A default disposition is restored and the signal raised again, so the process dies the way it
/// would have without a reporter, core dump included.
unsafe fn chain_signal_handler(
    signum: c_int,
    previous: Option<SigAction>,
    info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let previous = previous.unwrap_or(default);
    match previous.handler() {
        SigHandler::SigDfl => {
            match signal_from_signum(signum) {
                Ok(sig) => {
                    if signal::sigaction(sig, &previous).is_err() {
                        crash_error!("Could not restore default handler of signal {}", signum);
                        libc::_exit(128 + signum);
                    }
                }
                Err(_) => libc::_exit(128 + signum),
            }
            libc::raise(signum);
        }
        SigHandler::SigIgn => {}
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, info, ucontext),
    }
}
