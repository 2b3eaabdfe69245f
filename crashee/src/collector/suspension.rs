// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Suspends every other thread of the process around crash handling.
//!
//! Linux has no `thread_suspend`. Each thread is sent a dedicated real-time signal with
//! `tgkill`; its handler copies the interrupted register state into a static slot, marks the slot
//! parked, and sleeps until the controller releases it. This both freezes the thread and gives
//! the report writer that thread's registers.

use super::cpu::CpuState;
use super::threads::{self, ThreadId, ThreadList};
use crate::shared::constants::{MAX_CAPTURED_THREADS, MAX_RESERVED_THREADS, SUSPEND_TIMEOUT};
use libc::{c_int, c_void, siginfo_t};
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize};
use std::time::Duration;

/// Offset from SIGRTMIN of the signal used to park threads.
const SUSPEND_SIGNAL_OFFSET: c_int = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const SLOT_IDLE: u8 = 0;
const SLOT_REQUESTED: u8 = 1;
const SLOT_PARKED: u8 = 2;
const SLOT_RELEASED: u8 = 3;

struct ThreadSlot {
    thread: AtomicI32,
    state: AtomicU8,
    cpu: UnsafeCell<CpuState>,
}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            thread: AtomicI32::new(0),
            state: AtomicU8::new(SLOT_IDLE),
            cpu: UnsafeCell::new(CpuState::empty()),
        }
    }
}

pub struct SuspensionController {
    reserved: [AtomicI32; MAX_RESERVED_THREADS],
    reserved_len: AtomicUsize,
    slots: [ThreadSlot; MAX_CAPTURED_THREADS],
    // Written only by the thread holding the first suspension level.
    threads: UnsafeCell<ThreadList>,
    depth: AtomicUsize,
    suspend_signal: AtomicI32,
    installed: AtomicBool,
}

// SAFETY: `threads` and the slots' `cpu` cells are written by exactly one party at a time, gated
// by `depth` and by each slot's `state` respectively.
unsafe impl Sync for SuspensionController {}

impl SuspensionController {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const RESERVED: AtomicI32 = AtomicI32::new(0);
        #[allow(clippy::declare_interior_mutable_const)]
        const SLOT: ThreadSlot = ThreadSlot::new();
        Self {
            reserved: [RESERVED; MAX_RESERVED_THREADS],
            reserved_len: AtomicUsize::new(0),
            slots: [SLOT; MAX_CAPTURED_THREADS],
            threads: UnsafeCell::new(ThreadList::new()),
            depth: AtomicUsize::new(0),
            suspend_signal: AtomicI32::new(0),
            installed: AtomicBool::new(false),
        }
    }

    /// Installs the handler of the signal used to park threads. Idempotent.
    pub fn install(&'static self) -> anyhow::Result<()> {
        if self
            .installed
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let signum = libc::SIGRTMIN() + SUSPEND_SIGNAL_OFFSET;
        anyhow::ensure!(
            signum <= libc::SIGRTMAX(),
            "no real-time signal available to suspend threads"
        );
        // nix's `Signal` has no real-time variants, so this one goes through libc directly.
        // SAFETY: the sigaction struct is fully initialised before use.
        let rval = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_suspend_signal as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut())
        };
        if rval != 0 {
            self.installed.store(false, SeqCst);
            anyhow::bail!(
                "failed to install the thread suspension handler: {}",
                std::io::Error::last_os_error()
            );
        }
        self.suspend_signal.store(signum, SeqCst);
        Ok(())
    }

    /// Marks `thread` as one the reporter depends on; it is never suspended.
    pub fn add_reserved_thread(&self, thread: ThreadId) -> bool {
        let index = self.reserved_len.fetch_add(1, SeqCst);
        if index >= MAX_RESERVED_THREADS {
            self.reserved_len.fetch_sub(1, SeqCst);
            crash_error!(
                "Too many reserved threads ({}). Max is {}",
                index + 1,
                MAX_RESERVED_THREADS
            );
            return false;
        }
        self.reserved[index].store(thread, SeqCst);
        true
    }

    pub fn is_reserved(&self, thread: ThreadId) -> bool {
        let len = self.reserved_len.load(SeqCst).min(MAX_RESERVED_THREADS);
        self.reserved[..len]
            .iter()
            .any(|t| t.load(SeqCst) == thread)
    }

    pub fn is_suspended(&self) -> bool {
        self.depth.load(SeqCst) > 0
    }

    /// Suspends every thread except the caller and the reserved threads.
    /// Nested calls only bump a counter; the threads stay suspended until the matching number
    /// of [Self::resume_environment] calls.
    pub fn suspend_environment(&self) {
        if self.depth.fetch_add(1, SeqCst) > 0 {
            crash_debug!("Environment already suspended");
            return;
        }
        crash_debug!("Suspending environment.");
        // SAFETY: only the first suspension level writes the list.
        let threads = unsafe { &mut *self.threads.get() };
        if !threads::enumerate_threads(threads) {
            crash_error!("Could not enumerate threads: {}", errno::errno());
        }
        if threads.dropped() > 0 {
            crash_error!(
                "Too many threads ({}). Only the first {} are captured",
                threads.len() + threads.dropped(),
                MAX_CAPTURED_THREADS
            );
        }

        let signum = self.suspend_signal.load(SeqCst);
        if signum == 0 {
            crash_warn!("Thread suspension is not installed");
            return;
        }
        let this_thread = threads::current_thread_id();
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        let mut requested = 0;
        for (slot, thread) in self.slots.iter().zip(threads.as_slice()) {
            slot.state.store(SLOT_IDLE, SeqCst);
            slot.thread.store(*thread, SeqCst);
            if *thread == this_thread || self.is_reserved(*thread) {
                continue;
            }
            slot.state.store(SLOT_REQUESTED, SeqCst);
            // SAFETY: tgkill has no memory preconditions.
            let rval = unsafe { libc::syscall(libc::SYS_tgkill, pid, *thread, signum) };
            if rval != 0 {
                crash_error!("tgkill({}): {}", thread, errno::errno());
                slot.state.store(SLOT_IDLE, SeqCst);
                continue;
            }
            requested += 1;
        }

        let parked = wait_until(SUSPEND_TIMEOUT, || {
            !self
                .slots
                .iter()
                .any(|slot| slot.state.load(Acquire) == SLOT_REQUESTED)
        });
        if !parked {
            for slot in &self.slots {
                if slot
                    .state
                    .compare_exchange(SLOT_REQUESTED, SLOT_IDLE, AcqRel, Acquire)
                    .is_ok()
                {
                    crash_error!(
                        "Thread {} did not suspend. Continuing without it",
                        slot.thread.load(SeqCst)
                    );
                }
            }
        }
        crash_debug!("Suspend requested for {} threads.", requested);
    }

    /// Reverses [Self::suspend_environment]. Calling it without a prior suspend is a no-op.
    pub fn resume_environment(&self) {
        let previous = self
            .depth
            .fetch_update(SeqCst, SeqCst, |depth| depth.checked_sub(1));
        match previous {
            Err(_) => {
                crash_warn!("Resume called without a prior suspend");
                return;
            }
            Ok(depth) if depth > 1 => return,
            Ok(_) => {}
        }
        crash_debug!("Resuming environment.");
        for slot in &self.slots {
            let _ = slot
                .state
                .compare_exchange(SLOT_PARKED, SLOT_RELEASED, AcqRel, Acquire);
        }
        let released = wait_until(SUSPEND_TIMEOUT, || {
            !self
                .slots
                .iter()
                .any(|slot| slot.state.load(Acquire) == SLOT_RELEASED)
        });
        if !released {
            crash_error!("Some threads did not acknowledge resume");
        }
    }

    /// The threads seen by the last suspension.
    pub fn thread_list(&self) -> ThreadList {
        // SAFETY: only read while the writer is the calling thread or has finished.
        unsafe { *self.threads.get() }
    }

    /// The register state of `thread` captured when it was parked.
    pub fn cpu_state_for(&self, thread: ThreadId) -> Option<CpuState> {
        self.slots
            .iter()
            .find(|slot| {
                slot.thread.load(Acquire) == thread && slot.state.load(Acquire) == SLOT_PARKED
            })
            // SAFETY: a parked slot's cpu state is no longer written.
            .map(|slot| unsafe { *slot.cpu.get() })
    }
}

impl Default for SuspensionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `done` until it returns true or `timeout` passes. Sleeps with `nanosleep`, which is
/// async-signal-safe.
fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let mut waited = Duration::ZERO;
    loop {
        if done() {
            return true;
        }
        if waited >= timeout {
            return false;
        }
        sleep(POLL_INTERVAL);
        waited += POLL_INTERVAL;
    }
}

fn sleep(duration: Duration) {
    let request = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `request` is a valid timespec; the remainder is not needed.
    unsafe { libc::nanosleep(&request, std::ptr::null_mut()) };
}

extern "C" fn handle_suspend_signal(_signum: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let saved_errno = errno::errno();
    let controller = &crate::context::context().suspension;
    let this_thread = threads::current_thread_id();
    let slot = controller.slots.iter().find(|slot| {
        slot.thread.load(Acquire) == this_thread && slot.state.load(Acquire) == SLOT_REQUESTED
    });
    if let Some(slot) = slot {
        // SAFETY: the slot is in the requested state, so only this thread writes its cpu state.
        unsafe { *slot.cpu.get() = CpuState::from_ucontext(ucontext as *const libc::ucontext_t) };
        if slot
            .state
            .compare_exchange(SLOT_REQUESTED, SLOT_PARKED, AcqRel, Acquire)
            .is_ok()
        {
            while slot.state.load(Acquire) == SLOT_PARKED {
                sleep(POLL_INTERVAL);
            }
            slot.state.store(SLOT_IDLE, Release);
        }
    }
    errno::set_errno(saved_errno);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::{mpsc, Arc};

    #[test]
    fn test_reserved_threads_are_bounded() {
        let controller = SuspensionController::new();
        for tid in 0..MAX_RESERVED_THREADS as ThreadId {
            assert!(controller.add_reserved_thread(1000 + tid));
        }
        assert!(!controller.add_reserved_thread(5000));
        assert!(controller.is_reserved(1003));
        assert!(!controller.is_reserved(5000));
    }

    #[test]
    fn test_resume_without_suspend_is_noop() {
        let controller = SuspensionController::new();
        controller.resume_environment();
        assert!(!controller.is_suspended());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_suspend_parks_worker_and_captures_registers() {
        let controller = &crate::context::context().suspension;
        controller.install().unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = {
            let counter = counter.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                tid_tx.send(threads::current_thread_id()).unwrap();
                while !stop.load(SeqCst) {
                    counter.fetch_add(1, SeqCst);
                    std::hint::spin_loop();
                }
            })
        };
        let worker_tid = tid_rx.recv().unwrap();

        controller.suspend_environment();
        let frozen = counter.load(SeqCst);
        sleep(Duration::from_millis(20));
        let still_frozen = counter.load(SeqCst);
        let captured = controller.cpu_state_for(worker_tid);
        let listed = controller.thread_list().index_of(worker_tid).is_some();
        controller.resume_environment();

        assert_eq!(frozen, still_frozen);
        assert!(listed);
        let captured = captured.expect("worker registers were captured");
        assert_ne!(captured.stack_pointer(), 0);
        assert_ne!(captured.instruction_address(), 0);

        sleep(Duration::from_millis(20));
        assert!(counter.load(SeqCst) > still_frozen);
        stop.store(true, SeqCst);
        worker.join().unwrap();
    }
}
