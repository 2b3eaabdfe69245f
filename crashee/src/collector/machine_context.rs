// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A snapshot of one thread's CPU and stack state.

use super::cpu::{self, CpuState};
use super::threads::{self, ThreadId, ThreadList};

/// Register state and crash flags of one thread.
///
/// Lives on the stack of whoever captured it. Apart from the stack overflow flag, which is only
/// known once the stack has been walked, it does not change after capture.
#[derive(Debug, Clone, Copy)]
pub struct MachineContext {
    thread: ThreadId,
    cpu: CpuState,
    has_cpu_state: bool,
    is_current_thread: bool,
    is_crashed_context: bool,
    is_signal_context: bool,
    is_stack_overflow: bool,
    threads: ThreadList,
}

impl MachineContext {
    pub const fn empty() -> Self {
        Self {
            thread: 0,
            cpu: CpuState::empty(),
            has_cpu_state: false,
            is_current_thread: false,
            is_crashed_context: false,
            is_signal_context: false,
            is_stack_overflow: false,
            threads: ThreadList::new(),
        }
    }

    /// The crashed thread, taken from the context the kernel handed to a signal handler.
    ///
    /// # Safety
    /// `ucontext` must be null or the third argument of an `SA_SIGINFO` handler.
    pub unsafe fn from_signal(ucontext: *const libc::ucontext_t, threads: ThreadList) -> Self {
        Self {
            thread: threads::current_thread_id(),
            cpu: CpuState::from_ucontext(ucontext),
            has_cpu_state: !ucontext.is_null(),
            is_current_thread: true,
            is_crashed_context: true,
            is_signal_context: true,
            is_stack_overflow: false,
            threads,
        }
    }

    /// The calling thread, outside any signal handler. A running thread cannot read its own
    /// registers meaningfully, so no CPU state is recorded and the backtrace has to come from a
    /// backtrace buffer.
    pub fn for_current_thread(is_crashed_context: bool, threads: ThreadList) -> Self {
        Self {
            thread: threads::current_thread_id(),
            cpu: CpuState::empty(),
            has_cpu_state: false,
            is_current_thread: true,
            is_crashed_context,
            is_signal_context: false,
            is_stack_overflow: false,
            threads,
        }
    }

    /// Another thread, with the registers recorded when it was suspended, if any.
    pub fn for_suspended_thread(thread: ThreadId, cpu: Option<CpuState>) -> Self {
        Self {
            thread,
            cpu: cpu.unwrap_or(CpuState::empty()),
            has_cpu_state: cpu.is_some(),
            is_current_thread: false,
            is_crashed_context: false,
            is_signal_context: false,
            is_stack_overflow: false,
            threads: ThreadList::new(),
        }
    }

    /// Marks a suspended thread as the offending one, for failures detected from another thread.
    pub fn into_crashed_context(mut self, threads: ThreadList) -> Self {
        self.is_crashed_context = true;
        self.threads = threads;
        self
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn is_current_thread(&self) -> bool {
        self.is_current_thread
    }

    pub fn is_crashed_context(&self) -> bool {
        self.is_crashed_context
    }

    pub fn is_signal_context(&self) -> bool {
        self.is_signal_context
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    pub fn set_stack_overflow(&mut self, is_stack_overflow: bool) {
        self.is_stack_overflow = is_stack_overflow;
    }

    /// Registers are only meaningful for a stopped thread: one interrupted by a signal, or one
    /// other than the caller.
    pub fn can_have_cpu_state(&self) -> bool {
        !self.is_current_thread || self.is_signal_context
    }

    pub fn has_cpu_state(&self) -> bool {
        self.can_have_cpu_state() && self.has_cpu_state
    }

    pub fn has_valid_exception_registers(&self) -> bool {
        self.has_cpu_state() && self.is_crashed_context
    }

    pub fn stack_pointer(&self) -> usize {
        self.cpu.stack_pointer()
    }

    pub fn instruction_address(&self) -> usize {
        self.cpu.instruction_address()
    }

    /// Threads of the process at capture time. Only set on crashed contexts.
    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_at(&self, index: usize) -> Option<ThreadId> {
        self.threads.get(index)
    }

    pub fn index_of_thread(&self, thread: ThreadId) -> Option<usize> {
        self.threads.index_of(thread)
    }

    /// Iterates over `(name, value)` of the basic register set.
    pub fn registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        (0..cpu::register_count()).filter_map(move |index| {
            cpu::register_name(index).map(|name| (name, self.cpu.register_value(index)))
        })
    }

    pub fn exception_registers(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        (0..cpu::exception_register_count()).filter_map(move |index| {
            cpu::exception_register_name(index)
                .map(|name| (name, self.cpu.exception_register_value(index)))
        })
    }

    #[cfg(test)]
    pub(crate) fn with_cpu_for_test(mut self, cpu: CpuState) -> Self {
        self.cpu = cpu;
        self.has_cpu_state = true;
        self
    }
}

impl Default for MachineContext {
    fn default() -> Self {
        Self::empty()
    }
}
