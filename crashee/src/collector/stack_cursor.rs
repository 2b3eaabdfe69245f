// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lazily walks the frames of a thread's stack.
//!
//! A cursor is built either from a machine context, in which case the frame pointer chain is
//! followed through [copy_safely], or from a buffer of return addresses captured earlier. The
//! second form is used for the thread doing the capture: its own frame pointer chain is live and
//! keeps changing, so the addresses are taken once with the unwinder and then replayed.

use super::dynamic_linker;
use super::machine_context::MachineContext;
use super::memory::copy_safely;
use crate::shared::constants::MAX_BACKTRACE_FRAMES;
use std::ffi::CStr;

const WORD: usize = std::mem::size_of::<usize>();

/// One frame of a walk, symbolicated on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackFrame {
    pub instruction_address: usize,
    pub symbol_name: Option<&'static CStr>,
    pub symbol_address: usize,
    pub image_name: Option<&'static CStr>,
    pub image_address: usize,
}

#[derive(Debug, Clone, Copy)]
enum FrameSource {
    FramePointer {
        start_ip: usize,
        start_fp: usize,
        fp: usize,
    },
    Backtrace {
        addresses: [usize; MAX_BACKTRACE_FRAMES],
        len: usize,
    },
}

enum Step {
    Frame(usize),
    End,
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct StackCursor {
    source: FrameSource,
    frame: StackFrame,
    depth: usize,
    max_depth: usize,
    gave_up: bool,
    is_stack_overflow: bool,
}

impl StackCursor {
    fn with_source(source: FrameSource, max_depth: usize) -> Self {
        Self {
            source,
            frame: StackFrame::default(),
            depth: 0,
            max_depth,
            gave_up: false,
            is_stack_overflow: false,
        }
    }

    /// A cursor producing no frames.
    pub fn empty() -> Self {
        Self::from_backtrace(&[], 0, 0)
    }

    /// Walks the frame pointer chain of a stopped thread. Yields nothing if the context carries
    /// no register state.
    pub fn from_machine_context(context: &MachineContext, max_depth: usize) -> Self {
        if !context.has_cpu_state() {
            return Self::empty();
        }
        let cpu = context.cpu();
        Self::with_source(
            FrameSource::FramePointer {
                start_ip: cpu.instruction_address(),
                start_fp: cpu.frame_pointer(),
                fp: cpu.frame_pointer(),
            },
            max_depth,
        )
    }

    /// Replays `addresses`, starting at index `skip`. Addresses past the buffer capacity are
    /// dropped.
    pub fn from_backtrace(addresses: &[usize], skip: usize, max_depth: usize) -> Self {
        let mut buffer = [0; MAX_BACKTRACE_FRAMES];
        let kept = addresses.get(skip..).unwrap_or_default();
        let len = kept.len().min(MAX_BACKTRACE_FRAMES);
        buffer[..len].copy_from_slice(&kept[..len]);
        Self::with_source(
            FrameSource::Backtrace {
                addresses: buffer,
                len,
            },
            max_depth,
        )
    }

    /// Captures the calling thread's stack with the unwinder.
    /// Frames are skipped until `fault_ip` is met, so the handler's own frames do not show up.
    /// If `fault_ip` is never met, every frame is kept.
    #[inline(never)]
    pub fn capture_current(fault_ip: Option<usize>, max_depth: usize) -> Self {
        let (addresses, len) = capture_addresses();
        let skip = fault_ip
            .and_then(|ip| addresses[..len].iter().position(|a| *a == ip))
            .unwrap_or(0);
        Self::from_backtrace(&addresses[..len], skip, max_depth)
    }

    /// Like [StackCursor::capture_current], but only succeeds if the unwinder made it through
    /// the signal frame and met `fault_ip`.
    #[inline(never)]
    pub fn capture_from_fault(fault_ip: usize, max_depth: usize) -> Option<Self> {
        let (addresses, len) = capture_addresses();
        let skip = addresses[..len].iter().position(|a| *a == fault_ip)?;
        Some(Self::from_backtrace(&addresses[..len], skip, max_depth))
    }

    /// Moves to the next frame. Returns false at the end of the stack or once the walk gave up.
    pub fn advance(&mut self) -> bool {
        if self.gave_up {
            return false;
        }
        if self.depth >= self.max_depth {
            self.gave_up = true;
            self.is_stack_overflow = true;
            return false;
        }
        let step = match &mut self.source {
            FrameSource::Backtrace { addresses, len } => match addresses[..*len].get(self.depth) {
                Some(address) if *address != 0 => Step::Frame(*address),
                _ => Step::End,
            },
            FrameSource::FramePointer { start_ip, fp, .. } => {
                if self.depth == 0 {
                    match *start_ip {
                        0 => Step::End,
                        ip => Step::Frame(ip),
                    }
                } else {
                    next_frame_record(fp)
                }
            }
        };
        match step {
            Step::Frame(address) => {
                self.frame = StackFrame {
                    instruction_address: address,
                    ..StackFrame::default()
                };
                self.depth += 1;
                true
            }
            Step::End => false,
            Step::GiveUp => {
                self.gave_up = true;
                false
            }
        }
    }

    /// Rewinds to before the first frame.
    pub fn reset(&mut self) {
        if let FrameSource::FramePointer { start_fp, fp, .. } = &mut self.source {
            *fp = *start_fp;
        }
        self.frame = StackFrame::default();
        self.depth = 0;
        self.gave_up = false;
        self.is_stack_overflow = false;
    }

    pub fn frame(&self) -> &StackFrame {
        &self.frame
    }

    /// Frames produced so far.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    /// Walks a copy of this cursor to the end and reports whether it ran past its maximum depth.
    pub fn walk_detects_overflow(&self) -> bool {
        let mut copy = *self;
        copy.reset();
        while copy.advance() {}
        copy.is_stack_overflow
    }

    /// Fills in symbol and image of the current frame from the image snapshot.
    /// Return addresses point after the call, so for every frame but the first the lookup uses
    /// the address of the call instruction's last byte.
    pub fn symbolicate(&mut self) -> bool {
        let address = self.frame.instruction_address;
        if address == 0 {
            return false;
        }
        let lookup = if self.depth > 1 { address - 1 } else { address };
        let Some(found) = dynamic_linker::symbolicate(lookup) else {
            return false;
        };
        self.frame.image_name = Some(found.image_name);
        self.frame.image_address = found.image_address;
        self.frame.symbol_name = found.symbol_name;
        self.frame.symbol_address = found.symbol_address;
        true
    }
}

/// SIGNAL SAFETY:
///     Getting a backtrace on rust is not guaranteed to be signal safe.
///     https://github.com/rust-lang/backtrace-rs/issues/414
///     Collecting the `ip` of the frames seems safe; nothing is resolved here.
#[inline(never)]
fn capture_addresses() -> ([usize; MAX_BACKTRACE_FRAMES], usize) {
    let mut addresses = [0usize; MAX_BACKTRACE_FRAMES];
    let mut len = 0;
    // SAFETY: the crash path runs with every other thread suspended, and normal-context
    // callers tolerate an unsynchronized walk of their own stack.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            addresses[len] = frame.ip() as usize;
            len += 1;
            len < MAX_BACKTRACE_FRAMES
        });
    }
    (addresses, len)
}

/// Reads the `{previous frame pointer, return address}` record at `*fp` and advances `fp`.
/// Both supported architectures lay frame records out this way.
fn next_frame_record(fp: &mut usize) -> Step {
    if *fp == 0 {
        return Step::End;
    }
    let mut record = [0u8; 2 * WORD];
    if !copy_safely(*fp, &mut record) {
        return Step::GiveUp;
    }
    let mut word = [0u8; WORD];
    word.copy_from_slice(&record[..WORD]);
    let next_fp = usize::from_ne_bytes(word);
    word.copy_from_slice(&record[WORD..]);
    let return_address = usize::from_ne_bytes(word);
    if return_address == 0 {
        return Step::End;
    }
    // The stack grows down, so callers' records sit at higher addresses. Anything else is a
    // corrupted or cyclic chain.
    if next_fp != 0 && next_fp <= *fp {
        return Step::GiveUp;
    }
    *fp = next_fp;
    Step::Frame(return_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::cpu::CpuState;

    fn context_for(ip: usize, fp: usize) -> MachineContext {
        let mut cpu = CpuState::empty();
        cpu.set_for_test(fp, ip, fp);
        MachineContext::for_suspended_thread(1, None).with_cpu_for_test(cpu)
    }

    fn collect(cursor: &mut StackCursor) -> Vec<usize> {
        let mut frames = vec![];
        while cursor.advance() {
            frames.push(cursor.frame().instruction_address);
        }
        frames
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_frame_pointer_walk() {
        let mut stack = vec![0usize; 6];
        let base = stack.as_ptr() as usize;
        stack[0] = base + 2 * WORD;
        stack[1] = 0x1111;
        stack[2] = base + 4 * WORD;
        stack[3] = 0x2222;

        let mut cursor = StackCursor::from_machine_context(&context_for(0x4000, base), 150);
        assert_eq!(collect(&mut cursor), vec![0x4000, 0x1111, 0x2222]);
        assert!(!cursor.has_given_up());

        cursor.reset();
        assert_eq!(collect(&mut cursor).len(), 3);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_cyclic_chain_gives_up() {
        let mut stack = vec![0usize; 2];
        let base = stack.as_ptr() as usize;
        stack[0] = base;
        stack[1] = 0x1111;

        let mut cursor = StackCursor::from_machine_context(&context_for(0x4000, base), 150);
        assert_eq!(collect(&mut cursor), vec![0x4000]);
        assert!(cursor.has_given_up());
        assert!(!cursor.is_stack_overflow());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unreadable_frame_pointer_gives_up() {
        let mut cursor = StackCursor::from_machine_context(&context_for(0x4000, 16), 150);
        assert_eq!(collect(&mut cursor), vec![0x4000]);
        assert!(cursor.has_given_up());
    }

    #[test]
    fn test_depth_limit_flags_overflow() {
        let addresses: Vec<usize> = (1..=20).collect();
        let mut cursor = StackCursor::from_backtrace(&addresses, 2, 5);
        assert_eq!(collect(&mut cursor), vec![3, 4, 5, 6, 7]);
        assert!(cursor.is_stack_overflow());
        assert!(cursor.walk_detects_overflow());

        let cursor = StackCursor::from_backtrace(&addresses, 0, 50);
        assert!(!cursor.walk_detects_overflow());
    }

    #[test]
    fn test_missing_registers_yield_no_frames() {
        let context = MachineContext::for_suspended_thread(1, None);
        let mut cursor = StackCursor::from_machine_context(&context, 150);
        assert!(!cursor.advance());
        assert!(!cursor.has_given_up());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_current_symbolicates() {
        dynamic_linker::init();
        let mut cursor = StackCursor::capture_current(None, 150);
        assert!(cursor.advance());
        assert!(cursor.symbolicate());
        assert!(cursor.frame().image_name.is_some());
        assert_ne!(cursor.frame().image_address, 0);

        assert!(StackCursor::capture_from_fault(1, 150).is_none());
    }
}
