// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CPU register access for the supported architectures.
//!
//! Register state is copied out of the kernel-provided `ucontext_t` into a plain `Copy` struct,
//! so it can be stored in static suspension slots and on the signal stack alike.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("crashee supports x86_64 and aarch64 only");

/// The stack grows towards lower addresses on every supported architecture.
pub const STACK_GROW_DIRECTION: isize = -1;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    pub const CPU_ARCH: &str = "x86_64";
    // Values from mach/machine.h, kept for report consumers that key on them.
    pub const CPU_TYPE: i64 = 0x0100_0007;
    pub const CPU_SUBTYPE: i64 = 3;

    const NGREG: usize = 23;
    // Indices into `mcontext_t::gregs`, see <sys/ucontext.h>.
    const REG_R8: usize = 0;
    const REG_RDI: usize = 8;
    const REG_RSI: usize = 9;
    const REG_RBP: usize = 10;
    const REG_RBX: usize = 11;
    const REG_RDX: usize = 12;
    const REG_RAX: usize = 13;
    const REG_RCX: usize = 14;
    const REG_RSP: usize = 15;
    const REG_RIP: usize = 16;
    const REG_EFL: usize = 17;
    const REG_CSGSFS: usize = 18;
    const REG_ERR: usize = 19;
    const REG_TRAPNO: usize = 20;
    const REG_CR2: usize = 22;

    static REGISTER_NAMES: [&str; 21] = [
        "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip", "rflags", "cs", "fs", "gs",
    ];

    static EXCEPTION_REGISTER_NAMES: [&str; 3] = ["trapno", "err", "faultvaddr"];

    #[derive(Debug, Clone, Copy)]
    pub struct CpuState {
        gregs: [i64; NGREG],
    }

    impl CpuState {
        pub const fn empty() -> Self {
            Self { gregs: [0; NGREG] }
        }

        /// # Safety
        /// `uc` must be null or point to a `ucontext_t` provided by the kernel.
        pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Self {
            let mut state = Self::empty();
            if let Some(uc) = uc.as_ref() {
                for (dst, src) in state.gregs.iter_mut().zip(uc.uc_mcontext.gregs.iter()) {
                    *dst = *src as i64;
                }
            }
            state
        }

        fn greg(&self, index: usize) -> u64 {
            self.gregs[index] as u64
        }

        pub fn stack_pointer(&self) -> usize {
            self.greg(REG_RSP) as usize
        }

        pub fn instruction_address(&self) -> usize {
            self.greg(REG_RIP) as usize
        }

        pub fn frame_pointer(&self) -> usize {
            self.greg(REG_RBP) as usize
        }

        /// x86_64 pushes the return address on the stack, there is no link register.
        pub fn link_register(&self) -> usize {
            0
        }

        pub fn fault_address(&self) -> usize {
            self.greg(REG_CR2) as usize
        }

        pub fn register_value(&self, index: usize) -> u64 {
            match index {
                0 => self.greg(REG_RAX),
                1 => self.greg(REG_RBX),
                2 => self.greg(REG_RCX),
                3 => self.greg(REG_RDX),
                4 => self.greg(REG_RDI),
                5 => self.greg(REG_RSI),
                6 => self.greg(REG_RBP),
                7 => self.greg(REG_RSP),
                8..=15 => self.greg(REG_R8 + index - 8),
                16 => self.greg(REG_RIP),
                17 => self.greg(REG_EFL),
                // cs, gs and fs are packed in one 64 bit slot: cs | gs << 16 | fs << 32.
                18 => self.greg(REG_CSGSFS) & 0xffff,
                19 => (self.greg(REG_CSGSFS) >> 32) & 0xffff,
                20 => (self.greg(REG_CSGSFS) >> 16) & 0xffff,
                _ => 0,
            }
        }

        pub fn exception_register_value(&self, index: usize) -> u64 {
            match index {
                0 => self.greg(REG_TRAPNO),
                1 => self.greg(REG_ERR),
                2 => self.greg(REG_CR2),
                _ => 0,
            }
        }

        #[cfg(test)]
        pub(crate) fn set_for_test(&mut self, sp: usize, ip: usize, fp: usize) {
            self.gregs[REG_RSP] = sp as i64;
            self.gregs[REG_RIP] = ip as i64;
            self.gregs[REG_RBP] = fp as i64;
        }
    }

    pub fn register_count() -> usize {
        REGISTER_NAMES.len()
    }

    pub fn register_name(index: usize) -> Option<&'static str> {
        REGISTER_NAMES.get(index).copied()
    }

    pub fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    pub fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    pub const CPU_ARCH: &str = "arm64";
    pub const CPU_TYPE: i64 = 0x0100_000c;
    pub const CPU_SUBTYPE: i64 = 0;

    const REG_FP: usize = 29;
    const REG_LR: usize = 30;

    static REGISTER_NAMES: [&str; 34] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc", "cpsr",
    ];

    static EXCEPTION_REGISTER_NAMES: [&str; 1] = ["far"];

    #[derive(Debug, Clone, Copy)]
    pub struct CpuState {
        regs: [u64; 31],
        sp: u64,
        pc: u64,
        pstate: u64,
        fault_address: u64,
    }

    impl CpuState {
        pub const fn empty() -> Self {
            Self {
                regs: [0; 31],
                sp: 0,
                pc: 0,
                pstate: 0,
                fault_address: 0,
            }
        }

        /// # Safety
        /// `uc` must be null or point to a `ucontext_t` provided by the kernel.
        pub unsafe fn from_ucontext(uc: *const libc::ucontext_t) -> Self {
            match uc.as_ref() {
                Some(uc) => {
                    let mc = &uc.uc_mcontext;
                    Self {
                        regs: mc.regs,
                        sp: mc.sp,
                        pc: mc.pc,
                        pstate: mc.pstate,
                        fault_address: mc.fault_address,
                    }
                }
                None => Self::empty(),
            }
        }

        pub fn stack_pointer(&self) -> usize {
            self.sp as usize
        }

        pub fn instruction_address(&self) -> usize {
            self.pc as usize
        }

        pub fn frame_pointer(&self) -> usize {
            self.regs[REG_FP] as usize
        }

        pub fn link_register(&self) -> usize {
            self.regs[REG_LR] as usize
        }

        pub fn fault_address(&self) -> usize {
            self.fault_address as usize
        }

        pub fn register_value(&self, index: usize) -> u64 {
            match index {
                0..=30 => self.regs[index],
                31 => self.sp,
                32 => self.pc,
                33 => self.pstate,
                _ => 0,
            }
        }

        pub fn exception_register_value(&self, index: usize) -> u64 {
            match index {
                0 => self.fault_address,
                _ => 0,
            }
        }

        #[cfg(test)]
        pub(crate) fn set_for_test(&mut self, sp: usize, ip: usize, fp: usize) {
            self.sp = sp as u64;
            self.pc = ip as u64;
            self.regs[REG_FP] = fp as u64;
        }
    }

    pub fn register_count() -> usize {
        REGISTER_NAMES.len()
    }

    pub fn register_name(index: usize) -> Option<&'static str> {
        REGISTER_NAMES.get(index).copied()
    }

    pub fn exception_register_count() -> usize {
        EXCEPTION_REGISTER_NAMES.len()
    }

    pub fn exception_register_name(index: usize) -> Option<&'static str> {
        EXCEPTION_REGISTER_NAMES.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names_cover_register_count() {
        for index in 0..register_count() {
            assert!(register_name(index).is_some());
        }
        assert!(register_name(register_count()).is_none());
        assert!(exception_register_name(exception_register_count()).is_none());
    }

    #[test]
    fn test_null_ucontext_is_empty() {
        // SAFETY: null is explicitly allowed.
        let state = unsafe { CpuState::from_ucontext(std::ptr::null()) };
        assert_eq!(state.stack_pointer(), 0);
        assert_eq!(state.instruction_address(), 0);
    }

    #[test]
    fn test_named_registers_follow_state() {
        let mut state = CpuState::empty();
        state.set_for_test(0x7000, 0x4000, 0x7100);
        assert_eq!(state.stack_pointer(), 0x7000);
        assert_eq!(state.instruction_address(), 0x4000);
        assert_eq!(state.frame_pointer(), 0x7100);
        let sp_index = (0..register_count())
            .find(|i| matches!(register_name(*i), Some("rsp") | Some("sp")))
            .unwrap();
        assert_eq!(state.register_value(sp_index), 0x7000);
    }
}
