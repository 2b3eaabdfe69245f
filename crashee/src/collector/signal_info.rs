// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Names for signal numbers and `si_code` values, as written into reports.

use libc::c_int;
use nix::sys::signal::Signal;

/// The signals the signal monitor handles. Each is fatal by default.
pub const FATAL_SIGNALS: [c_int; 8] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTRAP,
];

#[derive(Debug, thiserror::Error)]
#[error("Unexpected signal number {0}")]
pub struct UnknownSignal(pub c_int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
pub enum SignalNames {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGCHLD,
    SIGCONT,
    SIGSTOP,
    SIGTSTP,
    SIGSYS,
    UNKNOWN,
}

impl SignalNames {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalNames::SIGHUP => "SIGHUP",
            SignalNames::SIGINT => "SIGINT",
            SignalNames::SIGQUIT => "SIGQUIT",
            SignalNames::SIGILL => "SIGILL",
            SignalNames::SIGTRAP => "SIGTRAP",
            SignalNames::SIGABRT => "SIGABRT",
            SignalNames::SIGBUS => "SIGBUS",
            SignalNames::SIGFPE => "SIGFPE",
            SignalNames::SIGKILL => "SIGKILL",
            SignalNames::SIGUSR1 => "SIGUSR1",
            SignalNames::SIGSEGV => "SIGSEGV",
            SignalNames::SIGUSR2 => "SIGUSR2",
            SignalNames::SIGPIPE => "SIGPIPE",
            SignalNames::SIGALRM => "SIGALRM",
            SignalNames::SIGTERM => "SIGTERM",
            SignalNames::SIGCHLD => "SIGCHLD",
            SignalNames::SIGCONT => "SIGCONT",
            SignalNames::SIGSTOP => "SIGSTOP",
            SignalNames::SIGTSTP => "SIGTSTP",
            SignalNames::SIGSYS => "SIGSYS",
            SignalNames::UNKNOWN => "UNKNOWN",
        }
    }
}

impl From<c_int> for SignalNames {
    fn from(value: c_int) -> Self {
        match value {
            libc::SIGHUP => SignalNames::SIGHUP,
            libc::SIGINT => SignalNames::SIGINT,
            libc::SIGQUIT => SignalNames::SIGQUIT,
            libc::SIGILL => SignalNames::SIGILL,
            libc::SIGTRAP => SignalNames::SIGTRAP,
            libc::SIGABRT => SignalNames::SIGABRT,
            libc::SIGBUS => SignalNames::SIGBUS,
            libc::SIGFPE => SignalNames::SIGFPE,
            libc::SIGKILL => SignalNames::SIGKILL,
            libc::SIGUSR1 => SignalNames::SIGUSR1,
            libc::SIGSEGV => SignalNames::SIGSEGV,
            libc::SIGUSR2 => SignalNames::SIGUSR2,
            libc::SIGPIPE => SignalNames::SIGPIPE,
            libc::SIGALRM => SignalNames::SIGALRM,
            libc::SIGTERM => SignalNames::SIGTERM,
            libc::SIGCHLD => SignalNames::SIGCHLD,
            libc::SIGCONT => SignalNames::SIGCONT,
            libc::SIGSTOP => SignalNames::SIGSTOP,
            libc::SIGTSTP => SignalNames::SIGTSTP,
            libc::SIGSYS => SignalNames::SIGSYS,
            _ => SignalNames::UNKNOWN,
        }
    }
}

/// Converts a signum into a Signal. Can't use the from trait because we don't own either type.
pub fn signal_from_signum(value: c_int) -> Result<Signal, UnknownSignal> {
    match value {
        libc::SIGABRT => Ok(Signal::SIGABRT),
        libc::SIGBUS => Ok(Signal::SIGBUS),
        libc::SIGFPE => Ok(Signal::SIGFPE),
        libc::SIGILL => Ok(Signal::SIGILL),
        libc::SIGPIPE => Ok(Signal::SIGPIPE),
        libc::SIGSEGV => Ok(Signal::SIGSEGV),
        libc::SIGSYS => Ok(Signal::SIGSYS),
        libc::SIGTRAP => Ok(Signal::SIGTRAP),
        libc::SIGHUP => Ok(Signal::SIGHUP),
        libc::SIGINT => Ok(Signal::SIGINT),
        libc::SIGQUIT => Ok(Signal::SIGQUIT),
        libc::SIGTERM => Ok(Signal::SIGTERM),
        libc::SIGUSR1 => Ok(Signal::SIGUSR1),
        libc::SIGUSR2 => Ok(Signal::SIGUSR2),
        _ => Err(UnknownSignal(value)),
    }
}

pub fn signal_name(signum: c_int) -> Option<&'static str> {
    match SignalNames::from(signum) {
        SignalNames::UNKNOWN => None,
        name => Some(name.as_str()),
    }
}

/// Name of `code` for `signum`, from <asm-generic/siginfo.h>.
pub fn signal_code_name(signum: c_int, code: c_int) -> Option<&'static str> {
    let specific = match (signum, code) {
        (libc::SIGILL, 1) => Some("ILL_ILLOPC"),
        (libc::SIGILL, 2) => Some("ILL_ILLOPN"),
        (libc::SIGILL, 3) => Some("ILL_ILLADR"),
        (libc::SIGILL, 4) => Some("ILL_ILLTRP"),
        (libc::SIGILL, 5) => Some("ILL_PRVOPC"),
        (libc::SIGILL, 6) => Some("ILL_PRVREG"),
        (libc::SIGILL, 7) => Some("ILL_COPROC"),
        (libc::SIGILL, 8) => Some("ILL_BADSTK"),
        (libc::SIGFPE, 1) => Some("FPE_INTDIV"),
        (libc::SIGFPE, 2) => Some("FPE_INTOVF"),
        (libc::SIGFPE, 3) => Some("FPE_FLTDIV"),
        (libc::SIGFPE, 4) => Some("FPE_FLTOVF"),
        (libc::SIGFPE, 5) => Some("FPE_FLTUND"),
        (libc::SIGFPE, 6) => Some("FPE_FLTRES"),
        (libc::SIGFPE, 7) => Some("FPE_FLTINV"),
        (libc::SIGFPE, 8) => Some("FPE_FLTSUB"),
        (libc::SIGSEGV, 1) => Some("SEGV_MAPERR"),
        (libc::SIGSEGV, 2) => Some("SEGV_ACCERR"),
        (libc::SIGSEGV, 3) => Some("SEGV_BNDERR"),
        (libc::SIGSEGV, 4) => Some("SEGV_PKUERR"),
        (libc::SIGBUS, 1) => Some("BUS_ADRALN"),
        (libc::SIGBUS, 2) => Some("BUS_ADRERR"),
        (libc::SIGBUS, 3) => Some("BUS_OBJERR"),
        (libc::SIGBUS, 4) => Some("BUS_MCEERR_AR"),
        (libc::SIGBUS, 5) => Some("BUS_MCEERR_AO"),
        (libc::SIGTRAP, 1) => Some("TRAP_BRKPT"),
        (libc::SIGTRAP, 2) => Some("TRAP_TRACE"),
        (libc::SIGTRAP, 3) => Some("TRAP_BRANCH"),
        (libc::SIGTRAP, 4) => Some("TRAP_HWBKPT"),
        _ => None,
    };
    specific.or(match code {
        0 => Some("SI_USER"),
        0x80 => Some("SI_KERNEL"),
        -1 => Some("SI_QUEUE"),
        -2 => Some("SI_TIMER"),
        -3 => Some("SI_MESGQ"),
        -4 => Some("SI_ASYNCIO"),
        -5 => Some("SI_SIGIO"),
        -6 => Some("SI_TKILL"),
        _ => None,
    })
}

/// Whether the kernel fills `si_addr` for `signum`.
pub fn has_fault_address(signum: c_int) -> bool {
    matches!(
        signum,
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), Some("SIGSEGV"));
        assert_eq!(signal_name(1000), None);
        for signum in FATAL_SIGNALS {
            assert!(signal_name(signum).is_some());
            assert!(signal_from_signum(signum).is_ok());
        }
        assert!(signal_from_signum(1000).is_err());
    }

    #[test]
    fn test_code_names() {
        // standard values differ between oses, but it seems like segv match
        // https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/siginfo.h
        assert_eq!(signal_code_name(libc::SIGSEGV, 2), Some("SEGV_ACCERR"));
        assert_eq!(signal_code_name(libc::SIGABRT, -6), Some("SI_TKILL"));
        assert_eq!(signal_code_name(libc::SIGSEGV, 42), None);
    }
}
