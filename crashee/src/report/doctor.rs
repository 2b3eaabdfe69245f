// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One line explanations of common crashes.

use super::model::{CrashError, CrashReport, StackFrame};
use crate::shared::fields::exception_type;

pub trait CrashDoctor {
    /// A short explanation of the crash, if it is one the doctor recognizes.
    fn diagnose(&self, report: &CrashReport) -> Option<String>;
}

/// Recognizes deadlocks, stack overflows, arithmetic errors and bad memory accesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrashDoctor;

impl CrashDoctor for DefaultCrashDoctor {
    fn diagnose(&self, report: &CrashReport) -> Option<String> {
        let function = last_in_app_frame(report)
            .and_then(|frame| frame.symbol_name.as_deref())
            .unwrap_or("Unknown");
        let error = &report.crash.error;

        if error.kind == exception_type::DEADLOCK {
            return Some(format!("Main thread is deadlocked at {function}"));
        }
        let overflowed = report
            .crashed_thread()
            .and_then(|thread| thread.stack.as_ref())
            .is_some_and(|stack| stack.overflow);
        if overflowed {
            return Some(format!("Stack overflow at {function}"));
        }
        if is_math_error(error) {
            return Some(format!(
                "Math error, usually caused by a division by zero, at {function}"
            ));
        }
        if is_invalid_address(error) {
            if error.address == 0 {
                return Some(format!("Attempted to dereference a null pointer at {function}"));
            }
            return Some(format!(
                "Attempted to dereference garbage pointer {:#x} at {function}",
                error.address
            ));
        }
        None
    }
}

/// Sets `crash.diagnosis` from `doctor`.
pub fn diagnose(report: &mut CrashReport, doctor: &dyn CrashDoctor) {
    report.crash.diagnosis = doctor.diagnose(report);
}

/// The innermost frame of the crashed thread that belongs to the main executable.
fn last_in_app_frame(report: &CrashReport) -> Option<&StackFrame> {
    let executable = report
        .system
        .as_ref()
        .and_then(|system| system.executable.as_deref())
        .unwrap_or(&report.report.process_name);
    report
        .crashed_thread()?
        .backtrace
        .contents
        .iter()
        .find(|frame| frame.object_name.as_deref() == Some(executable))
}

fn is_math_error(error: &CrashError) -> bool {
    match &error.mach {
        Some(mach) => mach.exception_name.as_deref() == Some("EXC_ARITHMETIC"),
        None => signal_name(error) == Some("SIGFPE"),
    }
}

fn is_invalid_address(error: &CrashError) -> bool {
    match &error.mach {
        Some(mach) => mach.exception_name.as_deref() == Some("EXC_BAD_ACCESS"),
        None => matches!(signal_name(error), Some("SIGSEGV" | "SIGBUS")),
    }
}

fn signal_name(error: &CrashError) -> Option<&str> {
    error.signal.as_ref()?.name.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn report(error: Value, overflow: bool) -> anyhow::Result<CrashReport> {
        Ok(serde_json::from_value(json!({
            "report": {
                "version": "3.2.0",
                "id": "id",
                "process_name": "myapp",
                "timestamp": 0,
                "type": "standard"
            },
            "crash": {
                "error": error,
                "threads": [
                    {
                        "backtrace": {"contents": [
                            {"instruction_addr": 2, "object_name": "myapp", "symbol_name": "idle"}
                        ]},
                        "index": 0,
                        "crashed": false
                    },
                    {
                        "backtrace": {"contents": [
                            {"instruction_addr": 16, "object_name": "libc.so.6", "symbol_name": "memcpy"},
                            {"instruction_addr": 32, "object_name": "myapp", "symbol_name": "parse_header"},
                            {"instruction_addr": 48, "object_name": "myapp", "symbol_name": "main"}
                        ]},
                        "index": 1,
                        "crashed": true,
                        "stack": {
                            "grow_direction": "-",
                            "dump_start": 0,
                            "dump_end": 0,
                            "stack_pointer": 0,
                            "overflow": overflow
                        }
                    }
                ]
            }
        }))?)
    }

    fn signal(signal: i64, name: &str, address: u64) -> Value {
        json!({
            "signal": {"signal": signal, "name": name, "code": 0},
            "address": address,
            "type": "signal"
        })
    }

    fn diagnosis(error: Value, overflow: bool) -> anyhow::Result<Option<String>> {
        let mut report = report(error, overflow)?;
        diagnose(&mut report, &DefaultCrashDoctor);
        Ok(report.crash.diagnosis)
    }

    #[test]
    fn test_null_and_garbage_pointers() -> anyhow::Result<()> {
        assert_eq!(
            diagnosis(signal(11, "SIGSEGV", 0), false)?.as_deref(),
            Some("Attempted to dereference a null pointer at parse_header")
        );
        assert_eq!(
            diagnosis(signal(7, "SIGBUS", 0xdead), false)?.as_deref(),
            Some("Attempted to dereference garbage pointer 0xdead at parse_header")
        );
        Ok(())
    }

    #[test]
    fn test_stack_overflow_wins_over_bad_access() -> anyhow::Result<()> {
        assert_eq!(
            diagnosis(signal(11, "SIGSEGV", 0x7ffe0000), true)?.as_deref(),
            Some("Stack overflow at parse_header")
        );
        Ok(())
    }

    #[test]
    fn test_math_error_and_deadlock() -> anyhow::Result<()> {
        assert_eq!(
            diagnosis(signal(8, "SIGFPE", 0), false)?.as_deref(),
            Some("Math error, usually caused by a division by zero, at parse_header")
        );
        let deadlock = json!({"signal": {"signal": 0, "code": 0}, "type": "deadlock"});
        assert_eq!(
            diagnosis(deadlock, false)?.as_deref(),
            Some("Main thread is deadlocked at parse_header")
        );
        Ok(())
    }

    #[test]
    fn test_unrecognized_crash() -> anyhow::Result<()> {
        assert_eq!(diagnosis(signal(6, "SIGABRT", 0), false)?, None);
        let user = json!({"type": "user", "user_reported": {"name": "Boom"}});
        assert_eq!(diagnosis(user, false)?, None);
        Ok(())
    }

    #[test]
    fn test_unknown_function_outside_the_app() -> anyhow::Result<()> {
        let mut report = report(signal(11, "SIGSEGV", 0), false)?;
        report.report.process_name = "other".to_owned();
        assert_eq!(
            DefaultCrashDoctor.diagnose(&report).as_deref(),
            Some("Attempted to dereference a null pointer at Unknown")
        );
        Ok(())
    }
}
