// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Support for testing the crash reporter end to end.
//!
//! Crashes cannot be tested inside the test process, so every scenario runs the `crashing_app`
//! binary of this crate in a child process. The app installs the reporter under a directory
//! given on its command line, misbehaves in the way its [CrashMode] asks, and dies. Tests then
//! inspect the reports left in that directory with the helpers of [validation].
//!
//! Cargo hands integration tests the path of the app through `CARGO_BIN_EXE_crashing_app`.

pub mod validation;

use anyhow::Context;
use std::path::Path;
use std::process;

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}

/// The name the crashing app installs the reporter under. Report files start with it.
pub const APP_NAME: &str = "crashing_app";

/// What the crashing app does once the reporter is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashMode {
    /// Installs, prints the active monitor mask and exits cleanly.
    DoNothing,
    /// Dereferences a null pointer.
    Segv,
    /// Calls `abort()`.
    Abort,
    /// Raises `SIGFPE`.
    Fpe,
    /// Panics on the main thread.
    Panic,
    /// Writes a user report and keeps running.
    UserReport,
    /// Writes a user report that terminates the program.
    UserReportTerminate,
    /// Reports an uncaught managed exception, then aborts as its runtime would.
    ManagedException,
    /// Stops answering deadlock watchdog heartbeats.
    Deadlock,
    /// Crashes again while the report of a first crash is being written.
    Recrash,
    /// Hands the reports of earlier runs to a handler and prints what it saw as JSON.
    CollectReports,
    /// Deletes the reports of earlier runs and prints the report count before and after.
    DeleteAllReports,
}

impl CrashMode {
    /// Returns the string representation used as the command-line argument.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoNothing => "donothing",
            Self::Segv => "segv",
            Self::Abort => "abort",
            Self::Fpe => "fpe",
            Self::Panic => "panic",
            Self::UserReport => "user_report",
            Self::UserReportTerminate => "user_report_terminate",
            Self::ManagedException => "managed_exception",
            Self::Deadlock => "deadlock",
            Self::Recrash => "recrash",
            Self::CollectReports => "collect_reports",
            Self::DeleteAllReports => "delete_all_reports",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::DoNothing,
            Self::Segv,
            Self::Abort,
            Self::Fpe,
            Self::Panic,
            Self::UserReport,
            Self::UserReportTerminate,
            Self::ManagedException,
            Self::Deadlock,
            Self::Recrash,
            Self::CollectReports,
            Self::DeleteAllReports,
        ]
    }

    /// Whether the app exits cleanly in this mode.
    pub const fn survives(self) -> bool {
        matches!(
            self,
            Self::DoNothing
                | Self::UserReport
                | Self::CollectReports
                | Self::DeleteAllReports
        )
    }
}

impl std::fmt::Display for CrashMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CrashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("Unknown crash mode: {s}"))
    }
}

/// Runs `app` in `mode` with its reporter installed under `base_path`, and waits for it.
pub fn run_crashing_app(
    app: &Path,
    mode: CrashMode,
    base_path: &Path,
) -> anyhow::Result<process::Output> {
    let output = timeit!("crashing app run", {
        process::Command::new(app)
            .arg(mode.as_str())
            .arg(base_path)
            .output()
            .with_context(|| format!("spawning {} in mode {mode}", app.display()))?
    });
    anyhow::ensure!(
        output.status.success() == mode.survives(),
        "Unexpected exit status {:?} in mode {mode}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_mode_names_round_trip() {
        for mode in CrashMode::all() {
            assert_eq!(mode.as_str().parse::<CrashMode>(), Ok(*mode));
        }
        assert!("sigpipe".parse::<CrashMode>().is_err());
    }
}
