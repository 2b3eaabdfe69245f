// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide reporter state.
//!
//! All state the crash path reads lives in one static [ReporterContext], built in const context
//! so that it exists before anything is installed and never needs to be torn down. Fields
//! touched on the crash path are atomics, try-locked, or written only by the thread handling the
//! crash episode.

use crate::collector::suspension::SuspensionController;
use crate::monitor::registry::MonitorRegistry;
use crate::monitor::{MonitorType, Monitors};
use crate::report::crash_report::ReportSettings;
use crate::shared::fmt_buf::FmtBuf;
use crate::store::{ReportStore, REPORT_PATH_CAPACITY};
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, OnceLock, RwLock};

/// Called with the id of each report written by the crash path.
pub type ReportWrittenCallback = fn(u64);

/// The application lifecycle state last reported to the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    None,
    DidBecomeActive,
    WillResignActive,
    DidEnterBackground,
    WillEnterForeground,
    WillTerminate,
}

/// Where an installed reporter keeps its files.
#[derive(Debug)]
pub struct Installation {
    pub app_name: String,
    pub base_path: PathBuf,
    pub reports_dir: PathBuf,
    pub state_path: PathBuf,
    pub console_log_path: CString,
}

/// Path of the last standard report, kept so that a crash while writing it can be turned into
/// a recrash report.
pub struct LastReportPath {
    path: UnsafeCell<FmtBuf<REPORT_PATH_CAPACITY>>,
}

// SAFETY: only the thread handling a crash episode touches the path, and episodes are serialised
// by the monitor registry and, for snapshots, by `ReporterContext::user_report_lock`.
unsafe impl Sync for LastReportPath {}

impl LastReportPath {
    const fn new() -> Self {
        Self {
            path: UnsafeCell::new(FmtBuf::new()),
        }
    }

    /// A copy of the path. An episode interrupted by a recrash keeps using its own copy, so no
    /// reference into the shared buffer is ever held.
    ///
    /// # Safety
    /// The caller must be the thread handling the current crash episode.
    pub unsafe fn load(&self) -> FmtBuf<REPORT_PATH_CAPACITY> {
        (*self.path.get()).clone()
    }

    /// # Safety
    /// The caller must be the thread handling the current crash episode.
    pub unsafe fn store(&self, path: &FmtBuf<REPORT_PATH_CAPACITY>) {
        self.path.get().write(path.clone());
    }
}

pub struct ReporterContext {
    pub suspension: SuspensionController,
    pub monitors: Monitors,
    pub registry: MonitorRegistry,
    pub store: ReportStore,
    pub report_settings: RwLock<ReportSettings>,
    pub report_written_callback: RwLock<Option<ReportWrittenCallback>>,
    pub installation: OnceLock<Installation>,
    /// The mask requested through the API, applied at install time.
    pub requested_monitoring: Mutex<MonitorType>,
    pub lifecycle: Mutex<LifecycleState>,
    pub add_console_log_to_report: AtomicBool,
    pub print_previous_log: AtomicBool,
    pub last_report_path: LastReportPath,
    /// Serialises reports the application requests, which do not go through the registry's
    /// fatal episode guard.
    pub user_report_lock: Mutex<()>,
}

impl ReporterContext {
    const fn new() -> Self {
        Self {
            suspension: SuspensionController::new(),
            monitors: Monitors::new(),
            registry: MonitorRegistry::new(),
            store: ReportStore::new(),
            report_settings: RwLock::new(ReportSettings::new()),
            report_written_callback: RwLock::new(None),
            installation: OnceLock::new(),
            requested_monitoring: Mutex::new(MonitorType::PRODUCTION_SAFE_MINIMAL),
            lifecycle: Mutex::new(LifecycleState::None),
            add_console_log_to_report: AtomicBool::new(false),
            print_previous_log: AtomicBool::new(false),
            last_report_path: LastReportPath::new(),
            user_report_lock: Mutex::new(()),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installation.get().is_some()
    }
}

static CONTEXT: ReporterContext = ReporterContext::new();

pub fn context() -> &'static ReporterContext {
    &CONTEXT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn test_last_report_path_hands_out_copies() {
        let last = LastReportPath::new();
        let mut first = FmtBuf::<REPORT_PATH_CAPACITY>::new();
        write!(first, "/tmp/app-report-0000000000000001.json").unwrap();
        // SAFETY: this test is the only user of `last`.
        unsafe { last.store(&first) };
        let mut interrupted = unsafe { last.load() };

        let mut second = FmtBuf::<REPORT_PATH_CAPACITY>::new();
        write!(second, "/tmp/app-report-0000000000000002.json").unwrap();
        unsafe { last.store(&second) };

        assert_eq!(interrupted.as_str(), "/tmp/app-report-0000000000000001.json");
        assert!(interrupted.as_c_str().is_some());
        assert_eq!(unsafe { last.load() }.as_str(), second.as_str());
    }
}
