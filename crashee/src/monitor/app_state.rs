// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application lifecycle statistics, persisted across launches.
//!
//! The state lives behind a mutex. Lifecycle notifications take the lock normally; the crash path
//! only ever tries it, so a thread suspended while holding it costs the report its statistics
//! instead of deadlocking the handler.

use super::event::CrashEvent;
use super::{MonitorApi, MonitorType};
use crate::report::buffered_writer::BufferedWriter;
use crate::report::json_codec::{JsonEncoder, JsonResult};
use crate::shared::constants::APP_STATE_FORMAT_VERSION;
use anyhow::Context;
use serde::Deserialize;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Mutex;

const KEY_VERSION: &str = "version";
const KEY_CRASHED_LAST_LAUNCH: &str = "crashedLastLaunch";
const KEY_ACTIVE_DURATION: &str = "activeDurationSinceLastCrash";
const KEY_BACKGROUND_DURATION: &str = "backgroundDurationSinceLastCrash";
const KEY_LAUNCHES: &str = "launchesSinceLastCrash";
const KEY_SESSIONS: &str = "sessionsSinceLastCrash";

/// Statistics copied into every report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AppStats {
    pub application_is_active: bool,
    pub application_is_in_foreground: bool,
    pub crashed_last_launch: bool,
    pub crashed_this_launch: bool,
    pub launches_since_last_crash: i64,
    pub sessions_since_last_crash: i64,
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub sessions_since_launch: i64,
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
}

impl AppStats {
    const fn new() -> Self {
        Self {
            application_is_active: true,
            application_is_in_foreground: false,
            crashed_last_launch: false,
            crashed_this_launch: false,
            launches_since_last_crash: 0,
            sessions_since_last_crash: 0,
            active_duration_since_last_crash: 0.0,
            background_duration_since_last_crash: 0.0,
            sessions_since_launch: 0,
            active_duration_since_launch: 0.0,
            background_duration_since_launch: 0.0,
        }
    }
}

/// The persisted subset of [AppStats].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAppState {
    version: i64,
    #[serde(default)]
    crashed_last_launch: bool,
    #[serde(default)]
    active_duration_since_last_crash: f64,
    #[serde(default)]
    background_duration_since_last_crash: f64,
    #[serde(default)]
    launches_since_last_crash: i64,
    #[serde(default)]
    sessions_since_last_crash: i64,
}

struct AppState {
    stats: AppStats,
    /// Monotonic seconds of the last active or foreground transition.
    transition_time: f64,
    path: Option<CString>,
}

impl AppState {
    const fn new() -> Self {
        Self {
            stats: AppStats::new(),
            transition_time: 0.0,
            path: None,
        }
    }

    /// Accounts the time elapsed since the last transition.
    fn update_durations(&mut self, now: f64) {
        let elapsed = now - self.transition_time;
        self.transition_time = now;
        let stats = &mut self.stats;
        if stats.application_is_active {
            stats.active_duration_since_launch += elapsed;
            stats.active_duration_since_last_crash += elapsed;
        } else if !stats.application_is_in_foreground {
            stats.background_duration_since_launch += elapsed;
            stats.background_duration_since_last_crash += elapsed;
        }
    }

    /// Starts a new launch from what the previous one left behind.
    fn reset(&mut self, now: f64) {
        let stats = &mut self.stats;
        stats.sessions_since_launch = 1;
        stats.active_duration_since_launch = 0.0;
        stats.background_duration_since_launch = 0.0;
        if stats.crashed_last_launch {
            stats.active_duration_since_last_crash = 0.0;
            stats.background_duration_since_last_crash = 0.0;
            stats.launches_since_last_crash = 0;
            stats.sessions_since_last_crash = 0;
        }
        stats.crashed_this_launch = false;
        // Simulate the first transition to foreground.
        stats.launches_since_last_crash += 1;
        stats.sessions_since_last_crash += 1;
        stats.application_is_in_foreground = true;
        self.transition_time = now;
    }

    fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            // First launch.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let persisted: PersistedAppState = serde_json::from_slice(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        anyhow::ensure!(
            persisted.version == APP_STATE_FORMAT_VERSION,
            "expected app state version {}, got {}",
            APP_STATE_FORMAT_VERSION,
            persisted.version
        );
        let stats = &mut self.stats;
        stats.crashed_last_launch = persisted.crashed_last_launch;
        stats.active_duration_since_last_crash = persisted.active_duration_since_last_crash;
        stats.background_duration_since_last_crash = persisted.background_duration_since_last_crash;
        stats.launches_since_last_crash = persisted.launches_since_last_crash;
        stats.sessions_since_last_crash = persisted.sessions_since_last_crash;
        Ok(())
    }

    /// Writes the persisted fields without allocating, as this also runs on the crash path.
    fn save(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(e) = self.try_save(path) {
            crash_error!("Could not save app state to {:?}: {}", path, e);
        }
    }

    fn try_save(&self, path: &CStr) -> Result<(), SaveError> {
        let sink = BufferedWriter::create(path).map_err(SaveError::Open)?;
        let mut encoder = JsonEncoder::new(sink, true);
        self.encode(&mut encoder).map_err(SaveError::Encode)?;
        if !encoder.flush() {
            return Err(SaveError::Write);
        }
        Ok(())
    }

    fn encode(&self, encoder: &mut JsonEncoder<BufferedWriter>) -> JsonResult {
        let stats = &self.stats;
        encoder.begin_object(None)?;
        encoder.add_integer_element(Some(KEY_VERSION), APP_STATE_FORMAT_VERSION)?;
        // Seen from the next launch, this one is the last.
        encoder.add_boolean_element(Some(KEY_CRASHED_LAST_LAUNCH), stats.crashed_this_launch)?;
        encoder.add_floating_point_element(
            Some(KEY_ACTIVE_DURATION),
            stats.active_duration_since_last_crash,
        )?;
        encoder.add_floating_point_element(
            Some(KEY_BACKGROUND_DURATION),
            stats.background_duration_since_last_crash,
        )?;
        encoder.add_integer_element(Some(KEY_LAUNCHES), stats.launches_since_last_crash)?;
        encoder.add_integer_element(Some(KEY_SESSIONS), stats.sessions_since_last_crash)?;
        encoder.end_encode()
    }
}

#[derive(Debug, thiserror::Error)]
enum SaveError {
    #[error("open failed with errno {0}")]
    Open(i32),
    #[error(transparent)]
    Encode(#[from] crate::report::json_codec::JsonError),
    #[error("write failed")]
    Write,
}

/// Seconds on the monotonic clock. Async-signal-safe.
fn now() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

pub struct AppStateMonitor {
    enabled: AtomicBool,
    state: Mutex<AppState>,
}

impl AppStateMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            state: Mutex::new(AppState::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Loads the state persisted at `path` and remembers it as the save location.
    ///
    /// A missing file is a first launch. A file that cannot be read leaves the counters at zero.
    pub fn initialize(&self, path: &Path) -> anyhow::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        let mut state = self.lock();
        state.path = Some(c_path);
        state.transition_time = now();
        let result = state.load(path);
        if let Err(e) = &result {
            tracing::warn!("Could not load app state: {e:#}");
        }
        tracing::debug!(
            launches = state.stats.launches_since_last_crash,
            crashed_last_launch = state.stats.crashed_last_launch,
            "Loaded app state"
        );
        result
    }

    pub fn notify_app_active(&self, is_active: bool) {
        let mut state = self.lock();
        let now = now();
        if is_active {
            state.transition_time = now;
        } else {
            let elapsed = now - state.transition_time;
            state.stats.active_duration_since_launch += elapsed;
            state.stats.active_duration_since_last_crash += elapsed;
        }
        state.stats.application_is_active = is_active;
    }

    pub fn notify_app_in_foreground(&self, is_in_foreground: bool) {
        let mut state = self.lock();
        let now = now();
        state.stats.application_is_in_foreground = is_in_foreground;
        if is_in_foreground {
            let elapsed = now - state.transition_time;
            let stats = &mut state.stats;
            stats.background_duration_since_launch += elapsed;
            stats.background_duration_since_last_crash += elapsed;
            stats.sessions_since_last_crash += 1;
            stats.sessions_since_launch += 1;
        } else {
            state.transition_time = now;
            state.save();
        }
    }

    pub fn notify_app_terminate(&self) {
        let mut state = self.lock();
        state.update_durations(now());
        state.save();
    }

    /// Records that this launch crashed. Runs on the crash path.
    pub fn notify_app_crash(&self) {
        let Ok(mut state) = self.state.try_lock() else {
            crash_warn!("App state is locked, cannot record the crash");
            return;
        };
        state.update_durations(now());
        state.stats.crashed_this_launch = true;
        state.save();
    }

    pub fn stats(&self) -> AppStats {
        self.lock().stats
    }
}

impl Default for AppStateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for AppStateMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::APPLICATION_STATE
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, SeqCst) == enabled || !enabled {
            return;
        }
        let Ok(mut state) = self.state.try_lock() else {
            crash_warn!("App state is locked, not resetting it");
            return;
        };
        state.reset(now());
        state.save();
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, event: &mut CrashEvent<'_>) {
        if !self.is_enabled() {
            return;
        }
        let Ok(mut state) = self.state.try_lock() else {
            crash_warn!("App state is locked, leaving it out of the report");
            return;
        };
        state.update_durations(now());
        event.app_stats = state.stats;
    }
}
