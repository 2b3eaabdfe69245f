// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The entry points applications call.
//!
//! Configuration may be set before or after [install]. Settings that only matter once installed
//! are remembered and applied by [install].

use crate::context::{context, Installation, LifecycleState, ReportWrittenCallback};
use crate::monitor::app_state::AppStats;
use crate::monitor::event::CrashEvent;
use crate::monitor::system::AppIdentity;
use crate::monitor::user::UserException;
use crate::monitor::{registered_monitors, MonitorType};
use crate::report::crash_report::{
    write_recrash_report, write_standard_report, ReportSettings, UserSectionCallback,
    EMPTY_SETTINGS,
};
use crate::report::introspection::{register_introspector, ObjectIntrospector};
use crate::report::{
    collect_pending_reports, fixer, CollectionSummary, DefaultCrashDoctor, ReportHandler,
};
use crate::shared::configuration::{validate_json, validate_json_object, CrasheeConfiguration};
use crate::shared::constants::{CONSOLE_LOG_FILE, CRASH_STATE_FILE, DATA_DIR, REPORTS_DIR};
use crate::shared::fmt_buf::FmtBuf;
use crate::shared::log;
use crate::store::REPORT_PATH_CAPACITY;
use crate::{collector, store::StoreError};
use anyhow::Context as _;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Duration;

/// Installs the reporter, keeping its files under `base_path`, and enables the requested
/// monitors. Returns the monitors that actually got enabled.
///
/// Installing twice does nothing the second time and returns the active monitors.
pub fn install(app_name: &str, base_path: &Path) -> anyhow::Result<MonitorType> {
    let context = context();
    let requested = context
        .requested_monitoring
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if context.is_installed() {
        tracing::debug!("Crash reporter already installed");
        return Ok(context.registry.active_monitors());
    }
    tracing::debug!(app_name, ?base_path, "Installing crash reporter");

    let reports_dir = base_path.join(REPORTS_DIR);
    context
        .store
        .initialize(&reports_dir, app_name)
        .context("Failed to initialize the report store")?;

    let data_dir = base_path.join(DATA_DIR);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let state_path = data_dir.join(CRASH_STATE_FILE);
    context.monitors.app_state.initialize(&state_path)?;

    let console_log_path = data_dir.join(CONSOLE_LOG_FILE);
    if context.print_previous_log.load(SeqCst) {
        print_previous_log(&console_log_path);
    }
    log::set_log_filename(Some(&console_log_path), true)
        .with_context(|| format!("Failed to open {}", console_log_path.display()))?;

    context.suspension.install()?;
    collector::dynamic_linker::init();
    context.monitors.system.set_default_name(app_name);
    context.registry.set_event_callback(on_crash);

    let installation = Installation {
        app_name: app_name.to_owned(),
        base_path: base_path.to_path_buf(),
        reports_dir,
        state_path,
        console_log_path: CString::new(console_log_path.as_os_str().as_bytes())?,
    };
    if context.installation.set(installation).is_err() {
        anyhow::bail!("Crash reporter installed concurrently");
    }

    let active = context
        .registry
        .set_active_monitors(&registered_monitors(), *requested);
    drop(requested);
    tracing::debug!("Installation complete, active monitors {:#x}", active.bits());

    replay_lifecycle_state();
    Ok(active)
}

/// Applies `config`, then installs as [install] does.
pub fn install_with_configuration(
    app_name: &str,
    base_path: &Path,
    config: &CrasheeConfiguration,
) -> anyhow::Result<MonitorType> {
    set_user_info(config.user_info_json())?;
    set_introspect_memory(config.introspect_memory());
    set_do_not_introspect_classes(config.do_not_introspect_classes().as_slice());
    set_add_console_log_to_report(config.add_console_log_to_report());
    set_print_previous_log(config.print_previous_log());
    set_max_report_count(config.max_report_count());
    set_deadlock_watchdog_interval(config.deadlock_watchdog_interval());
    context()
        .monitors
        .signal
        .configure_alt_stack(config.create_alt_stack(), config.use_alt_stack());
    set_monitoring(config.monitoring());
    install(app_name, base_path)
}

/// Selects the monitors to run. Returns the ones now enabled, or the requested ones if not yet
/// installed.
pub fn set_monitoring(monitors: MonitorType) -> MonitorType {
    let context = context();
    let mut requested = context
        .requested_monitoring
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    *requested = monitors;
    if context.is_installed() {
        context
            .registry
            .set_active_monitors(&registered_monitors(), monitors)
    } else {
        monitors
    }
}

pub fn active_monitors() -> MonitorType {
    context().registry.active_monitors()
}

/// Sets the JSON object written into the `user` block of every report. `None` clears it.
pub fn set_user_info(json: Option<&str>) -> anyhow::Result<()> {
    if let Some(json) = json {
        validate_json_object(json)?;
    }
    write_settings().user_info_json = json.map(str::to_owned);
    Ok(())
}

/// Adds, replaces or, with `None`, removes a field of the `user` block.
pub fn set_report_field(key: &str, json: Option<&str>) -> anyhow::Result<()> {
    anyhow::ensure!(!key.is_empty(), "Report field keys cannot be empty");
    if let Some(json) = json {
        validate_json(json)?;
    }
    let mut settings = write_settings();
    let fields = &mut settings.custom_fields;
    let existing = fields.iter().position(|(k, _)| k == key);
    match (existing, json) {
        (Some(index), Some(json)) => fields[index].1 = json.to_owned(),
        (Some(index), None) => {
            fields.remove(index);
        }
        (None, Some(json)) => fields.push((key.to_owned(), json.to_owned())),
        (None, None) => {}
    }
    Ok(())
}

/// Whether values near the crash are described in the report.
pub fn set_introspect_memory(introspect_memory: bool) {
    write_settings().introspection.enabled = introspect_memory;
}

/// Classes whose objects are described by class name only.
pub fn set_do_not_introspect_classes<S: AsRef<str>>(classes: &[S]) {
    write_settings().introspection.excluded_classes =
        classes.iter().map(|c| c.as_ref().to_owned()).collect();
}

/// Called while writing the `user` block of fatal reports, to add application fields.
pub fn set_user_section_callback(callback: Option<UserSectionCallback>) {
    write_settings().user_section_callback = callback;
}

/// Called with the id of each report written on the crash path.
pub fn set_report_written_callback(callback: Option<ReportWrittenCallback>) {
    *write_lock(&context().report_written_callback) = callback;
}

/// Whether the console log is embedded in reports. The log is cleared after each user report
/// when set.
pub fn set_add_console_log_to_report(add: bool) {
    context().add_console_log_to_report.store(add, SeqCst);
}

/// Whether [install] prints the console log of the previous run to stdout.
pub fn set_print_previous_log(print: bool) {
    context().print_previous_log.store(print, SeqCst);
}

pub fn set_max_report_count(max_report_count: usize) {
    context().store.set_max_report_count(max_report_count);
}

pub fn set_deadlock_watchdog_interval(interval: Duration) {
    context().monitors.deadlock.set_interval(interval);
}

/// How the application names and versions itself in reports. Must be set before install.
pub fn set_app_identity(identity: AppIdentity) {
    context().monitors.system.set_identity(identity);
}

/// Lets an embedding runtime describe its objects in reports. Only the first registration
/// counts.
pub fn register_object_introspector(introspector: &'static dyn ObjectIntrospector) -> bool {
    register_introspector(introspector)
}

/// Records the currently loaded libraries for crash reports. Reports only name the images
/// known at install or at the last refresh, so call this after loading libraries with `dlopen`.
/// Lifecycle notifications and user reports refresh as well.
pub fn refresh_binary_images() -> usize {
    collector::dynamic_linker::refresh()
}

/// Writes a report for an exception the application caught itself.
///
/// With `terminate_program` set the process aborts once the report is written. Returns false
/// if the user reported monitor is not enabled.
pub fn report_user_exception(exception: &UserException<'_>) -> bool {
    let context = context();
    if context.is_installed() {
        collector::dynamic_linker::refresh();
    }
    let reported = {
        let _guard = context
            .user_report_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        context.monitors.user.report(exception)
    };
    if reported && context.add_console_log_to_report.load(SeqCst) {
        if let Err(e) = log::clear_log_file() {
            tracing::warn!("Could not clear the console log: {e}");
        }
    }
    reported
}

/// Writes a report for an uncaught exception of an embedding runtime. `call_stack` holds the
/// return addresses recorded when the exception was thrown, innermost first.
///
/// Returns false if the managed exception monitor is not enabled.
pub fn report_managed_exception(
    name: &str,
    reason: Option<&str>,
    user_info: Option<&str>,
    call_stack: &[usize],
) -> bool {
    context()
        .monitors
        .managed_exception
        .report(name, reason, user_info, call_stack)
}

pub fn notify_app_active(is_active: bool) {
    let context = context();
    if context.is_installed() {
        context.monitors.app_state.notify_app_active(is_active);
        collector::dynamic_linker::refresh();
    }
    set_lifecycle_state(if is_active {
        LifecycleState::DidBecomeActive
    } else {
        LifecycleState::WillResignActive
    });
}

pub fn notify_app_in_foreground(is_in_foreground: bool) {
    let context = context();
    if context.is_installed() {
        context
            .monitors
            .app_state
            .notify_app_in_foreground(is_in_foreground);
        collector::dynamic_linker::refresh();
    }
    set_lifecycle_state(if is_in_foreground {
        LifecycleState::WillEnterForeground
    } else {
        LifecycleState::DidEnterBackground
    });
}

pub fn notify_app_terminate() {
    let context = context();
    if context.is_installed() {
        context.monitors.app_state.notify_app_terminate();
    }
    set_lifecycle_state(LifecycleState::WillTerminate);
}

/// Records a crash the application handled through other means.
pub fn notify_app_crash() {
    context().monitors.app_state.notify_app_crash();
}

/// The application state counters, as they would appear in a report now.
pub fn app_stats() -> AppStats {
    context().monitors.app_state.stats()
}

/// Tells the deadlock watchdog the main thread is responsive. Call it from the main thread.
pub fn notify_main_thread_heartbeat() {
    context().monitors.deadlock.heartbeat();
}

/// Records the last exception object an embedding runtime deallocated.
pub fn notify_exception_deallocated(address: usize, name: &str, reason: &str) {
    context()
        .monitors
        .zombie
        .notify_exception_deallocated(address, name, reason);
}

pub fn report_count() -> Result<usize, StoreError> {
    context().store.report_count()
}

/// Ids of the stored reports, oldest first.
pub fn report_ids() -> Result<Vec<u64>, StoreError> {
    context().store.report_ids()
}

/// A stored report, with symbols demangled and timestamps made readable. `None` if there is no
/// report with this id.
pub fn read_report(id: u64) -> anyhow::Result<Option<String>> {
    let Some(raw) = context().store.read_report(id)? else {
        tracing::warn!("No report with id {id:016x}");
        return Ok(None);
    };
    let fixed = fixer::fix_report(&raw)
        .with_context(|| format!("Failed to fix up report {id:016x}"))?;
    Ok(Some(fixed))
}

/// Stores a report built by the application. Returns its id.
pub fn add_user_report(report: &[u8]) -> Result<u64, StoreError> {
    context().store.add_user_report(report)
}

pub fn delete_report(id: u64) -> Result<(), StoreError> {
    context().store.delete_report(id)
}

pub fn delete_all_reports() -> Result<(), StoreError> {
    context().store.delete_all_reports()
}

/// Hands every stored report to `handler`, deleting the ones it accepts.
pub fn send_pending_reports(
    handler: &mut dyn ReportHandler,
) -> Result<CollectionSummary, StoreError> {
    collect_pending_reports(&context().store, &DefaultCrashDoctor, handler)
}

fn write_settings() -> RwLockWriteGuard<'static, ReportSettings> {
    write_lock(&context().report_settings)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Reads `lock` without blocking, for the crash path.
fn try_read_lock<T>(lock: &RwLock<T>) -> Option<RwLockReadGuard<'_, T>> {
    match lock.try_read() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn set_lifecycle_state(state: LifecycleState) {
    *context().lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = state;
}

/// Passes on the lifecycle notification received before install.
fn replay_lifecycle_state() {
    let state = *context().lifecycle.lock().unwrap_or_else(|e| e.into_inner());
    tracing::debug!(?state, "Notifying of pre-installation state");
    match state {
        LifecycleState::None => {}
        LifecycleState::DidBecomeActive => notify_app_active(true),
        LifecycleState::WillResignActive => notify_app_active(false),
        LifecycleState::DidEnterBackground => notify_app_in_foreground(false),
        LifecycleState::WillEnterForeground => notify_app_in_foreground(true),
        LifecycleState::WillTerminate => notify_app_terminate(),
    }
}

fn print_previous_log(path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(log) => {
            println!("\nvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvv Previous Log vvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvv\n");
            println!("{log}");
            println!("^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^\n");
        }
        Err(e) => tracing::debug!("No previous log to print: {e}"),
    }
}

/// Where every crash episode ends: writes the report of `event`.
fn on_crash(event: &mut CrashEvent<'_>) {
    let context = context();
    if !event.is_snapshot() {
        crash_debug!("Updating application state to note crash.");
        context.monitors.app_state.notify_app_crash();
    }
    if context.add_console_log_to_report.load(SeqCst) {
        event.console_log_path = context
            .installation
            .get()
            .map(|installation| installation.console_log_path.as_c_str());
    }

    let settings_guard = try_read_lock(&context.report_settings);
    let settings = match &settings_guard {
        Some(settings) => &**settings,
        None => {
            crash_warn!("Report settings are being changed, writing the report without them");
            &EMPTY_SETTINGS
        }
    };

    if event.crashed_during_crash_handling {
        // SAFETY: this thread is handling the current episode.
        let mut interrupted = unsafe { context.last_report_path.load() };
        match interrupted.as_c_str() {
            Some(path) if !path.is_empty() => write_recrash_report(event, settings, path),
            _ => crash_error!("No interrupted report to write a recrash report over"),
        }
        return;
    }

    let mut path = FmtBuf::<REPORT_PATH_CAPACITY>::new();
    let Some(id) = context.store.next_report_path(&mut path) else {
        crash_error!("Could not get a report path, dropping the report");
        return;
    };
    // SAFETY: this thread is handling the current episode.
    unsafe { context.last_report_path.store(&path) };
    match path.as_c_str() {
        Some(path) => write_standard_report(event, settings, path),
        None => {
            crash_error!("Invalid report path");
            return;
        }
    }

    if let Some(callback) = try_read_lock(&context.report_written_callback).and_then(|c| *c) {
        callback(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests share the process-wide context, so each one only touches settings no other
    // test reads.

    /// The `user` block of a report written with the current settings.
    fn user_block() -> anyhow::Result<serde_json::Value> {
        use crate::collector::machine_context::MachineContext;
        use crate::collector::stack_cursor::StackCursor;
        use crate::collector::threads::{current_thread_id, ThreadList};
        use crate::monitor::event::CrashKind;
        use crate::report::crash_report::write_standard_report_to;
        use crate::report::writer::JsonReportWriter;

        let settings = try_read_lock(&context().report_settings)
            .ok_or_else(|| anyhow::anyhow!("settings locked"))?
            .clone();
        let mut threads = ThreadList::new();
        threads.push(current_thread_id());
        let machine = MachineContext::for_current_thread(true, threads);
        let event = CrashEvent::new("fields", CrashKind::Signal, &machine, StackCursor::empty());
        let mut writer = JsonReportWriter::new(Vec::new());
        write_standard_report_to(&mut writer, &event, &settings);
        let report: serde_json::Value = serde_json::from_slice(&writer.finish())?;
        Ok(report["user"].clone())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_fields_are_validated_and_replaced() -> anyhow::Result<()> {
        assert!(set_report_field("broken", Some("{\"a\": ")).is_err());
        assert!(set_report_field("", Some("1")).is_err());

        set_report_field("build", Some("\"debug\""))?;
        set_report_field("retries", Some("3"))?;
        set_report_field("ratio", Some("-1.5"))?;
        set_report_field("beta", Some("true"))?;
        set_report_field("owner", Some("null"))?;
        set_report_field("build", Some("{\"flavor\": \"release\"}"))?;
        assert_eq!(
            user_block()?,
            serde_json::json!({
                "build": {"flavor": "release"},
                "retries": 3,
                "ratio": -1.5,
                "beta": true,
                "owner": null,
            })
        );

        for key in ["build", "retries", "ratio", "beta", "owner"] {
            set_report_field(key, None)?;
        }
        let settings = try_read_lock(&context().report_settings)
            .ok_or_else(|| anyhow::anyhow!("settings locked"))?;
        assert!(settings.custom_fields.is_empty());
        Ok(())
    }

    #[test]
    fn test_user_info_must_be_a_json_object() {
        assert!(set_user_info(Some("not json")).is_err());
        for not_an_object in ["42", "\"text\"", "[1, 2]", "true"] {
            assert!(set_user_info(Some(not_an_object)).is_err(), "{not_an_object}");
        }
    }

    #[test]
    fn test_store_operations_need_install() {
        if context().is_installed() {
            return;
        }
        assert!(matches!(report_count(), Err(StoreError::NotInitialized)));
    }

    #[test]
    fn test_lifecycle_state_is_remembered_before_install() {
        if context().is_installed() {
            return;
        }
        notify_app_in_foreground(false);
        assert_eq!(
            *context().lifecycle.lock().unwrap(),
            LifecycleState::DidEnterBackground
        );
    }
}
