// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writes crash events as JSON reports.
//!
//! Two shapes are written. The standard report carries everything known about the episode, in
//! blocks flushed one at a time so that a crash while writing still leaves the earlier blocks on
//! disk. The recrash report is written when the reporter itself crashed: it embeds whatever the
//! interrupted standard report got to, plus the offending thread of the new crash.
//!
//! Everything here runs on the crash path and allocates nothing.

use super::buffered_writer::BufferedWriter;
use super::introspection::{introspector, IntrospectionRules, MemoryIntrospection};
use super::json_codec::JsonSink;
use super::writer::{JsonReportWriter, ReportWriter};
use crate::collector::cpu::STACK_GROW_DIRECTION;
use crate::collector::dynamic_linker::{self, BinaryImage};
use crate::collector::machine_context::MachineContext;
use crate::collector::memory::{copy_safely, read_word};
use crate::collector::signal_info::{signal_code_name, signal_name};
use crate::collector::stack_cursor::StackCursor;
use crate::collector::threads::{current_thread_id, thread_name, ThreadId};
use crate::monitor::app_state::AppStats;
use crate::monitor::event::{CrashEvent, CrashKind};
use crate::monitor::system::{MemoryStats, SystemInfo};
use crate::shared::constants::{
    CRASHEE_REPORT_VERSION, DEFAULT_MEMORY_SEARCH_DEPTH, MAX_PATH_LENGTH,
    STACK_CONTENTS_POPPED_DISTANCE, STACK_CONTENTS_PUSHED_DISTANCE,
    STACK_NOTABLE_SEARCH_BACK_DISTANCE, STACK_NOTABLE_SEARCH_FORWARD_DISTANCE,
    STACK_OVERFLOW_THRESHOLD,
};
use crate::shared::fields::{self, report_type};
use crate::shared::fmt_buf::FmtBuf;
use std::ffi::CStr;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

const WORD: usize = std::mem::size_of::<usize>();
const STACK_DUMP_SIZE: usize = (STACK_CONTENTS_PUSHED_DISTANCE + STACK_CONTENTS_POPPED_DISTANCE) * WORD;

/// Lets the application add its own fields to the `user` block of fatal reports.
pub type UserSectionCallback = fn(&mut dyn ReportWriter);

/// What the application configured about report contents.
///
/// Written on application threads under the context's lock, read on the crash path.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    /// A JSON object, merged into the `user` block.
    pub user_info_json: Option<String>,
    pub introspection: IntrospectionRules,
    pub user_section_callback: Option<UserSectionCallback>,
    /// Extra `user` fields, each holding a validated JSON value.
    pub custom_fields: Vec<(String, String)>,
}

impl ReportSettings {
    pub const fn new() -> Self {
        Self {
            user_info_json: None,
            introspection: IntrospectionRules::new(),
            user_section_callback: None,
            custom_fields: Vec::new(),
        }
    }
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Used when the settings cannot be read without blocking.
pub static EMPTY_SETTINGS: ReportSettings = ReportSettings::new();

struct Report<'a, 'e> {
    event: &'a CrashEvent<'e>,
    settings: &'a ReportSettings,
    introspection: MemoryIntrospection<'a>,
}

impl<'a, 'e> Report<'a, 'e> {
    fn new(event: &'a CrashEvent<'e>, settings: &'a ReportSettings) -> Self {
        Self {
            event,
            settings,
            introspection: MemoryIntrospection {
                runtime: introspector(),
                rules: &settings.introspection,
            },
        }
    }

    fn process_name(&self) -> &str {
        self.event.system.map(|s| s.process_name.as_str()).unwrap_or_default()
    }
}

/// Writes the standard report of `event` to `path`.
pub fn write_standard_report(event: &CrashEvent<'_>, settings: &ReportSettings, path: &CStr) {
    crash_info!("Writing crash report to {:?}", path);
    let sink = match BufferedWriter::create(path) {
        Ok(sink) => sink,
        Err(errno) => {
            crash_error!("Could not open crash report file {:?}: errno {}", path, errno);
            return;
        }
    };
    let mut writer = JsonReportWriter::new(sink);
    write_standard_report_to(&mut writer, event, settings);
    writer.finish();
}

/// Writes the standard report of `event` through `writer`, leaving the document open.
pub fn write_standard_report_to<W: JsonSink>(
    writer: &mut JsonReportWriter<W>,
    event: &CrashEvent<'_>,
    settings: &ReportSettings,
) {
    let report = Report::new(event, settings);

    writer.begin_object(Some(fields::REPORT));
    write_report_info(writer, fields::REPORT, report_type::STANDARD, &report);
    writer.flush();

    write_binary_images(writer, fields::BINARY_IMAGES);
    writer.flush();

    write_process_state(writer, fields::PROCESS_STATE, &report);
    writer.flush();

    write_system_info(writer, fields::SYSTEM, &report);
    writer.flush();

    writer.begin_object(Some(fields::CRASH));
    write_error(writer, fields::ERROR, &report);
    writer.flush();
    write_all_threads(writer, fields::THREADS, &report);
    writer.end_container();
    writer.flush();

    write_user_section(writer, &report);
    writer.flush();

    write_debug_info(writer, fields::DEBUG, &report);
}

/// Writes a minimal report to `path` embedding the report found there, which a crash in the
/// reporter left incomplete.
pub fn write_recrash_report(event: &CrashEvent<'_>, settings: &ReportSettings, path: &CStr) {
    let mut old_path = FmtBuf::<MAX_PATH_LENGTH>::new();
    if !recrash_backup_path(path, &mut old_path) {
        crash_error!("Report path {:?} is too long", path);
        return;
    }
    let Some(old_path) = old_path.as_c_str() else {
        crash_error!("Invalid report path {:?}", path);
        return;
    };
    crash_info!("Writing recrash report to {:?}", path);

    // SAFETY: both paths are valid C strings.
    if unsafe { libc::rename(path.as_ptr(), old_path.as_ptr()) } < 0 {
        crash_error!(
            "Could not rename {:?} to {:?}: errno {}",
            path,
            old_path,
            errno::errno().0
        );
    }
    let sink = match BufferedWriter::create(path) {
        Ok(sink) => sink,
        Err(errno) => {
            crash_error!("Could not open crash report file {:?}: errno {}", path, errno);
            return;
        }
    };
    let mut writer = JsonReportWriter::new(sink);
    write_recrash_report_to(&mut writer, event, settings, old_path);
    writer.finish();
}

fn write_recrash_report_to<W: JsonSink>(
    writer: &mut JsonReportWriter<W>,
    event: &CrashEvent<'_>,
    settings: &ReportSettings,
    old_path: &CStr,
) {
    let report = Report::new(event, settings);

    writer.begin_object(Some(fields::REPORT));
    writer.add_json_file_element(Some(fields::RECRASH_REPORT), old_path, true);
    writer.flush();
    // SAFETY: `old_path` is a valid C string.
    if unsafe { libc::unlink(old_path.as_ptr()) } < 0 {
        crash_error!("Could not delete {:?}: errno {}", old_path, errno::errno().0);
    }

    write_report_info(writer, fields::REPORT, report_type::MINIMAL, &report);
    writer.flush();

    writer.begin_object(Some(fields::CRASH));
    write_error(writer, fields::ERROR, &report);
    writer.flush();
    let context = event.offending_context;
    let index = context.index_of_thread(context.thread()).unwrap_or(0);
    let mut cursor = event.stack_cursor;
    write_thread(
        writer,
        Some(fields::CRASHED_THREAD),
        &report,
        context,
        &mut cursor,
        index,
        false,
    );
    writer.end_container();
    writer.flush();
}

/// `path` with its `.json` extension replaced by `.old`, or `.old` appended.
fn recrash_backup_path<const N: usize>(path: &CStr, out: &mut FmtBuf<N>) -> bool {
    let Ok(path) = path.to_str() else {
        return false;
    };
    let stem = path.strip_suffix(".json").unwrap_or(path);
    out.push_str(stem) && out.push_str(".old")
}

fn microseconds_since_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

fn write_report_info(writer: &mut dyn ReportWriter, key: &str, kind: &str, report: &Report<'_, '_>) {
    writer.begin_object(Some(key));
    writer.add_string_element(Some(fields::VERSION), CRASHEE_REPORT_VERSION);
    writer.add_string_element(Some(fields::ID), report.event.event_id);
    writer.add_string_element(Some(fields::PROCESS_NAME), report.process_name());
    writer.add_integer_element(Some(fields::TIMESTAMP), microseconds_since_epoch());
    writer.add_string_element(Some(fields::TYPE), kind);
    writer.end_container();
}

fn write_binary_images(writer: &mut dyn ReportWriter, key: &str) {
    writer.begin_array(Some(key));
    dynamic_linker::for_each_image(|image| write_binary_image(&mut *writer, image));
    writer.end_container();
}

fn write_binary_image(writer: &mut dyn ReportWriter, image: &BinaryImage) {
    writer.begin_object(None);
    writer.add_uinteger_element(Some(fields::IMAGE_ADDRESS), image.address as u64);
    writer.add_uinteger_element(Some(fields::IMAGE_VM_ADDRESS), image.vm_address as u64);
    writer.add_uinteger_element(Some(fields::IMAGE_SIZE), image.size as u64);
    writer.add_string_element(Some(fields::NAME), image.name.to_str().unwrap_or_default());
    writer.add_uuid_element(Some(fields::UUID), image.uuid.as_ref());
    writer.add_integer_element(Some(fields::CPU_TYPE), image.cpu_type);
    writer.add_integer_element(Some(fields::CPU_SUBTYPE), image.cpu_subtype);
    writer.add_uinteger_element(Some(fields::IMAGE_MAJOR_VERSION), image.major_version);
    writer.add_uinteger_element(Some(fields::IMAGE_MINOR_VERSION), image.minor_version);
    writer.add_uinteger_element(Some(fields::IMAGE_REVISION_VERSION), image.revision_version);
    writer.end_container();
}

fn write_process_state(writer: &mut dyn ReportWriter, key: &str, report: &Report<'_, '_>) {
    let zombie = &report.event.zombie;
    writer.begin_object(Some(key));
    if zombie.address != 0 {
        writer.begin_object(Some(fields::LAST_DEALLOCED_NSEXCEPTION));
        writer.add_uinteger_element(Some(fields::ADDRESS), zombie.address as u64);
        writer.add_string_element(Some(fields::NAME), zombie.name.as_str());
        writer.add_string_element(Some(fields::REASON), zombie.reason.as_str());
        report.introspection.write_address_referenced_by_string(
            writer,
            Some(fields::REFERENCED_OBJECT),
            Some(zombie.reason.as_str()),
            DEFAULT_MEMORY_SEARCH_DEPTH,
        );
        writer.end_container();
    }
    writer.end_container();
}

fn write_system_info(writer: &mut dyn ReportWriter, key: &str, report: &Report<'_, '_>) {
    writer.begin_object(Some(key));
    if let Some(system) = report.event.system {
        write_system_fields(writer, system);
    }
    write_memory_info(writer, fields::MEMORY, &report.event.memory);
    write_app_stats(writer, fields::APP_STATS, &report.event.app_stats);
    writer.end_container();
}

fn write_system_fields(writer: &mut dyn ReportWriter, system: &SystemInfo) {
    writer.add_string_element(Some(fields::SYSTEM_NAME), &system.system_name);
    writer.add_string_element(Some(fields::SYSTEM_VERSION), &system.system_version);
    writer.add_string_element(Some(fields::MACHINE), &system.machine);
    writer.add_string_element(Some(fields::MODEL), &system.model);
    writer.add_string_element(Some(fields::KERNEL_VERSION), &system.kernel_version);
    writer.add_string_element(Some(fields::OS_VERSION), &system.os_version);
    writer.add_boolean_element(Some(fields::JAILBROKEN), system.is_jailbroken);
    if let Some(boot_time) = &system.boot_time {
        writer.add_string_element(Some(fields::BOOT_TIME), boot_time);
    }
    writer.add_string_element(Some(fields::APP_START_TIME), &system.app_start_time);
    writer.add_string_element(Some(fields::EXECUTABLE_PATH), &system.executable_path);
    writer.add_string_element(Some(fields::EXECUTABLE), &system.executable_name);
    writer.add_string_element(Some(fields::BUNDLE_ID), &system.bundle_id);
    writer.add_string_element(Some(fields::BUNDLE_NAME), &system.bundle_name);
    writer.add_string_element(Some(fields::BUNDLE_VERSION), &system.bundle_version);
    writer.add_string_element(Some(fields::BUNDLE_SHORT_VERSION), &system.bundle_short_version);
    writer.add_string_element(Some(fields::APP_UUID), &system.app_uuid);
    writer.add_string_element(Some(fields::CPU_ARCH), system.cpu_arch);
    writer.add_integer_element(Some(fields::CPU_TYPE), system.cpu_type);
    writer.add_integer_element(Some(fields::CPU_SUBTYPE), system.cpu_subtype);
    writer.add_integer_element(Some(fields::BINARY_CPU_TYPE), system.binary_cpu_type);
    writer.add_integer_element(Some(fields::BINARY_CPU_SUBTYPE), system.binary_cpu_subtype);
    writer.add_string_element(Some(fields::TIME_ZONE), &system.time_zone);
    writer.add_string_element(Some(fields::PROCESS_NAME), &system.process_name);
    writer.add_integer_element(Some(fields::PROCESS_ID), system.process_id);
    writer.add_integer_element(Some(fields::PARENT_PROCESS_ID), system.parent_process_id);
    writer.add_string_element(Some(fields::DEVICE_APP_HASH), &system.device_app_hash);
    writer.add_string_element(Some(fields::BUILD_TYPE), system.build_type);
    writer.add_uinteger_element(Some(fields::STORAGE), system.storage);
}

fn write_memory_info(writer: &mut dyn ReportWriter, key: &str, memory: &MemoryStats) {
    writer.begin_object(Some(key));
    writer.add_uinteger_element(Some(fields::SIZE), memory.size);
    writer.add_uinteger_element(Some(fields::USABLE), memory.usable);
    writer.add_uinteger_element(Some(fields::FREE), memory.free);
    writer.end_container();
}

fn write_app_stats(writer: &mut dyn ReportWriter, key: &str, stats: &AppStats) {
    writer.begin_object(Some(key));
    writer.add_boolean_element(Some(fields::APP_ACTIVE), stats.application_is_active);
    writer.add_boolean_element(Some(fields::APP_IN_FOREGROUND), stats.application_is_in_foreground);
    writer.add_integer_element(Some(fields::LAUNCHES_SINCE_CRASH), stats.launches_since_last_crash);
    writer.add_integer_element(Some(fields::SESSIONS_SINCE_CRASH), stats.sessions_since_last_crash);
    writer.add_floating_point_element(
        Some(fields::ACTIVE_TIME_SINCE_CRASH),
        stats.active_duration_since_last_crash,
    );
    writer.add_floating_point_element(
        Some(fields::BACKGROUND_TIME_SINCE_CRASH),
        stats.background_duration_since_last_crash,
    );
    writer.add_integer_element(Some(fields::SESSIONS_SINCE_LAUNCH), stats.sessions_since_launch);
    writer.add_floating_point_element(
        Some(fields::ACTIVE_TIME_SINCE_LAUNCH),
        stats.active_duration_since_launch,
    );
    writer.add_floating_point_element(
        Some(fields::BACKGROUND_TIME_SINCE_LAUNCH),
        stats.background_duration_since_launch,
    );
    writer.end_container();
}

fn write_error(writer: &mut dyn ReportWriter, key: &str, report: &Report<'_, '_>) {
    let event = report.event;
    writer.begin_object(Some(key));

    if let CrashKind::KernelException {
        exception_type,
        code,
        subcode,
    } = event.kind
    {
        writer.begin_object(Some(fields::MACH));
        writer.add_integer_element(Some(fields::EXCEPTION), exception_type);
        writer.add_integer_element(Some(fields::CODE), code);
        writer.add_integer_element(Some(fields::SUBCODE), subcode);
        writer.end_container();
    }

    let signal = event.signal;
    writer.begin_object(Some(fields::SIGNAL));
    writer.add_integer_element(Some(fields::SIGNAL), signal.signum as i64);
    if let Some(name) = signal_name(signal.signum) {
        writer.add_string_element(Some(fields::NAME), name);
    }
    writer.add_integer_element(Some(fields::CODE), signal.sigcode as i64);
    if let Some(code_name) = signal_code_name(signal.signum, signal.sigcode) {
        writer.add_string_element(Some(fields::CODE_NAME), code_name);
    }
    writer.end_container();

    writer.add_uinteger_element(Some(fields::ADDRESS), event.fault_address as u64);
    if let Some(reason) = event.crash_reason {
        writer.add_string_element(Some(fields::REASON), reason);
    }

    writer.add_string_element(Some(fields::TYPE), event.kind.report_type());
    match event.kind {
        CrashKind::KernelException { .. } | CrashKind::Signal | CrashKind::Deadlock => {}
        CrashKind::NativeException { name } => {
            writer.begin_object(Some(fields::CPP_EXCEPTION));
            writer.add_string_element(Some(fields::NAME), name);
            writer.end_container();
        }
        CrashKind::ManagedException { name, user_info } => {
            writer.begin_object(Some(fields::NSEXCEPTION));
            writer.add_string_element(Some(fields::NAME), name);
            if let Some(user_info) = user_info {
                writer.add_string_element(Some(fields::USER_INFO), user_info);
            }
            report.introspection.write_address_referenced_by_string(
                writer,
                Some(fields::REFERENCED_OBJECT),
                event.crash_reason,
                DEFAULT_MEMORY_SEARCH_DEPTH,
            );
            writer.end_container();
        }
        CrashKind::UserReported {
            name,
            language,
            line_of_code,
            custom_stack_trace,
            ..
        } => {
            writer.begin_object(Some(fields::USER_REPORTED));
            writer.add_string_element(Some(fields::NAME), name);
            if let Some(language) = language {
                writer.add_string_element(Some(fields::LANGUAGE), language);
            }
            if let Some(line_of_code) = line_of_code {
                writer.add_string_element(Some(fields::LINE_OF_CODE), line_of_code);
            }
            if let Some(stack_trace) = custom_stack_trace {
                writer.add_json_element(Some(fields::BACKTRACE), stack_trace, true);
            }
            writer.end_container();
        }
    }
    writer.end_container();
}

/// Writes every thread of the offending context. The offending thread is walked with the
/// event's cursor, the others from the registers recorded when they were suspended.
fn write_all_threads(writer: &mut dyn ReportWriter, key: &str, report: &Report<'_, '_>) {
    let context = report.event.offending_context;
    let offending = context.thread();
    let notable = report.settings.introspection.enabled;
    let suspension = &crate::context::context().suspension;

    writer.begin_array(Some(key));
    if context.thread_count() == 0 {
        let mut cursor = report.event.stack_cursor;
        write_thread(writer, None, report, context, &mut cursor, 0, notable);
    }
    for (index, &thread) in context.threads().as_slice().iter().enumerate() {
        if thread == offending {
            let mut cursor = report.event.stack_cursor;
            write_thread(writer, None, report, context, &mut cursor, index, notable);
        } else {
            let machine = MachineContext::for_suspended_thread(thread, suspension.cpu_state_for(thread));
            let mut cursor = StackCursor::from_machine_context(&machine, STACK_OVERFLOW_THRESHOLD);
            write_thread(writer, None, report, &machine, &mut cursor, index, false);
        }
    }
    writer.end_container();
}

fn write_thread(
    writer: &mut dyn ReportWriter,
    key: Option<&str>,
    report: &Report<'_, '_>,
    machine: &MachineContext,
    cursor: &mut StackCursor,
    index: usize,
    write_notable_addresses: bool,
) {
    let is_crashed = machine.is_crashed_context();
    let thread: ThreadId = machine.thread();
    crash_debug!("Writing thread {} (index {}), crashed: {}", thread, index, is_crashed);

    writer.begin_object(key);
    write_backtrace(writer, fields::BACKTRACE, cursor);
    if machine.can_have_cpu_state() {
        write_registers(writer, fields::REGISTERS, machine);
    }
    writer.add_integer_element(Some(fields::INDEX), index as i64);
    let mut name_buffer = [0u8; 64];
    if let Some(name) = thread_name(thread, &mut name_buffer) {
        writer.add_string_element(Some(fields::NAME), name);
    }
    writer.add_boolean_element(Some(fields::CRASHED), is_crashed);
    writer.add_boolean_element(Some(fields::CURRENT_THREAD), thread == current_thread_id());
    if is_crashed {
        write_stack_contents(writer, fields::STACK, machine, cursor.has_given_up());
        if write_notable_addresses {
            write_notable(writer, fields::NOTABLE_ADDRESSES, report, machine);
        }
    }
    writer.end_container();
}

fn write_backtrace(writer: &mut dyn ReportWriter, key: &str, cursor: &mut StackCursor) {
    writer.begin_object(Some(key));
    writer.begin_array(Some(fields::CONTENTS));
    while cursor.advance() {
        writer.begin_object(None);
        if cursor.symbolicate() {
            let frame = cursor.frame();
            if let Some(image) = frame.image_name.and_then(|name| name.to_str().ok()) {
                writer.add_string_element(Some(fields::OBJECT_NAME), last_path_entry(image));
            }
            writer.add_uinteger_element(Some(fields::OBJECT_ADDR), frame.image_address as u64);
            if let Some(symbol) = frame.symbol_name.and_then(|name| name.to_str().ok()) {
                writer.add_string_element(Some(fields::SYMBOL_NAME), symbol);
            }
            writer.add_uinteger_element(Some(fields::SYMBOL_ADDR), frame.symbol_address as u64);
        }
        writer.add_uinteger_element(
            Some(fields::INSTRUCTION_ADDR),
            cursor.frame().instruction_address as u64,
        );
        writer.end_container();
    }
    writer.end_container();
    writer.add_integer_element(Some(fields::SKIPPED), 0);
    writer.end_container();
}

fn last_path_entry(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn write_registers(writer: &mut dyn ReportWriter, key: &str, machine: &MachineContext) {
    writer.begin_object(Some(key));
    writer.begin_object(Some(fields::BASIC));
    for (name, value) in machine.registers() {
        writer.add_uinteger_element(Some(name), value);
    }
    writer.end_container();
    if machine.has_valid_exception_registers() {
        writer.begin_object(Some(fields::EXCEPTION));
        for (name, value) in machine.exception_registers() {
            writer.add_uinteger_element(Some(name), value);
        }
        writer.end_container();
    }
    writer.end_container();
}

/// The `[low, high)` window around `sp`, `behind` words against the growth direction of the
/// stack and `ahead` words along it.
fn stack_window(sp: usize, behind: usize, ahead: usize) -> (usize, usize) {
    let direction = STACK_GROW_DIRECTION;
    let low = sp.wrapping_add_signed(-((behind * WORD) as isize) * direction);
    let high = sp.wrapping_add_signed(((ahead * WORD) as isize) * direction);
    if high < low {
        (high, low)
    } else {
        (low, high)
    }
}

fn write_stack_contents(
    writer: &mut dyn ReportWriter,
    key: &str,
    machine: &MachineContext,
    is_stack_overflow: bool,
) {
    let sp = machine.stack_pointer();
    if sp == 0 {
        return;
    }
    let (low, high) = stack_window(sp, STACK_CONTENTS_PUSHED_DISTANCE, STACK_CONTENTS_POPPED_DISTANCE);

    writer.begin_object(Some(key));
    writer.add_string_element(
        Some(fields::GROW_DIRECTION),
        if STACK_GROW_DIRECTION > 0 { "+" } else { "-" },
    );
    writer.add_uinteger_element(Some(fields::DUMP_START), low as u64);
    writer.add_uinteger_element(Some(fields::DUMP_END), high as u64);
    writer.add_uinteger_element(Some(fields::STACK_POINTER), sp as u64);
    writer.add_boolean_element(Some(fields::OVERFLOW), is_stack_overflow);
    let mut buffer = [0u8; STACK_DUMP_SIZE];
    let length = (high - low).min(STACK_DUMP_SIZE);
    if copy_safely(low, &mut buffer[..length]) {
        writer.add_data_element(Some(fields::CONTENTS), &buffer[..length]);
    } else {
        writer.add_string_element(Some(fields::ERROR), "Stack contents not accessible");
    }
    writer.end_container();
}

fn write_notable(
    writer: &mut dyn ReportWriter,
    key: &str,
    report: &Report<'_, '_>,
    machine: &MachineContext,
) {
    writer.begin_object(Some(key));
    for (name, value) in machine.registers() {
        report.introspection.write_memory_contents_if_notable(
            writer,
            Some(name),
            value as usize,
            DEFAULT_MEMORY_SEARCH_DEPTH,
        );
    }

    let sp = machine.stack_pointer();
    if sp != 0 {
        let (low, high) = stack_window(
            sp,
            STACK_NOTABLE_SEARCH_BACK_DISTANCE,
            STACK_NOTABLE_SEARCH_FORWARD_DISTANCE,
        );
        let mut name = FmtBuf::<40>::new();
        for address in (low..high).step_by(WORD) {
            if let Some(contents) = read_word(address) {
                name.clear();
                let _ = write!(name, "stack@{:#x}", address);
                report.introspection.write_memory_contents_if_notable(
                    writer,
                    Some(name.as_str()),
                    contents,
                    DEFAULT_MEMORY_SEARCH_DEPTH,
                );
            }
        }
    }
    writer.end_container();
}

/// The `user` block: the configured user info, custom fields, then the application's callback.
/// The callback only runs for fatal reports.
fn write_user_section(writer: &mut dyn ReportWriter, report: &Report<'_, '_>) {
    match &report.settings.user_info_json {
        Some(json) if json.trim_start().starts_with('{') => {
            writer.add_json_element(Some(fields::USER), json, false)
        }
        Some(json) => {
            // Custom fields and the callback need an object to write into.
            writer.begin_object(Some(fields::USER));
            writer.add_string_element(Some(fields::ERROR), "User info is not a JSON object");
            writer.add_string_element(Some(fields::JSON_DATA), json);
        }
        None => writer.begin_object(Some(fields::USER)),
    }
    for (key, json) in &report.settings.custom_fields {
        writer.add_json_element(Some(key.as_str()), json, true);
    }
    if !report.event.is_snapshot() {
        if let Some(callback) = report.settings.user_section_callback {
            crash_debug!("Calling user section callback");
            callback(writer);
        }
    }
    writer.end_container();
}

fn write_debug_info(writer: &mut dyn ReportWriter, key: &str, report: &Report<'_, '_>) {
    writer.begin_object(Some(key));
    if let Some(path) = report.event.console_log_path {
        writer.add_text_file_lines_element(Some(fields::CONSOLE_LOG), path);
    }
    writer.end_container();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::stack_cursor::StackCursor;
    use crate::collector::threads::ThreadList;
    use crate::monitor::event::SignalDetails;
    use crate::shared::constants::MAX_STACK_DEPTH;
    use serde_json::{json, Value};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn current_context() -> MachineContext {
        dynamic_linker::init();
        let mut threads = ThreadList::new();
        threads.push(current_thread_id());
        MachineContext::for_current_thread(true, threads)
    }

    fn write_to_vec(event: &CrashEvent<'_>, settings: &ReportSettings) -> Value {
        let mut writer = JsonReportWriter::new(Vec::new());
        write_standard_report_to(&mut writer, event, settings);
        serde_json::from_slice(&writer.finish()).unwrap()
    }

    fn add_answer(writer: &mut dyn ReportWriter) {
        writer.add_integer_element(Some("answer"), 42);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_standard_report_layout() {
        let context = current_context();
        let cursor = StackCursor::capture_current(None, MAX_STACK_DEPTH);
        let mut event = CrashEvent::new("ABC-123", CrashKind::Signal, &context, cursor);
        event.signal = SignalDetails {
            signum: libc::SIGSEGV,
            sigcode: 1,
        };
        event.fault_address = 0x10;
        let settings = ReportSettings {
            user_info_json: Some(r#"{"account": "a1"}"#.to_string()),
            user_section_callback: Some(add_answer),
            custom_fields: vec![("build".to_string(), "[1, 2]".to_string())],
            ..ReportSettings::new()
        };

        let doc = write_to_vec(&event, &settings);
        let keys: Vec<&str> = doc.as_object().unwrap().keys().map(String::as_str).collect();
        for key in ["report", "binary_images", "process", "system", "crash", "user", "debug"] {
            assert!(keys.contains(&key), "{key} missing from {keys:?}");
        }
        assert_eq!(doc["report"]["id"], "ABC-123");
        assert_eq!(doc["report"]["type"], "standard");
        assert!(doc["report"]["timestamp"].as_i64().unwrap() > 0);
        assert!(doc["report"]["process_name"].is_string());

        let error = &doc["crash"]["error"];
        assert_eq!(error["type"], "signal");
        assert_eq!(error["signal"]["signal"], libc::SIGSEGV);
        assert_eq!(error["signal"]["name"], "SIGSEGV");
        assert_eq!(error["address"], 0x10);

        let threads = doc["crash"]["threads"].as_array().unwrap();
        assert_eq!(threads.len(), context.thread_count());
        assert_eq!(threads[0]["crashed"], true);
        assert_eq!(threads[0]["current_thread"], true);
        assert_eq!(threads[0]["backtrace"]["skipped"], 0);
        assert!(!threads[0]["backtrace"]["contents"].as_array().unwrap().is_empty());
        // The running thread has no register state.
        assert!(threads[0].get("registers").is_none());

        assert_eq!(doc["user"], json!({"account": "a1", "build": [1, 2], "answer": 42}));
        assert!(!doc["binary_images"].as_array().unwrap().is_empty());
        assert!(doc["process"].get("last_dealloced_nsexception").is_none());
        assert_eq!(doc["system"]["application_stats"]["launches_since_last_crash"], 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scalar_custom_fields_are_written_as_is() {
        let context = current_context();
        let event = CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty());
        let custom_fields = [
            ("retries", "3"),
            ("ratio", "-1.5"),
            ("beta", "false"),
            ("owner", "null"),
        ];
        let settings = ReportSettings {
            custom_fields: custom_fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..ReportSettings::new()
        };

        let doc = write_to_vec(&event, &settings);
        assert_eq!(
            doc["user"],
            json!({"retries": 3, "ratio": -1.5, "beta": false, "owner": null})
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_non_object_user_info_keeps_the_report_well_formed() {
        let context = current_context();
        let event = CrashEvent::new("id", CrashKind::Signal, &context, StackCursor::empty());
        for user_info in ["42", "\"text\"", "[1, 2]"] {
            let settings = ReportSettings {
                user_info_json: Some(user_info.to_string()),
                user_section_callback: Some(add_answer),
                custom_fields: vec![("build".to_string(), "1".to_string())],
                ..ReportSettings::new()
            };

            let doc = write_to_vec(&event, &settings);
            let user = &doc["user"];
            assert_eq!(user["json_data"], user_info);
            assert!(user["error"].is_string(), "{user}");
            assert_eq!(user["build"], 1);
            assert_eq!(user["answer"], 42);
            // Nothing spilled out of the user block.
            assert!(doc.get("build").is_none() && doc.get("answer").is_none());
            assert_eq!(doc["debug"], json!({}));
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_user_report_error_block() {
        let context = current_context();
        let kind = CrashKind::UserReported {
            name: "Boom",
            language: Some("swift"),
            line_of_code: None,
            custom_stack_trace: Some(r#"["frame 1", "frame 2"]"#),
            terminate_program: false,
        };
        let mut event = CrashEvent::new("id", kind, &context, StackCursor::empty());
        event.crash_reason = Some("reason");
        let settings = ReportSettings {
            user_section_callback: Some(add_answer),
            ..ReportSettings::new()
        };

        let doc = write_to_vec(&event, &settings);
        let error = &doc["crash"]["error"];
        assert_eq!(error["type"], "user");
        assert_eq!(error["reason"], "reason");
        assert_eq!(error["user_reported"]["name"], "Boom");
        assert_eq!(error["user_reported"]["language"], "swift");
        assert!(error["user_reported"].get("line_of_code").is_none());
        assert_eq!(error["user_reported"]["backtrace"], json!(["frame 1", "frame 2"]));
        // Snapshots do not run the user section callback.
        assert_eq!(doc["user"], json!({}));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_managed_exception_and_zombie() {
        let context = current_context();
        let kind = CrashKind::ManagedException {
            name: "NSRangeException",
            user_info: Some("{index = 3}"),
        };
        let mut event = CrashEvent::new("id", kind, &context, StackCursor::empty());
        event.crash_reason = Some("index 3 beyond bounds");
        event.zombie.address = 0x1234;
        event.zombie.name.push_str("NSInvalidArgumentException");
        event.zombie.reason.push_str("sent to 0x0");

        let doc = write_to_vec(&event, &ReportSettings::new());
        let exception = &doc["crash"]["error"]["nsexception"];
        assert_eq!(exception["name"], "NSRangeException");
        assert_eq!(exception["userInfo"], "{index = 3}");
        assert!(exception.get("referenced_object").is_none());

        let zombie = &doc["process"]["last_dealloced_nsexception"];
        assert_eq!(zombie["address"], 0x1234);
        assert_eq!(zombie["name"], "NSInvalidArgumentException");
        assert_eq!(zombie["referenced_object"]["type"], "null_pointer");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_recrash_report_embeds_interrupted_report() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("app-report-0000000000000001.json");
        std::fs::write(&path, r#"{"report": {"id": "first", "type": "standard"}, "crash": {"thr"#)?;
        let c_path = CString::new(path.as_os_str().as_bytes())?;

        let context = current_context();
        let kind = CrashKind::NativeException { name: "std::bad_alloc" };
        let event = CrashEvent::new("second", kind, &context, StackCursor::empty());
        write_recrash_report(&event, &ReportSettings::new(), &c_path);

        let doc: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(doc["recrash_report"]["report"]["id"], "first");
        assert!(doc["recrash_report"]["crash"].is_object());
        assert_eq!(doc["report"]["id"], "second");
        assert_eq!(doc["report"]["type"], "minimal");
        assert_eq!(doc["crash"]["error"]["cpp_exception"]["name"], "std::bad_alloc");
        assert_eq!(doc["crash"]["crashed_thread"]["crashed"], true);
        assert!(doc["crash"]["crashed_thread"].get("notable_addresses").is_none());
        assert!(doc["crash"].get("threads").is_none());
        assert!(!dir.path().join("app-report-0000000000000001.old").exists());
        Ok(())
    }

    #[test]
    fn test_backup_path() {
        let mut out = FmtBuf::<64>::new();
        assert!(recrash_backup_path(c"/r/app-report-1.json", &mut out));
        assert_eq!(out.as_str(), "/r/app-report-1.old");
        let mut out = FmtBuf::<64>::new();
        assert!(recrash_backup_path(c"/r/report", &mut out));
        assert_eq!(out.as_str(), "/r/report.old");
    }

    #[test]
    fn test_stack_window_grows_down() {
        let (low, high) = stack_window(0x1000, 2, 1);
        assert_eq!((low, high), (0x1000 - WORD, 0x1000 + 2 * WORD));
        assert_eq!(last_path_entry("/usr/lib/libc.so.6"), "libc.so.6");
    }
}
