// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Information about the machine and the process, gathered once when the monitor is enabled and
//! copied into every report. Memory usage is the only part read at crash time.

use super::event::CrashEvent;
use super::{MonitorApi, MonitorType};
use crate::collector::{cpu, dynamic_linker};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    pub system_name: String,
    pub system_version: String,
    pub machine: String,
    pub model: String,
    pub kernel_version: String,
    pub os_version: String,
    pub is_jailbroken: bool,
    pub boot_time: Option<String>,
    pub app_start_time: String,
    pub executable_path: String,
    pub executable_name: String,
    pub bundle_id: String,
    pub bundle_name: String,
    pub bundle_version: String,
    pub bundle_short_version: String,
    pub app_uuid: String,
    pub cpu_arch: &'static str,
    pub cpu_type: i64,
    pub cpu_subtype: i64,
    pub binary_cpu_type: i64,
    pub binary_cpu_subtype: i64,
    pub time_zone: String,
    pub process_name: String,
    pub process_id: i64,
    pub parent_process_id: i64,
    pub device_app_hash: String,
    pub build_type: &'static str,
    pub storage: u64,
}

/// Memory of the machine, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub size: u64,
    pub usable: u64,
    pub free: u64,
}

impl MemoryStats {
    /// Reads the current figures with `sysinfo(2)`, a plain syscall.
    pub fn current() -> Option<Self> {
        // SAFETY: an all-zero sysinfo struct is valid.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a valid out pointer.
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return None;
        }
        let unit = u64::from(info.mem_unit.max(1));
        let free = info.freeram as u64 * unit;
        Some(Self {
            size: info.totalram as u64 * unit,
            usable: free + info.bufferram as u64 * unit,
            free,
        })
    }
}

/// How the application identifies itself in reports.
#[derive(Debug, Clone, Default)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
    pub short_version: String,
}

pub struct SystemMonitor {
    enabled: AtomicBool,
    identity: Mutex<Option<AppIdentity>>,
    info: OnceLock<SystemInfo>,
}

impl SystemMonitor {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            identity: Mutex::new(None),
            info: OnceLock::new(),
        }
    }

    /// Sets the application identity. Only taken into account before the first enable.
    pub fn set_identity(&self, identity: AppIdentity) {
        if self.info.get().is_some() {
            tracing::debug!("System information already gathered, ignoring new identity");
        }
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(identity);
    }

    /// Names the application `name` unless an identity with a name was set.
    pub fn set_default_name(&self, name: &str) {
        let mut identity = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        let identity = identity.get_or_insert_with(AppIdentity::default);
        if identity.name.is_empty() {
            identity.name = name.to_owned();
        }
    }

    pub fn info(&self) -> Option<&SystemInfo> {
        self.info.get()
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorApi for SystemMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SYSTEM
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && self.info.get().is_none() {
            let identity = self
                .identity
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_default();
            let _ = self.info.set(gather_system_info(&identity));
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, event: &mut CrashEvent<'_>) {
        if let Some(info) = self.info.get() {
            // SAFETY: the cell is never reset once set, and an event never outlives the episode
            // that the monitor takes part in.
            event.system = Some(unsafe { &*(info as *const SystemInfo) });
        }
        match MemoryStats::current() {
            Some(memory) => event.memory = memory,
            None => crash_warn!("sysinfo failed: errno {}", errno::errno().0),
        }
    }
}

fn gather_system_info(identity: &AppIdentity) -> SystemInfo {
    let os = os_info::get();
    let uname = nix::sys::utsname::uname().ok();
    let uname_field = |f: fn(&nix::sys::utsname::UtsName) -> &std::ffi::OsStr| {
        uname
            .as_ref()
            .map(|u| f(u).to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let executable = std::env::current_exe().ok();
    let executable_path = executable
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let executable_name = executable
        .as_deref()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let boot_time = boot_time();
    let name = if identity.name.is_empty() {
        executable_name.clone()
    } else {
        identity.name.clone()
    };

    let info = SystemInfo {
        system_name: os.os_type().to_string(),
        system_version: os.version().to_string(),
        machine: uname_field(|u| u.machine()),
        model: read_trimmed("/sys/devices/virtual/dmi/id/product_name")
            .unwrap_or_else(|| "unknown".to_owned()),
        kernel_version: format!(
            "{} {} {}",
            uname_field(|u| u.sysname()),
            uname_field(|u| u.release()),
            uname_field(|u| u.version())
        ),
        os_version: uname_field(|u| u.release()),
        is_jailbroken: false,
        boot_time: boot_time.map(rfc3339),
        app_start_time: rfc3339(process_start_time(boot_time).unwrap_or_else(Utc::now)),
        device_app_hash: device_app_hash(&executable_path),
        executable_path,
        process_name: read_trimmed("/proc/self/comm").unwrap_or_else(|| executable_name.clone()),
        executable_name,
        bundle_id: name.clone(),
        bundle_name: name,
        bundle_version: identity.version.clone(),
        bundle_short_version: identity.short_version.clone(),
        app_uuid: main_image_uuid().unwrap_or_default(),
        cpu_arch: cpu::CPU_ARCH,
        cpu_type: cpu::CPU_TYPE,
        cpu_subtype: cpu::CPU_SUBTYPE,
        binary_cpu_type: cpu::CPU_TYPE,
        binary_cpu_subtype: cpu::CPU_SUBTYPE,
        time_zone: time_zone(),
        process_id: i64::from(std::process::id()),
        parent_process_id: i64::from(std::os::unix::process::parent_id()),
        build_type: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
        storage: storage_size("/").unwrap_or(0),
    };
    tracing::debug!(
        system = %info.system_name,
        version = %info.system_version,
        "Gathered system information"
    );
    info
}

fn read_trimmed(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `btime` of `/proc/stat`.
fn boot_time() -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_boot_time(&stat)
}

fn parse_boot_time(stat: &str) -> Option<DateTime<Utc>> {
    let seconds = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<i64>()
        .ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Field 22 of `/proc/self/stat`, in clock ticks since boot.
fn process_start_time(boot_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let ticks = parse_start_ticks(&stat)?;
    // SAFETY: sysconf has no preconditions.
    let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_second <= 0 {
        return None;
    }
    let since_boot = chrono::Duration::milliseconds((ticks * 1000 / ticks_per_second as u64) as i64);
    Some(boot_time? + since_boot)
}

fn parse_start_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses, so count fields after the last ')'.
    let after_name = &stat[stat.rfind(')')? + 1..];
    // Field 3 (state) is the first one after the name.
    after_name.split_whitespace().nth(22 - 3)?.parse().ok()
}

fn time_zone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if !tz.is_empty() {
            return tz.trim_start_matches(':').to_owned();
        }
    }
    read_trimmed("/etc/timezone").unwrap_or_else(|| Local::now().format("%:z").to_string())
}

fn main_image_uuid() -> Option<String> {
    dynamic_linker::init();
    let mut uuid = None;
    let mut first = true;
    dynamic_linker::for_each_image(|image| {
        if first {
            first = false;
            uuid = image.uuid;
        }
    });
    uuid.map(|bytes| {
        uuid::Uuid::from_bytes(bytes)
            .hyphenated()
            .to_string()
            .to_uppercase()
    })
}

/// Identifies this application on this machine without revealing either.
fn device_app_hash(executable_path: &str) -> String {
    let mut hasher = DefaultHasher::new();
    read_trimmed("/etc/machine-id").hash(&mut hasher);
    executable_path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn storage_size(path: &str) -> Option<u64> {
    let c_path = std::ffi::CString::new(path).ok()?;
    // SAFETY: an all-zero statvfs struct is valid.
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers are valid.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) } != 0 {
        return None;
    }
    Some(stats.f_blocks as u64 * stats.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boot_time() {
        let stat = "cpu  1 2 3\nintr 5\nbtime 1700000000\nprocesses 9\n";
        let boot = parse_boot_time(stat).unwrap();
        assert_eq!(rfc3339(boot), "2023-11-14T22:13:20Z");
        assert!(parse_boot_time("cpu 1\n").is_none());
    }

    #[test]
    fn test_parse_start_ticks_with_odd_command_name() {
        let mut stat = String::from("1234 (my (odd) app) S");
        for field in 4..=21 {
            stat.push_str(&format!(" {field}"));
        }
        stat.push_str(" 98765 0 0");
        assert_eq!(parse_start_ticks(&stat), Some(98765));
        assert_eq!(parse_start_ticks("garbage"), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_gather_uses_identity() {
        let identity = AppIdentity {
            name: "MyApp".to_owned(),
            version: "1.2.3".to_owned(),
            short_version: "1.2".to_owned(),
        };
        let info = gather_system_info(&identity);
        assert_eq!(info.bundle_name, "MyApp");
        assert_eq!(info.bundle_version, "1.2.3");
        assert_eq!(info.process_id, i64::from(std::process::id()));
        assert_eq!(info.cpu_arch, cpu::CPU_ARCH);
        assert!(!info.executable_name.is_empty());
        assert_eq!(info.device_app_hash.len(), 16);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_memory_stats() {
        let memory = MemoryStats::current().unwrap();
        assert!(memory.size > 0);
        assert!(memory.free <= memory.usable);
        assert!(memory.usable <= memory.size);
    }
}
