// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed view of a written report, for consumers reading reports back.
//!
//! Reports are decoded after they went through the fixer, so timestamps may be either the raw
//! microsecond count or an RFC 3339 string. Most fields are optional: reports written by a
//! crash that interrupted the reporter are repaired and may stop anywhere.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CrashReport {
    pub report: ReportInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary_images: Vec<BinaryImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    pub crash: Crash,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
    /// The report a crash in the reporter interrupted. Kept loosely typed: it may be partial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recrash_report: Option<Value>,
}

impl CrashReport {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The thread that crashed, whichever of the standard or recrash layouts holds it.
    pub fn crashed_thread(&self) -> Option<&Thread> {
        self.crash
            .threads
            .iter()
            .find(|thread| thread.crashed)
            .or(self.crash.crashed_thread.as_ref())
    }

    pub fn is_recrash(&self) -> bool {
        self.recrash_report.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportInfo {
    pub version: String,
    pub id: String,
    #[serde(default)]
    pub process_name: String,
    pub timestamp: Timestamp,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Timestamp {
    Rfc3339(DateTime<Utc>),
    /// Microseconds since the Unix epoch, as written on the crash path.
    Micros(i64),
}

impl Timestamp {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Rfc3339(time) => Some(time),
            Timestamp::Micros(micros) => DateTime::from_timestamp_micros(micros),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BinaryImage {
    pub image_addr: u64,
    #[serde(default)]
    pub image_vmaddr: u64,
    pub image_size: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub cpu_type: i64,
    #[serde(default)]
    pub cpu_subtype: i64,
    #[serde(default)]
    pub major_version: u64,
    #[serde(default)]
    pub minor_version: u64,
    #[serde(default)]
    pub revision_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dealloced_nsexception: Option<DeallocatedException>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeallocatedException {
    pub address: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_object: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default)]
    pub jailbroken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_start_time: Option<String>,
    #[serde(
        rename = "CFBundleExecutablePath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub executable_path: Option<String>,
    #[serde(
        rename = "CFBundleExecutable",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub executable: Option<String>,
    #[serde(
        rename = "CFBundleIdentifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bundle_id: Option<String>,
    #[serde(rename = "CFBundleName", default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
    #[serde(rename = "CFBundleVersion", default, skip_serializing_if = "Option::is_none")]
    pub bundle_version: Option<String>,
    #[serde(
        rename = "CFBundleShortVersionString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bundle_short_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub cpu_type: i64,
    #[serde(default)]
    pub cpu_subtype: i64,
    #[serde(default)]
    pub binary_cpu_type: i64,
    #[serde(default)]
    pub binary_cpu_subtype: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default)]
    pub process_id: i64,
    #[serde(default)]
    pub parent_process_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_app_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_type: Option<String>,
    #[serde(default)]
    pub storage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_stats: Option<ApplicationStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Memory {
    pub size: u64,
    pub usable: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApplicationStats {
    pub application_active: bool,
    pub application_in_foreground: bool,
    pub launches_since_last_crash: i64,
    pub sessions_since_last_crash: i64,
    pub active_time_since_last_crash: f64,
    pub background_time_since_last_crash: f64,
    pub sessions_since_launch: i64,
    pub active_time_since_launch: f64,
    pub background_time_since_launch: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Crash {
    pub error: CrashError,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<Thread>,
    /// Only present in recrash reports, which carry the offending thread alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crashed_thread: Option<Thread>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CrashError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach: Option<KernelError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpp_exception: Option<NativeException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsexception: Option<ManagedException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_reported: Option<UserReported>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KernelError {
    pub exception: i64,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub subcode: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SignalError {
    pub signal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NativeException {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ManagedException {
    pub name: String,
    #[serde(rename = "userInfo", default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_object: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserReported {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_of_code: Option<String>,
    /// The application's own description of its stack, as it passed it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Thread {
    #[serde(default)]
    pub backtrace: Backtrace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<Registers>,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub crashed: bool,
    #[serde(default)]
    pub current_thread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Stack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notable_addresses: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Backtrace {
    #[serde(default)]
    pub contents: Vec<StackFrame>,
    #[serde(default)]
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StackFrame {
    pub instruction_addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_addr: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_addr: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Registers {
    #[serde(default)]
    pub basic: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Stack {
    pub grow_direction: String,
    pub dump_start: u64,
    pub dump_end: u64,
    pub stack_pointer: u64,
    #[serde(default)]
    pub overflow: bool,
    /// Hex encoded stack bytes, from `dump_start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DebugInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_log: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_report() -> Value {
        json!({
            "report": {
                "version": "3.2.0",
                "id": "0A1B2C3D-0000-4000-8000-000000000001",
                "process_name": "myapp",
                "timestamp": 1_700_000_000_123_456i64,
                "type": "standard"
            },
            "binary_images": [{
                "image_addr": 0x5555_0000u64,
                "image_vmaddr": 0,
                "image_size": 0x1000,
                "name": "/usr/bin/myapp",
                "uuid": "D3F6A1B2-0000-0000-0000-000000000000",
                "cpu_type": 62,
                "cpu_subtype": 0,
                "major_version": 0,
                "minor_version": 0,
                "revision_version": 0
            }],
            "process": {},
            "system": {
                "system_name": "Linux",
                "CFBundleExecutable": "myapp",
                "jailbroken": false,
                "memory": {"size": 100, "usable": 90, "free": 10},
                "application_stats": {
                    "application_active": true,
                    "launches_since_last_crash": 2
                }
            },
            "crash": {
                "error": {
                    "signal": {"signal": 11, "name": "SIGSEGV", "code": 1, "code_name": "SEGV_MAPERR"},
                    "address": 0,
                    "type": "signal"
                },
                "threads": [{
                    "backtrace": {
                        "contents": [
                            {"instruction_addr": 0x7f00_0010u64, "object_name": "libc.so.6", "symbol_name": "raise"},
                            {"instruction_addr": 0x5555_0100u64, "object_name": "myapp", "symbol_name": "crash_here"}
                        ],
                        "skipped": 0
                    },
                    "registers": {"basic": {"rip": 0x5555_0100u64, "rsp": 0x7ffe_0000u64}},
                    "index": 0,
                    "name": "main",
                    "crashed": true,
                    "current_thread": true,
                    "stack": {
                        "grow_direction": "-",
                        "dump_start": 0x7ffd_ff00u64,
                        "dump_end": 0x7ffe_0050u64,
                        "stack_pointer": 0x7ffe_0000u64,
                        "overflow": false,
                        "contents": "00ff"
                    }
                }]
            },
            "user": {"tier": "gold"},
            "debug": {}
        })
    }

    #[test]
    fn test_decode_standard_report() -> anyhow::Result<()> {
        let report: CrashReport = serde_json::from_value(sample_report())?;
        assert_eq!(report.report.kind, "standard");
        assert_eq!(report.report.timestamp, Timestamp::Micros(1_700_000_000_123_456));
        assert_eq!(report.binary_images.len(), 1);
        assert_eq!(report.crash.error.signal.as_ref().map(|s| s.signal), Some(11));
        let thread = report.crashed_thread().ok_or_else(|| anyhow::anyhow!("no thread"))?;
        assert_eq!(thread.backtrace.contents.len(), 2);
        assert_eq!(
            thread.registers.as_ref().and_then(|r| r.basic.get("rsp")).copied(),
            Some(0x7ffe_0000)
        );
        let system = report.system.as_ref().ok_or_else(|| anyhow::anyhow!("no system"))?;
        assert_eq!(system.executable.as_deref(), Some("myapp"));
        assert_eq!(system.application_stats.map(|s| s.launches_since_last_crash), Some(2));
        assert_eq!(report.user.get("tier"), Some(&json!("gold")));
        assert!(!report.is_recrash());
        Ok(())
    }

    #[test]
    fn test_decode_recrash_report() -> anyhow::Result<()> {
        let value = json!({
            "recrash_report": {"report": {"id": "partial"}},
            "report": {
                "version": "3.2.0",
                "id": "X",
                "process_name": "myapp",
                "timestamp": "2023-11-14T22:13:20.123456Z",
                "type": "minimal"
            },
            "crash": {
                "error": {"type": "cpp_exception", "cpp_exception": {"name": "&str"}},
                "crashed_thread": {"index": 3, "crashed": false}
            }
        });
        let report: CrashReport = serde_json::from_value(value)?;
        assert!(report.is_recrash());
        assert_eq!(report.crashed_thread().map(|t| t.index), Some(3));
        let time = report.report.timestamp.to_datetime();
        assert_eq!(time.map(|t| t.timestamp()), Some(1_700_000_000));
        Ok(())
    }

    #[test]
    fn test_timestamp_conversion() {
        let time = Timestamp::Micros(1_500_000).to_datetime();
        assert_eq!(time.map(|t| t.timestamp_subsec_micros()), Some(500_000));
    }
}
