// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-time cleanup of reports.
//!
//! The crash path writes what it can get cheaply: mangled symbol names and a raw microsecond
//! timestamp. Reports are made readable when they are read back, in normal context.

use crate::shared::fields;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Parses `raw`, fixes it up and serializes it again.
pub fn fix_report(raw: &str) -> anyhow::Result<String> {
    let mut report: Value = serde_json::from_str(raw)?;
    fix_report_value(&mut report);
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Demangles symbol names and converts report timestamps to RFC 3339, at any depth, so that
/// embedded recrash reports are fixed as well.
pub fn fix_report_value(report: &mut Value) {
    fix_value(report, None);
}

fn fix_value(value: &mut Value, key: Option<&str>) {
    match value {
        Value::Object(map) => fix_object(map, key),
        Value::Array(items) => items.iter_mut().for_each(|item| fix_value(item, None)),
        _ => {}
    }
}

fn fix_object(map: &mut Map<String, Value>, object_key: Option<&str>) {
    for (key, value) in map.iter_mut() {
        match (object_key, key.as_str()) {
            (_, fields::SYMBOL_NAME) | (Some(fields::CPP_EXCEPTION), fields::NAME) => {
                if let Value::String(name) = value {
                    demangle_in_place(name);
                }
            }
            (Some(fields::REPORT), fields::TIMESTAMP) => {
                if let Some(time) = value.as_i64().and_then(micros_to_rfc3339) {
                    *value = Value::String(time);
                }
            }
            _ => fix_value(value, Some(key.as_str())),
        }
    }
}

fn demangle_in_place(name: &mut String) {
    let mangled = std::mem::take(name);
    *name = match Name::from(&mangled).demangle(DemangleOptions::name_only()) {
        Some(demangled) if demangled != mangled => demangled,
        _ => mangled,
    };
}

fn micros_to_rfc3339(micros: i64) -> Option<String> {
    let time = DateTime::from_timestamp_micros(micros)?;
    Some(time.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_demangles_symbols_and_native_exception_names() {
        let mut report = json!({
            "crash": {
                "error": {"cpp_exception": {"name": "_ZN3foo3barEv"}, "type": "cpp_exception"},
                "threads": [{"backtrace": {"contents": [
                    {"symbol_name": "_ZN4core9panicking5panic17h0123456789abcdefE"},
                    {"symbol_name": "main"},
                    {"instruction_addr": 4}
                ]}}]
            },
            "user": {"name": "_ZN3foo3barEv"}
        });
        fix_report_value(&mut report);

        assert_eq!(report["crash"]["error"]["cpp_exception"]["name"], "foo::bar");
        let frames = &report["crash"]["threads"][0]["backtrace"]["contents"];
        assert_eq!(frames[0]["symbol_name"], "core::panicking::panic");
        assert_eq!(frames[1]["symbol_name"], "main");
        // Only known name fields are touched.
        assert_eq!(report["user"]["name"], "_ZN3foo3barEv");
    }

    #[test]
    fn test_timestamps_become_rfc3339_including_recrash() {
        let mut report = json!({
            "recrash_report": {
                "report": {"timestamp": 1_700_000_000_000_001i64}
            },
            "report": {"timestamp": 1_700_000_000_123_456i64, "id": "x"},
            "system": {"timestamp": 5}
        });
        fix_report_value(&mut report);

        assert_eq!(report["report"]["timestamp"], "2023-11-14T22:13:20.123456Z");
        assert_eq!(
            report["recrash_report"]["report"]["timestamp"],
            "2023-11-14T22:13:20.000001Z"
        );
        assert_eq!(report["system"]["timestamp"], 5);
    }

    #[test]
    fn test_already_fixed_report_is_unchanged() -> anyhow::Result<()> {
        let raw = r#"{"report": {"timestamp": "2023-11-14T22:13:20.123456Z"}, "crash": {}}"#;
        let once = fix_report(raw)?;
        assert_eq!(fix_report(&once)?, once);
        Ok(())
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(fix_report("{\"report\": ").is_err());
    }
}
