// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation helpers for crash report tests.
//! Reports are read straight from the store directory of an installation and inspected as
//! untyped JSON, so that the tests check the document consumers actually see.

use crate::APP_NAME;
use anyhow::{Context, Result};
use serde_json::Value;
use std::{fs, path::Path, path::PathBuf};

/// Paths of the reports under `base_path`, oldest first.
pub fn report_paths(base_path: &Path) -> Result<Vec<PathBuf>> {
    let reports_dir = base_path.join("Reports");
    let prefix = format!("{APP_NAME}-report-");
    let mut paths = Vec::new();
    for entry in fs::read_dir(&reports_dir)
        .with_context(|| format!("listing reports in {}", reports_dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".json") {
            paths.push(path);
        }
    }
    // Ids are fixed width hex, so names sort in id order.
    paths.sort();
    Ok(paths)
}

pub fn read_report(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("reading report at {}", path.display()))?;
    serde_json::from_slice::<Value>(&bytes)
        .with_context(|| format!("deserializing report at {} to json", path.display()))
}

/// Reads the only report under `base_path`.
pub fn read_single_report(base_path: &Path) -> Result<Value> {
    let paths = report_paths(base_path)?;
    anyhow::ensure!(
        paths.len() == 1,
        "Expected exactly one report, found {}: {:?}",
        paths.len(),
        paths
    );
    read_report(&paths[0])
}

/// A fluent API for validating crash reports.
///
/// # Example
/// ```ignore
/// ReportValidator::new(&report)
///     .validate_report_info("standard")?
///     .validate_error_type("signal")?
///     .validate_signal_name("SIGSEGV")?;
/// ```
pub struct ReportValidator<'a> {
    report: &'a Value,
}

impl<'a> ReportValidator<'a> {
    pub fn new(report: &'a Value) -> Self {
        Self { report }
    }

    /// Validates the `report` block: version, id, process name, timestamp and report type.
    pub fn validate_report_info(self, expected_type: &str) -> Result<Self> {
        let info = self
            .report
            .get("report")
            .context("Report info block should be present")?;
        anyhow::ensure!(
            info["version"].is_string(),
            "Report version missing: {info}"
        );
        anyhow::ensure!(
            info["id"].as_str().is_some_and(|id| !id.is_empty()),
            "Report id missing: {info}"
        );
        anyhow::ensure!(
            info["process_name"].is_string(),
            "Process name missing: {info}"
        );
        anyhow::ensure!(
            info["timestamp"].as_i64().is_some_and(|t| t > 0),
            "Raw reports carry a microsecond timestamp, got {}",
            info["timestamp"]
        );
        anyhow::ensure!(
            info["type"] == expected_type,
            "Expected report type '{}', got {}",
            expected_type,
            info["type"]
        );
        Ok(self)
    }

    /// Validates every top level section of a standard report is there.
    pub fn validate_standard_sections(self) -> Result<Self> {
        for section in [
            "report",
            "binary_images",
            "process",
            "system",
            "crash",
            "user",
            "debug",
        ] {
            anyhow::ensure!(
                self.report.get(section).is_some(),
                "Section '{section}' should be present in a standard report"
            );
        }
        let images = self.report["binary_images"]
            .as_array()
            .context("binary_images should be an array")?;
        anyhow::ensure!(!images.is_empty(), "No binary images were recorded");
        Ok(self)
    }

    pub fn validate_error_type(self, expected_type: &str) -> Result<Self> {
        let error_type = self.report["crash"]["error"]["type"]
            .as_str()
            .context("crash.error.type should be a string")?;
        anyhow::ensure!(
            error_type == expected_type,
            "Expected error type '{}', got '{}'",
            expected_type,
            error_type
        );
        Ok(self)
    }

    pub fn validate_signal_name(self, expected_name: &str) -> Result<Self> {
        let name = self.report["crash"]["error"]["signal"]["name"]
            .as_str()
            .context("crash.error.signal.name should be a string")?;
        anyhow::ensure!(
            name == expected_name,
            "Expected signal '{}', got '{}'",
            expected_name,
            name
        );
        Ok(self)
    }

    /// Validates the error reason contains specific text.
    pub fn validate_reason_contains(self, expected_substring: &str) -> Result<Self> {
        let reason = self.report["crash"]["error"]["reason"]
            .as_str()
            .context("crash.error.reason should be a string")?;
        anyhow::ensure!(
            reason.contains(expected_substring),
            "Expected reason to contain '{}', got: '{}'",
            expected_substring,
            reason
        );
        Ok(self)
    }

    /// Validates exactly one thread is marked crashed and that it has a backtrace.
    pub fn validate_crashed_thread(self) -> Result<Self> {
        let threads = self.report["crash"]["threads"]
            .as_array()
            .context("crash.threads should be an array")?;
        let crashed: Vec<&Value> = threads
            .iter()
            .filter(|t| t["crashed"].as_bool() == Some(true))
            .collect();
        anyhow::ensure!(
            crashed.len() == 1,
            "Expected one crashed thread among {}, got {}",
            threads.len(),
            crashed.len()
        );
        let frames = crashed[0]["backtrace"]["contents"]
            .as_array()
            .context("The crashed thread should have a backtrace")?;
        anyhow::ensure!(!frames.is_empty(), "The crashed thread backtrace is empty");
        Ok(self)
    }

    /// Validates at least `count` threads were recorded.
    pub fn validate_thread_count_at_least(self, count: usize) -> Result<Self> {
        let threads = self.report["crash"]["threads"]
            .as_array()
            .context("crash.threads should be an array")?;
        anyhow::ensure!(
            threads.len() >= count,
            "Expected at least {} threads, got {}",
            count,
            threads.len()
        );
        Ok(self)
    }

    /// Validates a field of the `user` block.
    pub fn validate_user_field(self, key: &str, expected: &Value) -> Result<Self> {
        let actual = &self.report["user"][key];
        anyhow::ensure!(
            actual == expected,
            "Expected user.{} to be {}, got {}",
            key,
            expected,
            actual
        );
        Ok(self)
    }

    /// Validates the application state counters marked the crash.
    pub fn validate_app_stats_present(self) -> Result<Self> {
        let stats = self.report["system"]["application_stats"]
            .as_object()
            .context("system.application_stats should be an object")?;
        anyhow::ensure!(
            stats.contains_key("launches_since_last_crash"),
            "Launch counter missing from {stats:?}"
        );
        Ok(self)
    }

    pub fn report(&self) -> &'a Value {
        self.report
    }
}
