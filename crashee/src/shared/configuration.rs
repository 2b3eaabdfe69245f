// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::monitor::MonitorType;
use crate::shared::constants;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything `install_with_configuration` applies before the monitors are enabled.
/// Each field can also be changed later through its own setter in [crate::api].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrasheeConfiguration {
    add_console_log_to_report: bool,
    create_alt_stack: bool,
    deadlock_watchdog_interval: Duration,
    // Class names whose objects are never introspected beyond their name
    do_not_introspect_classes: Vec<String>,
    introspect_memory: bool,
    max_report_count: usize,
    monitoring: MonitorType,
    print_previous_log: bool,
    use_alt_stack: bool,
    user_info_json: Option<String>,
}

impl Default for CrasheeConfiguration {
    fn default() -> Self {
        Self {
            add_console_log_to_report: false,
            create_alt_stack: true,
            deadlock_watchdog_interval: constants::DEFAULT_DEADLOCK_WATCHDOG_INTERVAL,
            do_not_introspect_classes: vec![],
            introspect_memory: true,
            max_report_count: constants::DEFAULT_MAX_REPORT_COUNT,
            monitoring: MonitorType::PRODUCTION_SAFE_MINIMAL,
            print_previous_log: false,
            use_alt_stack: true,
            user_info_json: None,
        }
    }
}

impl CrasheeConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitoring: MonitorType,
        user_info_json: Option<String>,
        introspect_memory: bool,
        mut do_not_introspect_classes: Vec<String>,
        add_console_log_to_report: bool,
        print_previous_log: bool,
        max_report_count: usize,
        deadlock_watchdog_interval: Option<Duration>,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(max_report_count > 0, "max_report_count must be at least 1");
        if let Some(json) = &user_info_json {
            validate_json_object(json)?;
        }
        let deadlock_watchdog_interval = deadlock_watchdog_interval
            .unwrap_or(constants::DEFAULT_DEADLOCK_WATCHDOG_INTERVAL);
        anyhow::ensure!(
            !deadlock_watchdog_interval.is_zero(),
            "The deadlock watchdog interval must be positive"
        );
        do_not_introspect_classes.sort();
        do_not_introspect_classes.dedup();

        Ok(Self {
            add_console_log_to_report,
            create_alt_stack,
            deadlock_watchdog_interval,
            do_not_introspect_classes,
            introspect_memory,
            max_report_count,
            monitoring,
            print_previous_log,
            use_alt_stack,
            user_info_json,
        })
    }

    /// Parses a configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let parsed: Self = serde_json::from_str(json)?;
        // Re-run the validation of `new`.
        Self::new(
            parsed.monitoring,
            parsed.user_info_json,
            parsed.introspect_memory,
            parsed.do_not_introspect_classes,
            parsed.add_console_log_to_report,
            parsed.print_previous_log,
            parsed.max_report_count,
            Some(parsed.deadlock_watchdog_interval),
            parsed.create_alt_stack,
            parsed.use_alt_stack,
        )
    }

    pub fn add_console_log_to_report(&self) -> bool {
        self.add_console_log_to_report
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn deadlock_watchdog_interval(&self) -> Duration {
        self.deadlock_watchdog_interval
    }

    pub fn do_not_introspect_classes(&self) -> &Vec<String> {
        &self.do_not_introspect_classes
    }

    pub fn introspect_memory(&self) -> bool {
        self.introspect_memory
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn monitoring(&self) -> MonitorType {
        self.monitoring
    }

    pub fn print_previous_log(&self) -> bool {
        self.print_previous_log
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn user_info_json(&self) -> Option<&str> {
        self.user_info_json.as_deref()
    }

    pub fn set_monitoring(&mut self, monitoring: MonitorType) {
        self.monitoring = monitoring;
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }
}

/// Checks that `json` is a single well-formed JSON value.
pub fn validate_json(json: &str) -> anyhow::Result<()> {
    serde_json::from_str::<IgnoredAny>(json)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("Invalid JSON: {e}"))
}

/// Checks that `json` is a single JSON object. The `user` block of a report is built on it.
pub fn validate_json_object(json: &str) -> anyhow::Result<()> {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(json)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("User info must be a JSON object: {e}"))
}
