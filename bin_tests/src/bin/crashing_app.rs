// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::{CrashMode, APP_NAME};
    use crashee::report::ReportWriter;
    use crashee::{CrashReport, CrasheeConfiguration, MonitorType, UserException};
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    const DEADLOCK_WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

    #[inline(never)]
    unsafe fn fn3() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }
    }

    #[inline(never)]
    fn fn2() {
        unsafe { fn3() }
    }

    #[inline(never)]
    fn fn1() {
        fn2()
    }

    /// Crashes from inside the report writer.
    fn crash_while_writing(_writer: &mut dyn ReportWriter) {
        fn1()
    }

    fn monitoring(mode: CrashMode) -> MonitorType {
        let mut monitoring = MonitorType::PRODUCTION_SAFE_MINIMAL;
        match mode {
            CrashMode::Deadlock => monitoring |= MonitorType::MAIN_THREAD_DEADLOCK,
            CrashMode::ManagedException => monitoring |= MonitorType::ZOMBIE,
            _ => {}
        }
        monitoring
    }

    #[inline(never)]
    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode = args
            .next()
            .context("Unexpected number of arguments 1")?
            .parse::<CrashMode>()
            .map_err(anyhow::Error::msg)?;
        let base_path = PathBuf::from(args.next().context("Unexpected number of arguments 2")?);
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");

        let config = CrasheeConfiguration::new(
            monitoring(mode),
            Some(r#"{"service": "crashing_app"}"#.to_owned()),
            true,   // introspect_memory
            vec![], // do_not_introspect_classes
            true,   // add_console_log_to_report
            false,  // print_previous_log
            5,      // max_report_count
            Some(DEADLOCK_WATCHDOG_INTERVAL),
            true, // create_alt_stack
            true, // use_alt_stack
        )?;
        crashee::set_report_field("mode", Some(&format!("\"{mode}\"")))?;
        if mode == CrashMode::Recrash {
            crashee::set_user_section_callback(Some(crash_while_writing));
        }
        let active = crashee::install_with_configuration(APP_NAME, &base_path, &config)?;
        println!("{}", active.bits());

        match mode {
            CrashMode::DoNothing => {}
            CrashMode::Segv | CrashMode::Recrash => fn1(),
            CrashMode::Abort => std::process::abort(),
            CrashMode::Fpe => unsafe {
                libc::raise(libc::SIGFPE);
            },
            CrashMode::Panic => panic!("Boom from a panic"),
            CrashMode::UserReport | CrashMode::UserReportTerminate => {
                // A second thread for the report to suspend and record.
                std::thread::spawn(|| loop {
                    std::thread::park();
                });
                let reported = crashee::report_user_exception(&UserException {
                    name: "Boom",
                    reason: Some("Something went wrong"),
                    language: Some("rust"),
                    line_of_code: Some("42"),
                    stack_trace: Some(r#"[{"symbol": "fn1"}]"#),
                    log_all_threads: true,
                    terminate_program: mode == CrashMode::UserReportTerminate,
                });
                anyhow::ensure!(reported, "The user report was not written");
            }
            CrashMode::ManagedException => {
                crashee::notify_exception_deallocated(0x1000, "RangeError", "An earlier failure");
                crashee::report_managed_exception(
                    "InvalidArgumentError",
                    Some("Boom from managed code"),
                    Some(r#"{"argument": "x"}"#),
                    &[],
                );
                std::process::abort();
            }
            CrashMode::Deadlock => {
                crashee::notify_main_thread_heartbeat();
                loop {
                    std::thread::sleep(Duration::from_secs(60));
                }
            }
            CrashMode::CollectReports => collect_reports()?,
            CrashMode::DeleteAllReports => {
                let count_before = crashee::report_count()?;
                crashee::delete_all_reports()?;
                let output = serde_json::json!({
                    "count_before": count_before,
                    "count_after": crashee::report_count()?,
                });
                println!("{output}");
            }
        }
        Ok(())
    }

    fn collect_reports() -> anyhow::Result<()> {
        let count_before = crashee::report_count()?;
        let first_timestamp = match crashee::report_ids()?.first() {
            Some(&id) => {
                let fixed = crashee::read_report(id)?.context("The listed report vanished")?;
                let fixed: serde_json::Value = serde_json::from_str(&fixed)?;
                fixed["report"]["timestamp"].clone()
            }
            None => serde_json::Value::Null,
        };
        let crashed_last_launch = crashee::app_stats().crashed_last_launch;

        let mut seen = Vec::new();
        let mut handler = |id: u64, report: &CrashReport| -> anyhow::Result<()> {
            seen.push(serde_json::json!({
                "id": id,
                "type": report.crash.error.kind,
                "diagnosis": report.crash.diagnosis,
            }));
            Ok(())
        };
        let summary = crashee::send_pending_reports(&mut handler)?;

        let output = serde_json::json!({
            "count_before": count_before,
            "handled": summary.handled,
            "reports": seen,
            "count_after": crashee::report_count()?,
            "first_timestamp": first_timestamp,
            "crashed_last_launch": crashed_last_launch,
        });
        println!("{output}");
        Ok(())
    }
}
