// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An in-process crash reporter for Linux.
//!
//! Once [install]ed, crashee watches the process for fatal signals, panics, uncaught exceptions
//! of an embedding runtime and a deadlocked main thread. When one happens it suspends the other
//! threads, walks every stack and writes a JSON report under the installation directory. The
//! application picks those reports up on its next run, through [send_pending_reports] or the
//! lower level store functions in [api].
//!
//! The code reachable from a fatal signal handler does not allocate or lock. It lives in
//! [collector], [monitor] and [report::writer], and logs with the `crash_*!` macros instead of
//! `tracing`.

#[macro_use]
pub mod shared;

pub mod api;
pub mod collector;
pub mod context;
pub mod monitor;
pub mod report;
pub mod store;

pub use api::*;
pub use monitor::app_state::AppStats;
pub use monitor::system::AppIdentity;
pub use monitor::user::UserException;
pub use monitor::MonitorType;
pub use report::{CollectionSummary, CrashDoctor, CrashReport, DefaultCrashDoctor, ReportHandler};
pub use shared::configuration::CrasheeConfiguration;
pub use store::StoreError;
