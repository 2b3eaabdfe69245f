// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writing reports on the crash path, and reading them back afterwards.

pub mod buffered_writer;
pub mod crash_report;
pub mod doctor;
pub mod fixer;
pub mod introspection;
pub mod json_codec;
pub mod model;
pub mod reporter;
pub mod writer;

pub use doctor::{CrashDoctor, DefaultCrashDoctor};
pub use model::CrashReport;
pub use reporter::{collect_pending_reports, CollectionSummary, ReportHandler};
pub use writer::ReportWriter;
