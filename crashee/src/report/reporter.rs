// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hands reports left on disk by earlier runs to the application.

use super::doctor::{diagnose, CrashDoctor};
use super::fixer::fix_report;
use super::model::CrashReport;
use crate::store::{ReportStore, StoreError};

/// Receives each pending report. Reports it accepts are deleted from the store.
pub trait ReportHandler {
    fn handle(&mut self, id: u64, report: &CrashReport) -> anyhow::Result<()>;
}

impl<F> ReportHandler for F
where
    F: FnMut(u64, &CrashReport) -> anyhow::Result<()>,
{
    fn handle(&mut self, id: u64, report: &CrashReport) -> anyhow::Result<()> {
        self(id, report)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Handled and deleted.
    pub handled: Vec<u64>,
    /// Rejected by the handler, kept for a later attempt.
    pub rejected: Vec<u64>,
    /// Could not be read or decoded, kept on disk.
    pub unreadable: Vec<u64>,
}

/// Reads every report in `store`, oldest first, fixes it up, diagnoses it and hands it to
/// `handler`.
///
/// A report that fails anywhere along the way is left in the store, and the collection moves
/// on to the next one. Only listing the store can fail the whole call.
pub fn collect_pending_reports(
    store: &ReportStore,
    doctor: &dyn CrashDoctor,
    handler: &mut dyn ReportHandler,
) -> Result<CollectionSummary, StoreError> {
    let mut summary = CollectionSummary::default();
    for id in store.report_ids()? {
        let mut report = match load_report(store, id) {
            Ok(Some(report)) => report,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Skipping unreadable report {id:016x}: {e:#}");
                summary.unreadable.push(id);
                continue;
            }
        };
        diagnose(&mut report, doctor);

        if let Err(e) = handler.handle(id, &report) {
            tracing::warn!("Report {id:016x} was not handled: {e:#}");
            summary.rejected.push(id);
            continue;
        }
        match store.delete_report(id) {
            Ok(()) => summary.handled.push(id),
            Err(e) => tracing::error!("Could not delete handled report {id:016x}: {e}"),
        }
    }
    tracing::debug!(
        handled = summary.handled.len(),
        rejected = summary.rejected.len(),
        unreadable = summary.unreadable.len(),
        "Collected pending reports"
    );
    Ok(summary)
}

/// Reads, fixes and decodes one report. `None` if it vanished since it was listed.
fn load_report(store: &ReportStore, id: u64) -> anyhow::Result<Option<CrashReport>> {
    let Some(raw) = store.read_report(id)? else {
        return Ok(None);
    };
    let fixed = fix_report(&raw)?;
    Ok(Some(CrashReport::from_json(&fixed)?))
}
