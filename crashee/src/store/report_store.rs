// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::{DEFAULT_MAX_REPORT_COUNT, MAX_PATH_LENGTH};
use crate::shared::fmt_buf::FmtBuf;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Capacity of the buffer a report path is produced into.
pub const REPORT_PATH_CAPACITY: usize = MAX_PATH_LENGTH;

const REPORT_INFIX: &str = "-report-";
const REPORT_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("the report store is not initialized")]
    NotInitialized,
    #[error("report store path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("report path {0:?} does not fit in {REPORT_PATH_CAPACITY} bytes")]
    PathTooLong(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

struct StoreLocation {
    reports_dir: String,
    app_name: String,
}

impl StoreLocation {
    fn file_name(&self, id: u64) -> String {
        format!("{}{REPORT_INFIX}{id:016x}{REPORT_SUFFIX}", self.app_name)
    }

    fn report_path(&self, id: u64) -> PathBuf {
        Path::new(&self.reports_dir).join(self.file_name(id))
    }

    /// The id of a file name this store produced.
    fn parse_id(&self, file_name: &str) -> Option<u64> {
        let hex = file_name
            .strip_prefix(self.app_name.as_str())?
            .strip_prefix(REPORT_INFIX)?
            .strip_suffix(REPORT_SUFFIX)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }
}

/// Report files in a directory, named `<app>-report-<016x id>.json`.
///
/// Ids come from a counter seeded with the wall clock in microseconds, and never below an id
/// already on disk, so later reports sort after earlier ones.
///
/// The next report path can be produced on the crash path: the location is published through
/// an atomic pointer, and the path is formatted into a caller supplied buffer. Every other
/// operation takes the store lock.
pub struct ReportStore {
    location: AtomicPtr<StoreLocation>,
    next_id: AtomicU64,
    max_report_count: AtomicUsize,
    lock: Mutex<()>,
}

impl ReportStore {
    pub const fn new() -> Self {
        Self {
            location: AtomicPtr::new(ptr::null_mut()),
            next_id: AtomicU64::new(0),
            max_report_count: AtomicUsize::new(DEFAULT_MAX_REPORT_COUNT),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn location(&self) -> Result<&StoreLocation, StoreError> {
        let location = self.location.load(SeqCst);
        // SAFETY: set from `Box::into_raw` in `initialize`, and only freed there under the lock.
        unsafe { location.as_ref() }.ok_or(StoreError::NotInitialized)
    }

    /// Points the store at `reports_dir`, creating it, and evicts reports over the maximum.
    pub fn initialize(&self, reports_dir: &Path, app_name: &str) -> Result<(), StoreError> {
        let _guard = self.guard();
        std::fs::create_dir_all(reports_dir).map_err(StoreError::io(reports_dir))?;
        let dir = reports_dir
            .to_str()
            .ok_or_else(|| StoreError::NonUtf8Path(reports_dir.to_path_buf()))?;
        let location = Box::new(StoreLocation {
            reports_dir: dir.to_owned(),
            app_name: app_name.to_owned(),
        });

        let ids = list_ids(&location)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let after_last = ids.last().map_or(0, |id| id + 1);
        self.next_id.store(now.max(after_last), SeqCst);

        let old = self.location.swap(Box::into_raw(location), SeqCst);
        if !old.is_null() {
            // SAFETY: came from `Box::into_raw` above, in an earlier call.
            unsafe { drop(Box::from_raw(old)) };
        }
        tracing::debug!(dir, app_name, reports = ids.len(), "Initialized report store");
        self.prune_locked()
    }

    /// Produces the path of a new report into `path` and returns its id. Does not allocate or
    /// lock.
    pub fn next_report_path(&self, path: &mut FmtBuf<REPORT_PATH_CAPACITY>) -> Option<u64> {
        let location = self.location().ok()?;
        let id = self.next_id.fetch_add(1, SeqCst);
        path.clear();
        let _ = write!(
            path,
            "{}/{}{REPORT_INFIX}{id:016x}{REPORT_SUFFIX}",
            location.reports_dir, location.app_name
        );
        // A truncated path would write somewhere unexpected.
        if path.len() >= REPORT_PATH_CAPACITY - 1 {
            crash_error!("Report path does not fit in {} bytes", REPORT_PATH_CAPACITY);
            return None;
        }
        Some(id)
    }

    pub fn report_path(&self, id: u64) -> Result<PathBuf, StoreError> {
        Ok(self.location()?.report_path(id))
    }

    pub fn report_count(&self) -> Result<usize, StoreError> {
        Ok(self.report_ids()?.len())
    }

    /// Ids of the stored reports, oldest first.
    pub fn report_ids(&self) -> Result<Vec<u64>, StoreError> {
        let _guard = self.guard();
        list_ids(self.location()?)
    }

    /// The report as written. `None` if there is no such report.
    pub fn read_report(&self, id: u64) -> Result<Option<String>, StoreError> {
        let _guard = self.guard();
        let path = self.location()?.report_path(id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path)(e)),
        }
    }

    /// Stores a report produced outside the crash path. Returns its id.
    pub fn add_user_report(&self, report: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.guard();
        let location = self.location()?;
        let id = self.next_id.fetch_add(1, SeqCst);
        let path = location.report_path(id);
        std::fs::write(&path, report).map_err(StoreError::io(&path))?;
        self.prune_locked()?;
        Ok(id)
    }

    pub fn delete_report(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.guard();
        let path = self.location()?.report_path(id);
        remove_report(&path)
    }

    pub fn delete_all_reports(&self) -> Result<(), StoreError> {
        let _guard = self.guard();
        let location = self.location()?;
        for id in list_ids(location)? {
            remove_report(&location.report_path(id))?;
        }
        Ok(())
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count.load(SeqCst)
    }

    /// Sets how many reports are kept. Takes effect at the next initialization or added report.
    pub fn set_max_report_count(&self, max_report_count: usize) {
        self.max_report_count.store(max_report_count, SeqCst);
    }

    /// Deletes the oldest reports until at most the maximum count remain.
    fn prune_locked(&self) -> Result<(), StoreError> {
        let location = self.location()?;
        let ids = list_ids(location)?;
        let excess = ids.len().saturating_sub(self.max_report_count());
        for id in &ids[..excess] {
            tracing::debug!("Evicting report {id:016x}");
            remove_report(&location.report_path(*id))?;
        }
        Ok(())
    }
}

impl Default for ReportStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReportStore {
    fn drop(&mut self) {
        let location = *self.location.get_mut();
        if !location.is_null() {
            // SAFETY: came from `Box::into_raw` in `initialize`.
            unsafe { drop(Box::from_raw(location)) };
        }
    }
}

fn list_ids(location: &StoreLocation) -> Result<Vec<u64>, StoreError> {
    let dir = Path::new(&location.reports_dir);
    let entries = std::fs::read_dir(dir).map_err(StoreError::io(dir))?;
    let mut ids: Vec<u64> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| location.parse_id(entry.file_name().to_str()?))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

fn remove_report(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> ReportStore {
        let store = ReportStore::new();
        store.initialize(dir, "MyApp").unwrap();
        store
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_ids_increase_and_paths_are_named() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        let mut path = FmtBuf::new();
        let first = store.next_report_path(&mut path).unwrap();
        assert_eq!(
            path.as_str(),
            format!("{}/MyApp-report-{first:016x}.json", dir.path().display())
        );
        let second = store.next_report_path(&mut path).unwrap();
        assert_eq!(second, first + 1);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_add_read_delete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        let a = store.add_user_report(br#"{"a": 1}"#)?;
        let b = store.add_user_report(br#"{"b": 2}"#)?;
        // Files from other apps and other names are not reports of this store.
        std::fs::write(dir.path().join("Other-report-0000000000000001.json"), "{}")?;
        std::fs::write(dir.path().join("MyApp-report-xyz.json"), "{}")?;

        assert_eq!(store.report_ids()?, vec![a, b]);
        assert_eq!(store.read_report(b)?.as_deref(), Some(r#"{"b": 2}"#));
        assert_eq!(store.read_report(b + 100)?, None);

        store.delete_report(a)?;
        assert_eq!(store.report_ids()?, vec![b]);
        store.delete_all_reports()?;
        assert_eq!(store.report_count()?, 0);
        assert!(dir.path().join("Other-report-0000000000000001.json").exists());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_oldest_reports_are_evicted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(dir.path());
        store.set_max_report_count(2);
        let ids: Vec<u64> = (0..4)
            .map(|i| store.add_user_report(format!("{{\"n\": {i}}}").as_bytes()))
            .collect::<Result<_, _>>()?;
        assert_eq!(store.report_ids()?, ids[2..].to_vec());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_ids_continue_after_existing_reports() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let far_future = u64::MAX / 2;
        std::fs::write(
            dir.path().join(format!("MyApp-report-{far_future:016x}.json")),
            "{}",
        )?;
        let store = store_in(dir.path());
        let mut path = FmtBuf::new();
        assert_eq!(store.next_report_path(&mut path), Some(far_future + 1));
        Ok(())
    }

    #[test]
    fn test_uninitialized_store() {
        let store = ReportStore::new();
        let mut path = FmtBuf::new();
        assert!(store.next_report_path(&mut path).is_none());
        assert!(matches!(
            store.report_count(),
            Err(StoreError::NotInitialized)
        ));
    }
}
