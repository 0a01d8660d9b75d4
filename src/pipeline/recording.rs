// SPDX-License-Identifier: MPL-2.0

//! Recording store: fragment naming, directory resolution, size quota
//!
//! The segmenting sink asks for a location every time it opens a fragment.
//! Before handing out the new path the store deletes the oldest fragments
//! until the directory is back under quota. The fragment about to be written
//! is never a deletion candidate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::constants::recording::{
    BYTES_PER_MEGABYTE, FRAGMENT_EXTENSION, FRAGMENT_TIME_FORMAT, QUOTA_MAX_ITERATIONS,
};
use crate::errors::StorageError;

/// How a quota pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// Quota disabled (zero or negative size)
    Unbounded,
    /// Total size is below the quota
    WithinQuota,
    /// The oldest remaining fragment is the one about to be written
    ActiveIsOldest,
    /// Over quota but no fragment left to delete
    NoCandidate,
    /// Stopped after the per-pass deletion limit
    IterationLimit,
    /// Directory could not be read or a fragment could not be removed
    IoFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReport {
    pub outcome: QuotaOutcome,
    pub removed: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Fragment file name for `time`: `YYYY-MM-DD--HH-MM-SS[index].mp4`
pub fn fragment_file_name(time: &DateTime<Local>, index: u32) -> String {
    format!(
        "{}[{}].{}",
        time.format(FRAGMENT_TIME_FORMAT),
        index,
        FRAGMENT_EXTENSION
    )
}

fn is_fragment(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAGMENT_EXTENSION))
}

/// Regular files in `dir` carrying the fragment extension, with their size and mtime
fn fragments(dir: &Path) -> io::Result<Vec<(PathBuf, u64, SystemTime)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            debug!(path = %path.display(), "Ignoring non-file entry");
            continue;
        }
        if !is_fragment(&path) {
            debug!(path = %path.display(), "Ignoring entry without fragment extension");
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((path, metadata.len(), modified));
    }
    Ok(found)
}

/// Sum of fragment sizes in `dir`
pub fn total_size(dir: &Path) -> io::Result<u64> {
    Ok(fragments(dir)?.iter().map(|(_, size, _)| size).sum())
}

/// Fragment with the oldest modification time (ties broken by name)
pub fn oldest_fragment(dir: &Path) -> io::Result<Option<PathBuf>> {
    Ok(fragments(dir)?
        .into_iter()
        .min_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)))
        .map(|(path, _, _)| path))
}

/// Delete oldest fragments until the directory is below `max_bytes`
///
/// `active` is never deleted; when it is the oldest fragment the pass stops.
/// `None` disables the quota.
pub fn enforce_quota(dir: &Path, max_bytes: Option<u64>, active: &Path) -> QuotaReport {
    let mut report = QuotaReport {
        outcome: QuotaOutcome::WithinQuota,
        removed: Vec::new(),
        total_bytes: 0,
    };

    let Some(max_bytes) = max_bytes else {
        warn!(
            "Recording size quota disabled, storage will grow until the disk is full"
        );
        report.outcome = QuotaOutcome::Unbounded;
        return report;
    };

    let mut total = match total_size(dir) {
        Ok(total) => total,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "Failed to size recording directory");
            report.outcome = QuotaOutcome::IoFailure;
            return report;
        }
    };
    info!(total_mb = total / BYTES_PER_MEGABYTE, "Recording directory size");

    let mut iterations = 0;
    while total >= max_bytes {
        if iterations >= QUOTA_MAX_ITERATIONS {
            error!(
                iterations,
                "Quota enforcement stopped after reaching the deletion limit"
            );
            report.outcome = QuotaOutcome::IterationLimit;
            break;
        }

        let oldest = match oldest_fragment(dir) {
            Ok(Some(oldest)) => oldest,
            Ok(None) => {
                error!("Recording quota exceeded but no fragment is left to delete");
                report.outcome = QuotaOutcome::NoCandidate;
                break;
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to list recording directory");
                report.outcome = QuotaOutcome::IoFailure;
                break;
            }
        };

        if oldest == active {
            error!(
                path = %active.display(),
                "Recording quota exceeded but the oldest fragment is the active one"
            );
            report.outcome = QuotaOutcome::ActiveIsOldest;
            break;
        }

        info!(path = %oldest.display(), "Removing oldest recording fragment");
        if let Err(e) = fs::remove_file(&oldest) {
            error!(path = %oldest.display(), error = %e, "Failed to remove fragment");
            report.outcome = QuotaOutcome::IoFailure;
            break;
        }
        report.removed.push(oldest);
        iterations += 1;

        total = match total_size(dir) {
            Ok(total) => total,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to size recording directory");
                report.outcome = QuotaOutcome::IoFailure;
                break;
            }
        };
    }

    info!(
        total_mb = total / BYTES_PER_MEGABYTE,
        removed = report.removed.len(),
        "Recording directory size after cleanup"
    );
    report.total_bytes = total;
    report
}

/// Recording directory state shared between the engine and the sink callback
#[derive(Debug)]
pub struct RecordingStore {
    path: PathBuf,
    force_mkdirs: bool,
    max_size_mb: i64,
    resolved: Option<PathBuf>,
    active: Option<PathBuf>,
}

impl RecordingStore {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            path: config.recording_path.clone(),
            force_mkdirs: config.force_mkdirs,
            max_size_mb: config.recording_max_size_mb,
            resolved: None,
            active: None,
        }
    }

    /// Pick up new directory and quota settings
    pub fn apply(&mut self, config: &PipelineConfig) {
        if self.path != config.recording_path {
            self.resolved = None;
        }
        self.path = config.recording_path.clone();
        self.force_mkdirs = config.force_mkdirs;
        self.max_size_mb = config.recording_max_size_mb;
    }

    /// Quota in bytes, `None` when disabled
    pub fn max_bytes(&self) -> Option<u64> {
        u64::try_from(self.max_size_mb)
            .ok()
            .filter(|mb| *mb > 0)
            .map(|mb| mb.saturating_mul(BYTES_PER_MEGABYTE))
    }

    /// Make sure the recording directory exists, creating it when allowed
    pub fn resolve_dir(&mut self) -> Result<PathBuf, StorageError> {
        let path = self.path.clone();
        if path.exists() {
            if !path.is_dir() {
                return Err(StorageError::NotADirectory(path));
            }
        } else if self.force_mkdirs {
            warn!(path = %path.display(), "Recording directory missing, creating it");
            fs::create_dir_all(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        } else {
            return Err(StorageError::MissingDirectory(path));
        }

        let resolved = fs::canonicalize(&path).unwrap_or(path);
        info!(path = %resolved.display(), "Recording directory");
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    pub fn resolved_dir(&self) -> Option<&Path> {
        self.resolved.as_deref()
    }

    /// Fragment currently being written
    pub fn active_fragment(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    /// Location for fragment `index`, called by the segmenting sink
    ///
    /// Returns `None` when the directory cannot be resolved; the sink then
    /// keeps its default location.
    pub fn next_fragment(&mut self, index: u32) -> Option<PathBuf> {
        let dir = match self.resolve_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, index, "Cannot place recording fragment");
                return None;
            }
        };

        let path = dir.join(fragment_file_name(&Local::now(), index));
        info!(index, path = %path.display(), "New recording fragment");

        enforce_quota(&dir, self.max_bytes(), &path);
        self.active = Some(path.clone());
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs::File;
    use std::time::Duration;

    fn write_fragment(dir: &Path, name: &str, len: usize, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; len]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        path
    }

    fn config(dir: &Path, force_mkdirs: bool) -> PipelineConfig {
        PipelineConfig {
            recording_path: dir.to_path_buf(),
            force_mkdirs,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn fragment_names_follow_local_timestamp_layout() {
        let time = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            fragment_file_name(&time, 12),
            "2024-03-09--07-05-01[12].mp4"
        );
    }

    #[test]
    fn only_regular_fragment_files_count() {
        let dir = tempfile::tempdir().unwrap();
        write_fragment(dir.path(), "a.mp4", 100, 10);
        write_fragment(dir.path(), "notes.txt", 1000, 20);
        fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        assert_eq!(total_size(dir.path()).unwrap(), 100);
        assert_eq!(
            oldest_fragment(dir.path()).unwrap(),
            Some(dir.path().join("a.mp4"))
        );
    }

    #[test]
    fn quota_deletes_oldest_first_until_below() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = write_fragment(dir.path(), "1.mp4", 400, 300);
        let middle = write_fragment(dir.path(), "2.mp4", 400, 200);
        let newest = write_fragment(dir.path(), "3.mp4", 400, 100);
        let active = dir.path().join("4.mp4");

        let report = enforce_quota(dir.path(), Some(1000), &active);

        assert_eq!(report.outcome, QuotaOutcome::WithinQuota);
        assert_eq!(report.removed, vec![oldest.clone()]);
        assert_eq!(report.total_bytes, 800);
        assert!(!oldest.exists());
        assert!(middle.exists() && newest.exists());
    }

    #[test]
    fn quota_never_deletes_the_active_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let active = write_fragment(dir.path(), "active.mp4", 2000, 500);
        write_fragment(dir.path(), "other.mp4", 10, 10);

        let report = enforce_quota(dir.path(), Some(1000), &active);

        assert_eq!(report.outcome, QuotaOutcome::ActiveIsOldest);
        assert!(report.removed.is_empty());
        assert!(active.exists());
    }

    #[test]
    fn quota_pass_stops_at_the_deletion_limit() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..150u64 {
            write_fragment(dir.path(), &format!("{i:03}.mp4"), 1, 1000 - i);
        }
        let active = dir.path().join("live.mp4");

        let report = enforce_quota(dir.path(), Some(1), &active);

        assert_eq!(report.outcome, QuotaOutcome::IterationLimit);
        assert_eq!(report.removed.len(), QUOTA_MAX_ITERATIONS);
        assert_eq!(report.removed.len(), 100);
        assert_eq!(report.removed[0], dir.path().join("000.mp4"));
        assert_eq!(total_size(dir.path()).unwrap(), 50);
    }

    #[test]
    fn under_quota_directory_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_fragment(dir.path(), "1.mp4", 10, 10);
        let report = enforce_quota(dir.path(), Some(1000), &dir.path().join("2.mp4"));
        assert_eq!(report.outcome, QuotaOutcome::WithinQuota);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn non_positive_quota_disables_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), false);
        cfg.recording_max_size_mb = 0;
        assert_eq!(RecordingStore::new(&cfg).max_bytes(), None);
        cfg.recording_max_size_mb = -5;
        assert_eq!(RecordingStore::new(&cfg).max_bytes(), None);
        cfg.recording_max_size_mb = 2;
        assert_eq!(RecordingStore::new(&cfg).max_bytes(), Some(2 * 1024 * 1024));

        let kept = write_fragment(dir.path(), "1.mp4", 10, 10);
        let report = enforce_quota(dir.path(), None, &dir.path().join("2.mp4"));
        assert_eq!(report.outcome, QuotaOutcome::Unbounded);
        assert!(kept.exists());
    }

    #[test]
    fn missing_directory_fails_without_force_mkdirs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("recordings");

        let mut store = RecordingStore::new(&config(&missing, false));
        assert!(matches!(
            store.resolve_dir(),
            Err(StorageError::MissingDirectory(_))
        ));
        assert!(store.next_fragment(0).is_none());

        let mut store = RecordingStore::new(&config(&missing, true));
        let resolved = store.resolve_dir().unwrap();
        assert!(resolved.is_dir());
        assert_eq!(store.resolved_dir(), Some(resolved.as_path()));
    }

    #[test]
    fn next_fragment_lands_in_the_recording_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordingStore::new(&config(dir.path(), false));

        let path = store.next_fragment(3).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("[3].mp4"), "unexpected name {name}");
        assert_eq!(store.active_fragment(), Some(path.as_path()));
    }
}
