//! Record persistence and per-run session bookkeeping.
//!
//! Layout on the external drive:
//!
//! ```text
//! <mount>/<drive-session>/<run-or-date>/<HHMMSS>/<timestamp>_antenna<id>_state<s>[_<suffix>].json
//! ```
//!
//! The drive session is the last top-level directory on the mount (one per
//! deployment). Under it, records for one observing run share a parent
//! directory named by an explicit override or by the UTC date token of the
//! first filename. A fresh `HHMMSS` subdirectory starts at every
//! calibration+observation cycle boundary, so a resumed or interrupted run
//! never mixes cycles in one directory.
//!
//! The mount is an externally managed USB drive: both entry points block,
//! re-checking on a fixed interval, until the mount-point check passes.
//! When saving is globally disabled the bookkeeping still advances
//! identically, so re-enabling saving mid-run behaves predictably.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

/// Interval between mount re-checks.
const MOUNT_POLL: Duration = Duration::from_secs(5);

/// Filename marker for a summed record.
pub const AVERAGE_LABEL: &str = "average";

/// One saved unit: the calibration state and its spectrum, labeled by
/// accumulation id or as an average.
#[derive(Debug, Clone, Serialize)]
pub struct AccumulationRecord {
    /// Switch state this spectrum was taken in.
    pub state: u8,
    /// Well-known standard name, when the state has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_alias: Option<&'static str>,
    /// Accumulation id, or [`AVERAGE_LABEL`] for a summed record.
    pub label: String,
    /// Interleaved spectrum samples.
    pub spectrum: Vec<f64>,
}

/// Mount-point liveness check. Must be side-effect free.
pub trait MountCheck {
    fn is_mounted(&self, path: &Path) -> bool;
}

/// Real check against `/proc/self/mounts`, with a has-subdirectories
/// fallback when procfs is unreadable.
pub struct ProcMounts;

impl MountCheck for ProcMounts {
    fn is_mounted(&self, path: &Path) -> bool {
        match std::fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => {
                let wanted = path.to_string_lossy();
                mounts
                    .lines()
                    .filter_map(|line| line.split_whitespace().nth(1))
                    .any(|mountpoint| mountpoint == wanted)
            }
            // Degraded check: a populated directory is probably a mount.
            Err(_) => has_subdirectory(path),
        }
    }
}

/// Always-satisfied check for tests and `--mock` runs on plain
/// directories.
pub struct AlwaysMounted;

impl MountCheck for AlwaysMounted {
    fn is_mounted(&self, _path: &Path) -> bool {
        true
    }
}

fn has_subdirectory(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// UTC time source, injectable so directory-naming tests are
/// deterministic.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Per-run mutable state: which subdirectory is current and how many have
/// been created. Owned by the store for one process lifetime; never
/// persisted.
#[derive(Debug, Default)]
pub struct Session {
    current_subdir: Option<PathBuf>,
    subdir_count: u32,
}

impl Session {
    pub fn subdir_count(&self) -> u32 {
        self.subdir_count
    }

    pub fn current_subdir(&self) -> Option<&Path> {
        self.current_subdir.as_deref()
    }
}

/// Maps records to directories and writes them.
pub struct SessionStore {
    mount_path: PathBuf,
    antenna: String,
    run_dir: Option<String>,
    save_enabled: bool,
    save_each_acc: bool,
    session: Session,
    mount: Box<dyn MountCheck>,
    clock: Box<dyn Clock>,
}

impl SessionStore {
    pub fn new(
        mount_path: PathBuf,
        antenna: String,
        run_dir: Option<String>,
        save_enabled: bool,
        save_each_acc: bool,
    ) -> Self {
        SessionStore {
            mount_path,
            antenna,
            run_dir,
            save_enabled,
            save_each_acc,
            session: Session::default(),
            mount: Box::new(ProcMounts),
            clock: Box::new(SystemClock),
        }
    }

    /// Replace the mount check and clock (tests, `--mock`).
    pub fn with_environment(
        mut self,
        mount: Box<dyn MountCheck>,
        clock: Box<dyn Clock>,
    ) -> Self {
        self.mount = mount;
        self.clock = clock;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Persist one record.
    ///
    /// `cycle_boundary` starts a fresh `HHMMSS` subdirectory; otherwise the
    /// current one is reused (created on first use). With saving disabled
    /// nothing touches the filesystem, but the subdirectory bookkeeping
    /// advances exactly as if it had.
    pub fn save(
        &mut self,
        record: &AccumulationRecord,
        cycle_boundary: bool,
    ) -> ControlResult<()> {
        let now = self.clock.now();
        let filename = self.filename(record, now);

        if !self.save_enabled {
            self.advance_session(cycle_boundary, now, None)?;
            info!(filename, "data saving disabled, skipping write");
            return Ok(());
        }

        self.wait_for_mount();
        let parent = self.resolve_run_parent(&filename)?;
        std::fs::create_dir_all(&parent)?;
        self.advance_session(cycle_boundary, now, Some(&parent))?;

        let subdir = self
            .session
            .current_subdir
            .clone()
            .ok_or_else(|| ControlError::Storage("no current subdirectory".into()))?;
        let path = subdir.join(format!("{filename}.json"));
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer(file, record)
            .map_err(|e| ControlError::Storage(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "record saved");
        Ok(())
    }

    /// The active drive session: the lexicographically last top-level
    /// directory on the mount. Blocks until the mount check passes.
    pub fn resolve_run_root(&self) -> ControlResult<PathBuf> {
        self.wait_for_mount();
        let mut sessions: Vec<PathBuf> = std::fs::read_dir(&self.mount_path)?
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        sessions.sort();
        sessions.pop().ok_or_else(|| {
            ControlError::Storage(format!(
                "no drive session directory under {}",
                self.mount_path.display()
            ))
        })
    }

    /// Parent directory for this run: the override name, or the first
    /// underscore-delimited token of the filename (the UTC date).
    fn resolve_run_parent(&self, filename: &str) -> ControlResult<PathBuf> {
        let root = self.resolve_run_root()?;
        let name = match &self.run_dir {
            Some(name) => name.clone(),
            None => filename.split('_').next().unwrap_or(filename).to_string(),
        };
        Ok(root.join(name))
    }

    fn advance_session(
        &mut self,
        cycle_boundary: bool,
        now: DateTime<Utc>,
        parent: Option<&Path>,
    ) -> ControlResult<()> {
        if !cycle_boundary && self.session.current_subdir.is_some() {
            return Ok(());
        }
        let name = now.format("%H%M%S").to_string();
        let subdir = match parent {
            Some(parent) => parent.join(&name),
            // Saving disabled: track the name without touching disk.
            None => PathBuf::from(name),
        };
        if parent.is_some() {
            if !subdir.exists() {
                std::fs::create_dir_all(&subdir)?;
                self.session.subdir_count += 1;
                debug!(subdir = %subdir.display(), "new cycle subdirectory");
            }
        } else {
            self.session.subdir_count += 1;
        }
        self.session.current_subdir = Some(subdir);
        Ok(())
    }

    fn filename(&self, record: &AccumulationRecord, now: DateTime<Utc>) -> String {
        let base = format!(
            "{}_antenna{}_state{}",
            now.format("%Y%m%d_%H%M%S"),
            self.antenna,
            record.state
        );
        if self.save_each_acc {
            format!("{base}_{}", record.label)
        } else {
            base
        }
    }

    fn wait_for_mount(&self) {
        while !self.mount.is_mounted(&self.mount_path) {
            warn!(mount = %self.mount_path.display(),
                "storage not mounted, waiting for drive");
            std::thread::sleep(MOUNT_POLL);
        }
    }
}
