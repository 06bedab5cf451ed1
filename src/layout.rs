//! Path Layout Manager (spec §4.1) and the capability-probe cache that
//! piggybacks on the same `home`/`runhome` split.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, Result};

/// Name reported by [`crate::Driver::String`] and used as the
/// sub-directory name under additional image stores.
pub const DRIVER_NAME: &str = "overlay";

pub const LINK_FARM_DIR: &str = "l";

/// Pure path arithmetic over a driver root. Holds no mutable state;
/// every other component consumes this to find `home`, `runhome`, and
/// per-layer directories.
#[derive(Debug, Clone)]
pub struct Layout {
    home: PathBuf,
    runhome: PathBuf,
    additional_image_stores: Vec<PathBuf>,
}

impl Layout {
    pub fn new(home: PathBuf, runhome: PathBuf, additional_image_stores: Vec<PathBuf>) -> Self {
        Self {
            home,
            runhome,
            additional_image_stores,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn runhome(&self) -> &Path {
        &self.runhome
    }

    pub fn additional_image_stores(&self) -> &[PathBuf] {
        &self.additional_image_stores
    }

    pub fn link_farm_dir(&self) -> PathBuf {
        self.home.join(LINK_FARM_DIR)
    }

    /// Resolves the directory of `id`, trying `home` first and then each
    /// additional (read-only) image store in listed order.
    pub fn dir(&self, id: &str) -> Result<PathBuf> {
        let primary = self.home.join(id);
        if primary.exists() {
            return Ok(primary);
        }
        for store in &self.additional_image_stores {
            let candidate = store.join(DRIVER_NAME).join(id);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::LayerNotFound(id.to_string()))
    }

    /// Like [`Self::dir`] but does not fail if the layer is missing in
    /// either location: returns the primary path regardless.
    pub fn dir_in_home(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.dir(id).is_ok()
    }

    pub fn diff_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("diff"))
    }

    pub fn rotated_diff_path(&self, id: &str, k: u32) -> Result<PathBuf> {
        Ok(self.dir(id)?.join(format!("diff{k}")))
    }

    pub fn work_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("work"))
    }

    pub fn merged_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("merged"))
    }

    pub fn link_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("link"))
    }

    pub fn lower_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("lower"))
    }

    pub fn empty_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.dir(id)?.join("empty"))
    }

    /// Highest existing `diffK` suffix for `id`, or 0 if only `diff` exists.
    pub fn max_rotated_diff(&self, id: &str) -> Result<u32> {
        let dir = self.dir(id)?;
        let mut k = 1;
        while dir.join(format!("diff{k}")).exists() {
            k += 1;
        }
        Ok(k - 1)
    }
}

/// Reads `<id>/link`, trimming trailing whitespace as spec.md §6 requires.
pub fn read_link_file(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim_end().to_string())
}

/// Cached results of one-time capability probes, stored under `runhome`
/// as `<feature>-true` / `<feature>-false` (the latter optionally holding
/// a human-readable reason as its contents).
pub struct CapabilityCache<'a> {
    runhome: &'a Path,
}

impl<'a> CapabilityCache<'a> {
    pub fn new(runhome: &'a Path) -> Self {
        Self { runhome }
    }

    /// Returns `Some(Ok(()))`/`Some(Err(reason))` if a cached result
    /// exists, `None` if the probe has not run yet this boot.
    pub fn get(&self, feature: &str) -> Option<std::result::Result<(), String>> {
        let true_path = self.runhome.join(format!("{feature}-true"));
        let false_path = self.runhome.join(format!("{feature}-false"));
        if true_path.exists() {
            return Some(Ok(()));
        }
        if false_path.exists() {
            let reason = fs::read_to_string(&false_path).unwrap_or_default();
            return Some(Err(reason));
        }
        None
    }

    pub fn set(&self, feature: &str, result: std::result::Result<(), &str>) -> Result<()> {
        fs::create_dir_all(self.runhome)?;
        match result {
            Ok(()) => {
                fs::write(self.runhome.join(format!("{feature}-true")), b"")?;
            }
            Err(reason) => {
                fs::write(self.runhome.join(format!("{feature}-false")), reason)?;
            }
        }
        Ok(())
    }
}

/// Best-effort removal used by cleanup paths where a failure should be
/// logged, not propagated (spec.md §7 "transient I/O ... logged and
/// ignored").
pub fn remove_file_best_effort(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {path:?}: {err}");
        }
    }
}
