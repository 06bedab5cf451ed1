//! Link-Farm Manager (spec §4.2).
//!
//! Maintains `home/l/<short-id> -> ../<layer-id>/diff` symlinks, which
//! let the mounter build overlay mount data out of short paths instead
//! of full layer ids, keeping the mount data within one memory page at
//! greater chain depths.

use std::fs;
use std::os::unix::fs::symlink;

use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::layout::{read_link_file, Layout, LINK_FARM_DIR};
use crate::{Error, Result};

/// Length of a short link id. Chosen, per spec.md §3, so that the
/// overlay mount data for the maximum chain depth plus surrounding
/// metadata fits in one memory page.
pub const SHORT_ID_LEN: usize = 26;

pub struct LinkFarm<'a> {
    layout: &'a Layout,
}

impl<'a> LinkFarm<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    fn farm_dir(&self) -> std::path::PathBuf {
        self.layout.link_farm_dir()
    }

    /// Generates a fresh short link id, creates `l/<short>`, and writes
    /// `<id>/link`. Returns the short id.
    pub fn assign(&self, id: &str) -> Result<String> {
        fs::create_dir_all(self.farm_dir())?;
        let short: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SHORT_ID_LEN)
            .map(char::from)
            .collect();
        let link_path = self.farm_dir().join(&short);
        let target = format!("../{id}/diff");
        symlink(&target, &link_path)?;
        fs::write(self.layout.link_path(id)?, &short)?;
        Ok(short)
    }

    /// Scans `home` and recreates any missing `l/<short>` symlinks,
    /// tolerating ones that already exist. Fails only on non-ENOENT
    /// stat errors, per spec.md §4.2.
    pub fn rebuild(&self) -> Result<()> {
        info!("link farm: rebuilding under {:?}", self.layout.home());
        fs::create_dir_all(self.farm_dir())?;
        for entry in fs::read_dir(self.layout.home())? {
            let entry = entry?;
            if entry.file_name() == LINK_FARM_DIR {
                continue;
            }
            let id_dir = entry.path();
            if !id_dir.is_dir() {
                continue;
            }
            let link_file = id_dir.join("link");
            let short = match read_link_file(&link_file) {
                Ok(short) => short,
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let link_path = self.farm_dir().join(&short);
            match fs::symlink_metadata(&link_path) {
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let id = entry.file_name();
                    let id = id.to_string_lossy();
                    let target = format!("../{id}/diff");
                    symlink(&target, &link_path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Removes the farm entry for `id` (found through its `link` file).
    /// Best-effort: transient I/O failures are logged, not propagated,
    /// matching spec.md §7's idempotent-cleanup policy.
    pub fn remove(&self, id: &str) {
        let link_file = match self.layout.link_path(id) {
            Ok(p) => p,
            Err(_) => return,
        };
        let short = match read_link_file(&link_file) {
            Ok(short) => short,
            Err(_) => return,
        };
        let link_path = self.farm_dir().join(&short);
        if let Err(err) = fs::remove_file(&link_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("link farm: failed to remove {link_path:?}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::Layout;
    use std::fs;
    use tempfile::TempDir;

    fn new_layout() -> (TempDir, Layout) {
        let dir = TempDir::with_prefix("layerstore-").unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let layout = Layout::new(home, dir.path().join("run"), vec![]);
        (dir, layout)
    }

    #[test]
    fn test_assign_creates_symlink() {
        let (_dir, layout) = new_layout();
        fs::create_dir_all(layout.home().join("abc/diff")).unwrap();
        let farm = LinkFarm::new(&layout);
        let short = farm.assign("abc").unwrap();
        assert_eq!(short.len(), SHORT_ID_LEN);

        let link_path = layout.link_farm_dir().join(&short);
        let resolved = fs::canonicalize(&link_path).unwrap();
        assert_eq!(resolved, fs::canonicalize(layout.diff_path("abc").unwrap()).unwrap());

        let recorded = read_link_file(&layout.link_path("abc").unwrap()).unwrap();
        assert_eq!(recorded, short);
    }

    #[test]
    fn test_rebuild_recreates_missing_links() {
        let (_dir, layout) = new_layout();
        fs::create_dir_all(layout.home().join("abc/diff")).unwrap();
        let farm = LinkFarm::new(&layout);
        let short = farm.assign("abc").unwrap();
        fs::remove_file(layout.link_farm_dir().join(&short)).unwrap();
        assert!(!layout.link_farm_dir().join(&short).exists());

        farm.rebuild().unwrap();
        assert!(layout.link_farm_dir().join(&short).exists());
    }

    #[test]
    fn test_rebuild_tolerates_existing_links() {
        let (_dir, layout) = new_layout();
        fs::create_dir_all(layout.home().join("abc/diff")).unwrap();
        let farm = LinkFarm::new(&layout);
        farm.assign("abc").unwrap();
        // should not error even though nothing is missing
        farm.rebuild().unwrap();
    }
}
