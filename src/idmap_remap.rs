//! ID-Map Remapper (spec §4.7): `UpdateLayerIDMap`.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::fcntl::AtFlags;
use nix::unistd::{fchownat, Gid, Uid};

use crate::idmap::IdMap;
use crate::layout::Layout;
use crate::locks::IdLockTable;
use crate::mount::{MountOpts, Mounter};
use crate::options::ForceMask;
use crate::Result;

/// Default `diff/` mode when there is no forced mask and no prior
/// `diff1` to inherit (spec §4.4's permission-priority rule).
const DEFAULT_UPPER_MODE: u32 = 0o555;

/// Walks a mounted tree and rewrites ownership from one id mapping to
/// another. A real deployment might offload this to an external
/// chown-by-map helper for speed; the walking implementation here is
/// the driver's own default.
pub trait ChownRemapper: Send + Sync {
    fn remap_tree(&self, root: &Path, from: &IdMap, to: &IdMap) -> Result<()>;
}

pub struct WalkingChownRemapper;

impl ChownRemapper for WalkingChownRemapper {
    fn remap_tree(&self, root: &Path, from: &IdMap, to: &IdMap) -> Result<()> {
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry?;
            let meta = entry.metadata()?;
            let container_uid = inverse_shift(from, meta.uid());
            let container_gid = inverse_shift(from, meta.gid());
            let new_uid = to.shift(container_uid);
            let new_gid = to.shift(container_gid);
            fchownat(
                None,
                entry.path(),
                Some(Uid::from_raw(new_uid)),
                Some(Gid::from_raw(new_gid)),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )?;
        }
        Ok(())
    }
}

/// [`IdMap::shift`] only maps container id to host id; remapping needs
/// the inverse to recover the container-side id an on-disk host id
/// currently represents.
fn inverse_shift(map: &IdMap, host_id: u32) -> u32 {
    for entry in map.entries() {
        if host_id >= entry.host_id && host_id < entry.host_id + entry.size {
            return entry.container_id + (host_id - entry.host_id);
        }
    }
    host_id
}

pub struct IdMapRemapper<'a> {
    layout: &'a Layout,
    locks: &'a IdLockTable,
    mounter: &'a Mounter<'a>,
    chown: &'a dyn ChownRemapper,
    force_mask: Option<ForceMask>,
}

impl<'a> IdMapRemapper<'a> {
    pub fn new(
        layout: &'a Layout,
        locks: &'a IdLockTable,
        mounter: &'a Mounter<'a>,
        chown: &'a dyn ChownRemapper,
        force_mask: Option<ForceMask>,
    ) -> Self {
        Self { layout, locks, mounter, chown, force_mask }
    }

    pub fn update_layer_id_map(
        &self,
        id: &str,
        to_container: &IdMap,
        to_host: &IdMap,
        mount_label: Option<String>,
    ) -> Result<()> {
        let guard = self.locks.lock(id)?;
        let _held = guard.held()?;

        let chain = crate::lower::LowerResolver::new(self.layout).resolve(id)?;
        let opts = MountOpts {
            readwrite: true,
            mount_label,
            disable_shifting: true,
            ..Default::default()
        };
        let merged = self.mounter.get_locked(id, &chain, &opts)?;

        let remap_result = self.chown.remap_tree(&merged, to_container, to_host);
        let put_result = self.mounter.put_locked(id);
        remap_result?;
        put_result?;

        self.rotate_diffs(id)?;
        Ok(())
    }

    /// Renames `diffK -> diffK+1` (and finally plain `diff -> diff1`) in
    /// descending order so a crash mid-loop never leaves two generations
    /// sharing one name.
    fn rotate_diffs(&self, id: &str) -> Result<()> {
        let max_k = self.layout.max_rotated_diff(id)?;
        for k in (0..=max_k).rev() {
            let from = if k == 0 {
                self.layout.diff_path(id)?
            } else {
                self.layout.rotated_diff_path(id, k)?
            };
            let to = self.layout.rotated_diff_path(id, k + 1)?;
            fs::rename(&from, &to)?;
        }

        let work = self.layout.work_path(id)?;
        if work.exists() {
            fs::remove_dir_all(&work)?;
        }
        fs::create_dir_all(&work)?;

        let diff = self.layout.diff_path(id)?;
        let mode = match self.force_mask {
            Some(mask) => mask.mode(),
            None => fs::metadata(self.layout.rotated_diff_path(id, 1)?)
                .map(|m| m.permissions().mode())
                .unwrap_or(DEFAULT_UPPER_MODE),
        };
        fs::create_dir_all(&diff)?;
        fs::set_permissions(&diff, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::idmap::IdMapEntry;
    use crate::linkfarm::LinkFarm;
    use tempfile::TempDir;

    fn new_layout() -> (TempDir, Layout) {
        let dir = TempDir::with_prefix("layerstore-").unwrap();
        let home = dir.path().join("home");
        let run = dir.path().join("run");
        std::fs::create_dir_all(&home).unwrap();
        (dir, Layout::new(home, run, vec![]))
    }

    fn make_layer(layout: &Layout, id: &str) {
        std::fs::create_dir_all(layout.home().join(id).join("diff")).unwrap();
        std::fs::create_dir_all(layout.home().join(id).join("work")).unwrap();
        std::fs::create_dir_all(layout.home().join(id).join("merged")).unwrap();
        LinkFarm::new(layout).assign(id).unwrap();
    }

    #[test]
    fn test_inverse_shift_recovers_container_id() {
        let map = IdMap::new(vec![IdMapEntry { container_id: 0, host_id: 100000, size: 65536 }]);
        assert_eq!(inverse_shift(&map, 100042), 42);
        assert_eq!(inverse_shift(&map, 5), 5);
    }

    #[test]
    fn test_rotate_diffs_first_rotation() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        std::fs::write(layout.diff_path("base").unwrap().join("foo"), b"x").unwrap();

        let locks = IdLockTable::new();
        let mounter = Mounter::new(&layout, &locks, None);
        let chown = WalkingChownRemapper;
        let remapper = IdMapRemapper::new(&layout, &locks, &mounter, &chown, None);
        remapper.rotate_diffs("base").unwrap();

        assert!(layout.rotated_diff_path("base", 1).unwrap().join("foo").exists());
        assert!(layout.diff_path("base").unwrap().exists());
        assert_eq!(std::fs::read_dir(layout.diff_path("base").unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn test_rotate_diffs_is_contiguous_across_multiple_calls() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        std::fs::write(layout.diff_path("base").unwrap().join("gen0"), b"x").unwrap();

        let locks = IdLockTable::new();
        let mounter = Mounter::new(&layout, &locks, None);
        let chown = WalkingChownRemapper;
        let remapper = IdMapRemapper::new(&layout, &locks, &mounter, &chown, None);

        remapper.rotate_diffs("base").unwrap();
        std::fs::write(layout.diff_path("base").unwrap().join("gen1"), b"y").unwrap();
        remapper.rotate_diffs("base").unwrap();

        assert!(layout.rotated_diff_path("base", 1).unwrap().join("gen1").exists());
        assert!(layout.rotated_diff_path("base", 2).unwrap().join("gen0").exists());
    }
}
