//! Layer Lifecycle (spec §4.5): `Create`/`CreateReadWrite`/
//! `CreateFromTemplate`/`Remove`/`Exists`/`Metadata`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use log::warn;

use crate::layout::Layout;
use crate::linkfarm::LinkFarm;
use crate::locks::IdLockTable;
use crate::lower::LowerResolver;
use crate::options::ForceMask;
use crate::quota::QuotaCtl;
use crate::{Error, Result};

/// Default `diff/` mode when there is no forced mask and no existing
/// mode to inherit (spec §4.4's permission-priority rule).
const DEFAULT_UPPER_MODE: u32 = 0o555;

/// Options accepted by `Create`/`CreateReadWrite`, independent of the
/// driver-wide [`crate::options::DriverOptions`].
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub size: Option<u64>,
}

/// The `Metadata(id)` result: directories the embedder mounts or reads
/// directly without going through [`crate::mount::Mounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub lower_dir: Option<String>,
}

pub struct Lifecycle<'a> {
    layout: &'a Layout,
    locks: &'a IdLockTable,
    quota: &'a dyn QuotaCtl,
    force_mask: Option<ForceMask>,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        layout: &'a Layout,
        locks: &'a IdLockTable,
        quota: &'a dyn QuotaCtl,
        force_mask: Option<ForceMask>,
    ) -> Self {
        Self { layout, locks, quota, force_mask }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.exists(id)
    }

    pub fn create(&self, id: &str, parent: &str) -> Result<()> {
        self.create_inner(id, parent, None)
    }

    pub fn create_read_write(&self, id: &str, parent: &str, opts: &CreateOpts) -> Result<()> {
        if let Some(size) = opts.size {
            if size > 0 {
                let dir = self.layout.dir_in_home(id);
                if !self.quota.supported(self.layout.home())? {
                    return Err(Error::QuotaUnsupported);
                }
                self.create_inner(id, parent, Some(size))?;
                if let Err(err) = self.quota.set_quota(&dir.join("diff"), size) {
                    let _ = self.remove_unlocked(id);
                    return Err(err);
                }
                return Ok(());
            }
        }
        self.create_inner(id, parent, None)
    }

    /// Delegates to [`Self::create`] or [`Self::create_read_write`]
    /// depending on `read_write`; template content population (if any)
    /// is the embedder's responsibility once the layer directories
    /// exist.
    pub fn create_from_template(
        &self,
        id: &str,
        parent: &str,
        _template_id: &str,
        read_write: bool,
        opts: &CreateOpts,
    ) -> Result<()> {
        if read_write {
            self.create_read_write(id, parent, opts)
        } else {
            self.create(id, parent)
        }
    }

    fn create_inner(&self, id: &str, parent: &str, _size: Option<u64>) -> Result<()> {
        if self.layout.exists(id) {
            return Err(Error::LayerExists(id.to_string()));
        }
        let dir = self.layout.dir_in_home(id);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;

        if let Err(err) = self.populate(id, &dir, parent) {
            let _ = fs::remove_dir_all(&dir);
            return Err(err);
        }
        Ok(())
    }

    fn populate(&self, id: &str, dir: &std::path::Path, parent: &str) -> Result<()> {
        let diff_dir = dir.join("diff");
        fs::create_dir_all(&diff_dir)?;
        fs::create_dir_all(dir.join("work"))?;
        fs::create_dir_all(dir.join("merged"))?;

        if parent.is_empty() {
            let mode = self.force_mask.map(|m| m.mode()).unwrap_or(DEFAULT_UPPER_MODE);
            fs::set_permissions(&diff_dir, fs::Permissions::from_mode(mode & 0o7777))?;
            fs::create_dir_all(dir.join("empty"))?;
        } else {
            if !self.layout.exists(parent) {
                return Err(Error::ParentNotFound(parent.to_string()));
            }
            let mode = match self.force_mask {
                Some(mask) => mask.mode(),
                None => {
                    let parent_diff = self.layout.diff_path(parent)?;
                    fs::metadata(&parent_diff)?.permissions().mode()
                }
            };
            fs::set_permissions(&diff_dir, fs::Permissions::from_mode(mode & 0o7777))?;

            let parent_short = crate::layout::read_link_file(&self.layout.link_path(parent)?)?;
            let parent_lower_path = self.layout.lower_path(parent)?;
            let parent_lower = if parent_lower_path.exists() {
                fs::read_to_string(&parent_lower_path)?
            } else {
                String::new()
            };

            let mut lower = format!("l/{parent_short}");
            if !parent_lower.is_empty() {
                lower.push(':');
                lower.push_str(&parent_lower);
            }
            write_lower_file(&self.layout.lower_path(id)?, &lower)?;
        }

        LinkFarm::new(self.layout).assign(id)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let guard = self.locks.lock(id)?;
        let _held = guard.held()?;
        self.remove_unlocked(id)
    }

    fn remove_unlocked(&self, id: &str) -> Result<()> {
        LinkFarm::new(self.layout).remove(id);
        let dir = self.layout.dir_in_home(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!("failed to remove layer directory {dir:?}: {err}");
                Err(err.into())
            }
        }
    }

    pub fn metadata(&self, id: &str) -> Result<LayerMetadata> {
        let chain = LowerResolver::new(self.layout).resolve(id)?;
        let lower_dir = if chain.is_empty() {
            None
        } else {
            Some(chain.relative.join(":"))
        };
        Ok(LayerMetadata {
            work_dir: self.layout.work_path(id)?,
            merged_dir: self.layout.merged_path(id)?,
            upper_dir: self.layout.diff_path(id)?,
            lower_dir,
        })
    }
}

/// Writes the `lower` file per spec.md §6: mode `0666`, no terminator.
fn write_lower_file(path: &std::path::Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;
    Ok(())
}
