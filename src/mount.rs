//! Mounter (spec §4.4).
//!
//! Composes overlay mount data, picks between the kernel overlay
//! filesystem and an external mount helper, falls back to relative
//! paths when the mount data would not fit in one memory page, and
//! coordinates concurrent `get`/`put` through a per-mountpoint
//! refcounter guarded by a per-id lock table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use log::info;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::SysconfVar;

use crate::idmap::IdMap;
use crate::layout::Layout;
use crate::locks::IdLockTable;
use crate::lower::LowerChain;
use crate::{Error, Result};

/// Per-`get` mount options supplied by the caller, plus the one
/// driver-internal bit (`readwrite`) that decides whether this layer's
/// own `diff` is the upperdir or just the topmost lowerdir.
#[derive(Debug, Clone, Default)]
pub struct MountOpts {
    pub readwrite: bool,
    pub extra_options: Vec<String>,
    pub mount_label: Option<String>,
    pub uid_map: Option<IdMap>,
    pub gid_map: Option<IdMap>,
    pub disable_shifting: bool,
}

/// Coordinates mounting/unmounting of layer merged directories.
pub struct Mounter<'a> {
    layout: &'a Layout,
    locks: &'a IdLockTable,
    mount_program: Option<PathBuf>,
    refcounts: Mutex<HashMap<PathBuf, usize>>,
}

impl<'a> Mounter<'a> {
    pub fn new(layout: &'a Layout, locks: &'a IdLockTable, mount_program: Option<PathBuf>) -> Self {
        Self {
            layout,
            locks,
            mount_program,
            refcounts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pre-increment refcount.
    fn incr_refcount(&self, mountpoint: &Path) -> Result<usize> {
        let mut counts = self.refcounts.lock()?;
        let count = counts.entry(mountpoint.to_path_buf()).or_insert(0);
        let before = *count;
        *count += 1;
        Ok(before)
    }

    /// Returns the post-decrement refcount.
    fn decr_refcount(&self, mountpoint: &Path) -> Result<usize> {
        let mut counts = self.refcounts.lock()?;
        let count = counts.entry(mountpoint.to_path_buf()).or_insert(0);
        *count = count.saturating_sub(1);
        Ok(*count)
    }

    pub fn refcount(&self, mountpoint: &Path) -> Result<usize> {
        Ok(*self.refcounts.lock()?.get(mountpoint).unwrap_or(&0))
    }

    /// Mounts (if not already mounted) and returns the merged path.
    pub fn get(&self, id: &str, chain: &LowerChain, opts: &MountOpts) -> Result<PathBuf> {
        let guard = self.locks.lock(id)?;
        let _held = guard.held()?;
        self.get_locked(id, chain, opts)
    }

    /// Same as [`Self::get`], for callers that already hold `id`'s lock
    /// (e.g. [`crate::idmap_remap::IdMapRemapper`], which needs `get`
    /// and `put` to happen under one held guard spanning the remap in
    /// between). Taking the lock again here would deadlock since
    /// [`crate::locks::IdLockTable`]'s mutex is not reentrant.
    pub(crate) fn get_locked(&self, id: &str, chain: &LowerChain, opts: &MountOpts) -> Result<PathBuf> {
        let merged = self.layout.merged_path(id)?;
        let before = self.incr_refcount(&merged)?;
        if before > 0 {
            return Ok(merged);
        }

        match self.do_mount(id, chain, opts, &merged) {
            Ok(()) => Ok(merged),
            Err(err) => {
                self.decr_refcount(&merged)?;
                let _ = self.do_unmount(&merged);
                Err(err)
            }
        }
    }

    /// Unmounts once the refcount drops to zero.
    pub fn put(&self, id: &str) -> Result<()> {
        let guard = self.locks.lock(id)?;
        let _held = guard.held()?;
        self.put_locked(id)
    }

    /// See [`Self::get_locked`].
    pub(crate) fn put_locked(&self, id: &str) -> Result<()> {
        let merged = self.layout.merged_path(id)?;
        let after = self.decr_refcount(&merged)?;
        if after == 0 {
            self.do_unmount(&merged)?;
        }
        Ok(())
    }

    fn do_unmount(&self, merged: &Path) -> Result<()> {
        if !is_mountpoint(merged)? {
            return Ok(());
        }
        info!("overlay: un-mounting {:?}", merged);
        umount2(merged, MntFlags::MNT_DETACH)?;
        Ok(())
    }

    fn do_mount(&self, id: &str, chain: &LowerChain, opts: &MountOpts, merged: &Path) -> Result<()> {
        fs::create_dir_all(merged)?;

        let diff_abs = self.layout.diff_path(id)?;
        let work_abs = self.layout.work_path(id)?;
        let own_short = crate::layout::read_link_file(&self.layout.link_path(id)?)?;
        let diff_rel = format!("l/{own_short}");

        let (lower_abs, upper_abs, work_abs_opt) = if opts.readwrite {
            (chain.absolute.clone(), Some(diff_abs.clone()), Some(work_abs.clone()))
        } else {
            let mut abs = vec![diff_abs.clone()];
            abs.extend(chain.absolute.clone());
            (abs, None, None)
        };

        let (lower_rel, upper_rel, work_rel_opt): (Vec<String>, Option<String>, Option<String>) =
            if opts.readwrite {
                (chain.relative.clone(), Some(format!("{id}/diff")), Some(format!("{id}/work")))
            } else {
                let mut rel = vec![diff_rel];
                rel.extend(chain.relative.clone());
                (rel, None, None)
            };

        let label_abs = compose_label(
            &path_strings(&lower_abs),
            upper_abs.as_deref().map(path_to_str),
            work_abs_opt.as_deref().map(path_to_str),
            opts,
        );

        let page_size = nix::unistd::sysconf(SysconfVar::PAGE_SIZE)?
            .unwrap_or(4096) as usize;

        let (use_relative, label) = if label_abs.len() < page_size {
            (false, label_abs)
        } else {
            let label_rel = compose_label(&lower_rel, upper_rel.as_deref(), work_rel_opt.as_deref(), opts);
            if label_rel.len() >= page_size {
                return Err(Error::MountLabelTooLarge);
            }
            (true, label_rel)
        };

        if let Some(helper) = &self.mount_program {
            return self.mount_via_helper(helper, &label, merged);
        }

        if !use_relative {
            self.mount_kernel_overlay(&label, merged)
        } else {
            self.mount_kernel_overlay_relative(&label, merged)
        }
    }

    fn mount_kernel_overlay(&self, label: &str, target: &Path) -> Result<()> {
        ensure_overlayfs_support()?;
        info!("overlay: mounting {:?}", target);
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(label),
        )?;
        Ok(())
    }

    /// Performs the mount from a forked child whose cwd is `home`, so
    /// that relative lower/upper/work paths resolve correctly. Matches
    /// spec.md §4.4's required relative-path fallback.
    fn mount_kernel_overlay_relative(&self, label: &str, target: &Path) -> Result<()> {
        ensure_overlayfs_support()?;
        let home = self.layout.home().to_path_buf();
        let label = label.to_string();
        let target = target.to_path_buf();

        // SAFETY: the child only chdirs, mounts, and exits; it never
        // returns into the parent's Rust control flow.
        match unsafe { nix::unistd::fork()? } {
            nix::unistd::ForkResult::Child => {
                let code = match std::env::set_current_dir(&home) {
                    Ok(()) => match mount(
                        Some("overlay"),
                        &target,
                        Some("overlay"),
                        MsFlags::empty(),
                        Some(label.as_str()),
                    ) {
                        Ok(()) => 0,
                        Err(_) => 1,
                    },
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None)?;
                match status {
                    nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                    _ => Err(Error::MountError(format!(
                        "relative-path overlay mount helper child {child} failed: {status:?}"
                    ))),
                }
            }
        }
    }

    fn mount_via_helper(&self, helper: &Path, label: &str, target: &Path) -> Result<()> {
        info!("overlay: mounting {:?} via helper {:?}", target, helper);
        let output = Command::new(helper)
            .arg("-o")
            .arg(label)
            .arg(target)
            .current_dir(self.layout.home())
            .output()?;
        if !output.status.success() {
            return Err(Error::HelperFailed {
                program: helper.to_path_buf(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

fn path_strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| path_to_str(p).to_string()).collect()
}

fn path_to_str(p: &Path) -> &str {
    p.to_str().unwrap_or_default()
}

/// Builds the overlay mount-data label: caller options and SELinux
/// label first, then `lowerdir=`/`upperdir=`/`workdir=`, then (for the
/// mount-helper backend) uid/gid mapping unless shifting is disabled.
fn compose_label(lowers: &[String], upper: Option<&str>, work: Option<&str>, opts: &MountOpts) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.extend(opts.extra_options.iter().cloned());
    if let Some(label) = &opts.mount_label {
        parts.push(label.clone());
    }
    parts.push(format!("lowerdir={}", lowers.join(":")));
    if let (Some(u), Some(w)) = (upper, work) {
        parts.push(format!("upperdir={u}"));
        parts.push(format!("workdir={w}"));
    }
    if !opts.disable_shifting {
        if let Some(uid_map) = &opts.uid_map {
            if !uid_map.is_empty() {
                if uid_map.is_single_identity() {
                    parts.push(format!("squash_to_uid={}", uid_map.entries()[0].host_id));
                } else {
                    parts.push(format!("uidmapping={}", uid_map.to_label()));
                }
            }
        }
        if let Some(gid_map) = &opts.gid_map {
            if !gid_map.is_empty() {
                if gid_map.is_single_identity() {
                    parts.push(format!("squash_to_gid={}", gid_map.entries()[0].host_id));
                } else {
                    parts.push(format!("gidmapping={}", gid_map.to_label()));
                }
            }
        }
    }
    parts.join(",")
}

fn ensure_overlayfs_support() -> Result<()> {
    let content = fs::read("/proc/filesystems")?;
    let content = String::from_utf8_lossy(&content);
    for line in content.lines() {
        let mut parts = line.splitn(2, '\t');
        if parts.nth(1) == Some("overlay") {
            return Ok(());
        }
    }
    Command::new("modprobe")
        .arg("overlay")
        .status()
        .map_err(|_| Error::OverlayFsUnavailable)?;
    Ok(())
}

/// Checks if a path is a mountpoint with the given filesystem type.
pub fn is_mounted(mountpoint: &Path, fs_type: &str) -> Result<bool> {
    let mountpoint = std::path::absolute(mountpoint)?;
    let fs_type = std::ffi::OsString::from(fs_type);
    let mountinfo_content: Vec<u8> = fs::read("/proc/self/mountinfo")?;
    let parser = libmount::mountinfo::Parser::new(&mountinfo_content);
    for mount in parser {
        let mount = mount?;
        if mount.mount_point == mountpoint && mount.fstype == fs_type {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_mountpoint(path: &Path) -> Result<bool> {
    is_mounted(path, "overlay")
}
