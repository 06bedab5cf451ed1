//! Diff Engine (spec §4.6).
//!
//! Reads `diff/` directly ("native" diff) when the target layer's
//! `parent` is its direct ancestor and the kernel capability probe
//! passed; otherwise delegates to an injected naive (mount-and-compare)
//! collaborator, the same way [`crate::quota::QuotaCtl`] is injected
//! for per-layer quotas.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::warn;

use crate::layout::Layout;
use crate::lower::LowerResolver;
use crate::options::ForceMask;
use crate::{Error, Result};

/// Selects how deletions are represented in a `Diff`/`ApplyDiff` tar
/// stream. The helper backend implies `Aufs`: an unprivileged mount
/// helper cannot create character-device whiteout nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutDialect {
    CharDevice,
    Aufs,
}

impl WhiteoutDialect {
    pub fn for_driver(uses_mount_helper: bool) -> Self {
        if uses_mount_helper {
            WhiteoutDialect::Aufs
        } else {
            WhiteoutDialect::CharDevice
        }
    }
}

const AUFS_WHITEOUT_PREFIX: &str = ".wh.";

/// One entry of `Changes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

/// An injectable mount-and-compare diff backend, used whenever the
/// native fast path does not apply.
pub trait NaiveDiffEngine: Send + Sync {
    fn diff(&self, upper_tree: &Path, lower_tree: &Path) -> Result<Vec<u8>>;
    fn diff_size(&self, upper_tree: &Path, lower_tree: &Path) -> Result<u64>;
    fn changes(&self, upper_tree: &Path, lower_tree: &Path) -> Result<Vec<Change>>;
}

/// The default naive backend: none configured. Matches
/// [`crate::quota::NullQuotaCtl`]'s role for quotas.
pub struct NullNaiveDiffEngine;

impl NaiveDiffEngine for NullNaiveDiffEngine {
    fn diff(&self, _upper_tree: &Path, _lower_tree: &Path) -> Result<Vec<u8>> {
        Err(Error::NaiveDiffUnavailable)
    }
    fn diff_size(&self, _upper_tree: &Path, _lower_tree: &Path) -> Result<u64> {
        Err(Error::NaiveDiffUnavailable)
    }
    fn changes(&self, _upper_tree: &Path, _lower_tree: &Path) -> Result<Vec<Change>> {
        Err(Error::NaiveDiffUnavailable)
    }
}

pub struct DiffEngine<'a> {
    layout: &'a Layout,
    whiteout: WhiteoutDialect,
    native_diff_supported: bool,
    naive: &'a dyn NaiveDiffEngine,
}

impl<'a> DiffEngine<'a> {
    pub fn new(
        layout: &'a Layout,
        whiteout: WhiteoutDialect,
        native_diff_supported: bool,
        naive: &'a dyn NaiveDiffEngine,
    ) -> Self {
        Self {
            layout,
            whiteout,
            native_diff_supported,
            naive,
        }
    }

    /// True iff `parent == ""` and `id` has no `lower` entries, or the
    /// directory containing `id`'s uppermost lower equals `dir(parent)`.
    pub fn is_parent(&self, id: &str, parent: &str) -> Result<bool> {
        let lower_path = self.layout.lower_path(id)?;
        if !lower_path.exists() {
            return Ok(parent.is_empty());
        }
        let content = fs::read_to_string(&lower_path)?;
        let first_entry = match content.split(':').find(|e| !e.is_empty()) {
            Some(e) => e,
            None => return Ok(parent.is_empty()),
        };
        if parent.is_empty() {
            return Ok(false);
        }
        let resolver = LowerResolver::new(self.layout);
        let abs = resolver.resolve_single(first_entry)?;
        // `abs` is the `l/<short>` symlink itself, not its target, so
        // its parent is always the link farm directory; resolve it to
        // find the layer directory it actually names.
        let resolved = fs::canonicalize(&abs)?;
        let parent_dir = resolved
            .parent()
            .ok_or_else(|| Error::MountError(format!("malformed lower entry {first_entry:?}")))?;
        Ok(parent_dir == fs::canonicalize(self.layout.dir(parent)?)?)
    }

    fn use_native(&self, id: &str, parent: &str) -> Result<bool> {
        Ok(self.native_diff_supported && self.is_parent(id, parent)?)
    }

    /// Archives `diff/` (whiteouts in the selected dialect), uncompressed.
    pub fn diff(&self, id: &str, parent: &str) -> Result<Vec<u8>> {
        if self.use_native(id, parent)? {
            self.native_diff(id)
        } else {
            let upper = self.layout.diff_path(id)?;
            let lower = self.native_parent_diff_or_empty(id, parent)?;
            self.naive.diff(&upper, &lower)
        }
    }

    pub fn diff_size(&self, id: &str, parent: &str) -> Result<u64> {
        if self.use_native(id, parent)? {
            Ok(crate::quota::walk_usage(&self.layout.diff_path(id)?)?.size_bytes)
        } else {
            let upper = self.layout.diff_path(id)?;
            let lower = self.native_parent_diff_or_empty(id, parent)?;
            self.naive.diff_size(&upper, &lower)
        }
    }

    pub fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        if self.use_native(id, parent)? {
            let lowers = self.parent_lowers(parent)?;
            Ok(self
                .native_entries(&self.layout.diff_path(id)?)?
                .into_iter()
                .map(|entry| match entry.kind {
                    EntryKind::Whiteout => Change::Deleted(entry.rel_path),
                    EntryKind::New | EntryKind::Symlink => {
                        if exists_in_lowers(&lowers, &entry.rel_path) {
                            Change::Modified(entry.rel_path)
                        } else {
                            Change::Added(entry.rel_path)
                        }
                    }
                    _ => Change::Modified(entry.rel_path),
                })
                .collect())
        } else {
            let upper = self.layout.diff_path(id)?;
            let lower = self.native_parent_diff_or_empty(id, parent)?;
            self.naive.changes(&upper, &lower)
        }
    }

    /// The directories a plain-file or symlink entry must be checked
    /// against to tell `Added` from `Modified`: `parent`'s full resolved
    /// lower chain (its own diff plus everything below it), or none for
    /// a parentless layer.
    fn parent_lowers(&self, parent: &str) -> Result<Vec<PathBuf>> {
        if parent.is_empty() {
            return Ok(Vec::new());
        }
        let mut dirs = vec![self.layout.diff_path(parent)?];
        dirs.extend(LowerResolver::new(self.layout).resolve(parent)?.absolute);
        Ok(dirs)
    }

    fn native_parent_diff_or_empty(&self, id: &str, parent: &str) -> Result<PathBuf> {
        if parent.is_empty() {
            self.layout.empty_path(id)
        } else {
            self.layout.diff_path(parent)
        }
    }

    fn native_diff(&self, id: &str) -> Result<Vec<u8>> {
        let upper = self.layout.diff_path(id)?;
        let entries = self.native_entries(&upper)?;

        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            for entry in &entries {
                match entry.kind {
                    EntryKind::Whiteout => self.append_whiteout(&mut builder, &entry.rel_path)?,
                    EntryKind::OverrideDir => {
                        self.append_whiteout(&mut builder, &entry.rel_path)?;
                        self.append_real(&mut builder, &upper, &entry.rel_path)?;
                    }
                    _ => self.append_real(&mut builder, &upper, &entry.rel_path)?,
                }
            }
            builder.finish()?;
        }
        Ok(buf)
    }

    fn append_whiteout<W: std::io::Write>(&self, builder: &mut tar::Builder<W>, rel_path: &Path) -> Result<()> {
        match self.whiteout {
            WhiteoutDialect::Aufs => {
                let name = whiteout_path(rel_path);
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o000);
                header.set_cksum();
                builder.append_data(&mut header, name, std::io::empty())?;
            }
            WhiteoutDialect::CharDevice => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Char);
                header.set_device_major(0)?;
                header.set_device_minor(0)?;
                header.set_size(0);
                header.set_mode(0o000);
                header.set_cksum();
                builder.append_data(&mut header, rel_path, std::io::empty())?;
            }
        }
        Ok(())
    }

    fn append_real<W: std::io::Write>(
        &self,
        builder: &mut tar::Builder<W>,
        upper: &Path,
        rel_path: &Path,
    ) -> Result<()> {
        let full = upper.join(rel_path);
        let meta = fs::symlink_metadata(&full)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&full)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, rel_path, &target)?;
        } else if meta.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(meta.permissions().mode());
            header.set_cksum();
            builder.append_data(&mut header, rel_path, std::io::empty())?;
        } else {
            builder.append_path_with_name(&full, rel_path)?;
        }
        Ok(())
    }

    /// Walks `diff/` classifying each entry the way native overlay diff
    /// requires: symlinks moved verbatim, new/modified/override dirs
    /// distinguished via `trusted.overlay.*` xattrs, plain files, and
    /// whiteout markers (character-device nodes with a zero rdev).
    fn native_entries(&self, upper: &Path) -> Result<Vec<DiffEntry>> {
        let mut entries = Vec::new();
        let mut processed_dirs: Vec<PathBuf> = Vec::new();

        for entry in walkdir::WalkDir::new(upper).into_iter().skip(1) {
            let path = entry?.path().to_path_buf();
            let rel_path = path.strip_prefix(upper)?.to_path_buf();

            if processed_dirs.iter().any(|prefix| rel_path.strip_prefix(prefix).is_ok()) {
                continue;
            }

            let meta = fs::symlink_metadata(&path)?;
            let file_type = meta.file_type();

            if file_type.is_symlink() {
                entries.push(DiffEntry { rel_path, kind: EntryKind::Symlink });
            } else if meta.is_dir() {
                if xattr::get(&path, "trusted.overlay.metacopy")?.is_some() {
                    return Err(Error::MetaCopyUnsupported);
                }
                if let Some(text) = xattr::get(&path, "trusted.overlay.opaque")? {
                    if text == b"y" {
                        entries.push(DiffEntry { rel_path: rel_path.clone(), kind: EntryKind::OverrideDir });
                        processed_dirs.push(rel_path);
                        continue;
                    }
                }
                entries.push(DiffEntry { rel_path, kind: EntryKind::ModifiedDir });
            } else if file_type.is_char_device() && meta.rdev() == 0 {
                entries.push(DiffEntry { rel_path, kind: EntryKind::Whiteout });
            } else {
                entries.push(DiffEntry { rel_path, kind: EntryKind::New });
            }
        }
        Ok(entries)
    }

    /// Extracts a tar stream into `diff/`, honoring `ignore_chown_errors`
    /// and `force_mask`, translating whiteout markers in the dialect
    /// selected for this driver back into on-disk deletions.
    pub fn apply_diff<R: Read>(
        &self,
        id: &str,
        reader: R,
        ignore_chown_errors: bool,
        force_mask: Option<ForceMask>,
    ) -> Result<()> {
        let upper = self.layout.diff_path(id)?;
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel_path = entry.path()?.to_path_buf();

            if let Some(name) = rel_path.file_name().and_then(OsStr::to_str) {
                if let Some(stripped) = name.strip_prefix(AUFS_WHITEOUT_PREFIX) {
                    let target = rel_path.with_file_name(stripped);
                    self.remove_whiteout_target(&upper, &target)?;
                    continue;
                }
            }

            let dest = upper.join(&rel_path);
            if entry.header().entry_type() == tar::EntryType::Char
                && entry.header().device_major().ok().flatten() == Some(0)
                && entry.header().device_minor().ok().flatten() == Some(0)
            {
                self.remove_whiteout_target(&upper, &rel_path)?;
                continue;
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            match entry.unpack(&dest) {
                Ok(_) => {}
                Err(err) if is_chown_error(&err) && ignore_chown_errors => {
                    warn!("apply_diff: ignoring chown error for {dest:?}: {err}");
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(mask) = force_mask {
                let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mask.mode()));
            }
        }
        Ok(())
    }

    fn remove_whiteout_target(&self, upper: &Path, rel_path: &Path) -> Result<()> {
        let target = upper.join(rel_path);
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
            Ok(_) => fs::remove_file(&target)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write_whiteout_marker(&target)
    }

    fn write_whiteout_marker(&self, target: &Path) -> Result<()> {
        match self.whiteout {
            WhiteoutDialect::Aufs => {
                let marker = whiteout_path(target);
                fs::write(&marker, b"")?;
            }
            WhiteoutDialect::CharDevice => {
                use nix::sys::stat::{mknod, Mode, SFlag};
                mknod(target, SFlag::S_IFCHR, Mode::empty(), 0)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Symlink,
    New,
    ModifiedDir,
    OverrideDir,
    Whiteout,
}

struct DiffEntry {
    rel_path: PathBuf,
    kind: EntryKind,
}

fn whiteout_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| {
        let mut s = std::ffi::OsString::from(AUFS_WHITEOUT_PREFIX);
        s.push(n);
        s
    });
    match (path.parent(), name) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent.join(name),
        (_, Some(name)) => PathBuf::from(name),
        _ => path.to_path_buf(),
    }
}

fn is_chown_error(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
}

fn exists_in_lowers(lowers: &[PathBuf], rel_path: &Path) -> bool {
    lowers.iter().any(|dir| dir.join(rel_path).symlink_metadata().is_ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::linkfarm::LinkFarm;
    use tempfile::TempDir;

    fn new_layout() -> (TempDir, Layout) {
        let dir = TempDir::with_prefix("layerstore-").unwrap();
        let home = dir.path().join("home");
        let run = dir.path().join("run");
        fs::create_dir_all(&home).unwrap();
        (dir, Layout::new(home, run, vec![]))
    }

    fn make_layer(layout: &Layout, id: &str) {
        fs::create_dir_all(layout.home().join(id).join("diff")).unwrap();
        fs::create_dir_all(layout.home().join(id).join("work")).unwrap();
        fs::create_dir_all(layout.home().join(id).join("merged")).unwrap();
        LinkFarm::new(layout).assign(id).unwrap();
    }

    #[test]
    fn test_is_parent_for_parentless_layer() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();
        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        assert!(engine.is_parent("base", "").unwrap());
        assert!(!engine.is_parent("base", "something").unwrap());
    }

    #[test]
    fn test_is_parent_detects_direct_parent() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        make_layer(&layout, "child");
        let base_short = crate::layout::read_link_file(&layout.link_path("base").unwrap()).unwrap();
        fs::write(layout.lower_path("child").unwrap(), format!("l/{base_short}")).unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        assert!(engine.is_parent("child", "base").unwrap());
        assert!(!engine.is_parent("child", "").unwrap());
    }

    #[test]
    fn test_native_diff_archives_new_file_and_dir() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();

        fs::create_dir_all(layout.diff_path("base").unwrap().join("sub")).unwrap();
        fs::write(layout.diff_path("base").unwrap().join("sub/foo.txt"), b"hello").unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        let bytes = engine.diff("base", "").unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains("foo.txt")));
    }

    #[test]
    fn test_changes_reports_added_entries() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();
        fs::write(layout.diff_path("base").unwrap().join("foo.txt"), b"hi").unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        let changes = engine.changes("base", "").unwrap();
        assert!(changes.iter().any(|c| matches!(c, Change::Added(p) if p.ends_with("foo.txt"))));
    }

    #[test]
    fn test_changes_distinguishes_modified_from_added_against_lower() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();
        fs::write(layout.diff_path("base").unwrap().join("inherited.txt"), b"base").unwrap();

        make_layer(&layout, "child");
        let base_short = crate::layout::read_link_file(&layout.link_path("base").unwrap()).unwrap();
        fs::write(layout.lower_path("child").unwrap(), format!("l/{base_short}")).unwrap();

        // Overwrites a file that already exists in the lower ("base") and
        // creates a brand new one.
        fs::write(layout.diff_path("child").unwrap().join("inherited.txt"), b"child").unwrap();
        fs::write(layout.diff_path("child").unwrap().join("new.txt"), b"new").unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        let changes = engine.changes("child", "base").unwrap();

        assert!(changes
            .iter()
            .any(|c| matches!(c, Change::Modified(p) if p.ends_with("inherited.txt"))));
        assert!(changes.iter().any(|c| matches!(c, Change::Added(p) if p.ends_with("new.txt"))));
    }

    #[test]
    fn test_apply_diff_round_trips_plain_file() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();
        fs::write(layout.diff_path("base").unwrap().join("foo.txt"), b"hello world").unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        let bytes = engine.diff("base", "").unwrap();

        make_layer(&layout, "target");
        engine.apply_diff("target", &bytes[..], false, None).unwrap();

        let mut content = String::new();
        fs::File::open(layout.diff_path("target").unwrap().join("foo.txt"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello world");
    }

    #[test]
    fn test_apply_diff_aufs_whiteout_removes_target() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "target");
        fs::write(layout.diff_path("target").unwrap().join("foo.txt"), b"old").unwrap();

        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, ".wh.foo.txt", std::io::empty()).unwrap();
            builder.finish().unwrap();
        }

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, true, &naive);
        engine.apply_diff("target", &buf[..], false, None).unwrap();

        assert!(!layout.diff_path("target").unwrap().join("foo.txt").exists());
        assert!(layout.diff_path("target").unwrap().join(".wh.foo.txt").exists());
    }

    #[test]
    fn test_diff_without_native_support_delegates_to_naive() {
        let (_dir, layout) = new_layout();
        make_layer(&layout, "base");
        fs::create_dir_all(layout.empty_path("base").unwrap()).unwrap();

        let naive = NullNaiveDiffEngine;
        let engine = DiffEngine::new(&layout, WhiteoutDialect::Aufs, false, &naive);
        assert!(matches!(engine.diff("base", ""), Err(Error::NaiveDiffUnavailable)));
    }
}
