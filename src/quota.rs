//! Project-quota enforcement (spec §1: "interface only"). The core
//! driver calls through this trait from [`crate::lifecycle`]; a real
//! backend (XFS project quotas, etc.) lives outside this crate.

use std::path::Path;

use crate::Result;

/// A per-directory disk-usage quota controller.
pub trait QuotaCtl: Send + Sync {
    /// Returns whether the filesystem backing `path` supports project
    /// quotas at all.
    fn supported(&self, path: &Path) -> Result<bool>;

    /// Applies a quota of `size` bytes to `path`. Only called after
    /// [`QuotaCtl::supported`] returned `true`.
    fn set_quota(&self, path: &Path, size: u64) -> Result<()>;

    /// Reports current usage for `path`.
    fn usage(&self, path: &Path) -> Result<DiskUsage>;
}

/// Bytes and inodes used under a directory, as returned by
/// `ReadWriteDiskUsage` (spec.md §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub size_bytes: u64,
    pub inode_count: u64,
}

/// A quota controller that never supports quotas. This is what the
/// crate's own tests use, and what an embedder gets by default when it
/// configures no quota backend — matching spec.md §7's rule that a
/// nonzero requested size with an unsupported backing filesystem is a
/// fatal create-time error, not a silent no-op.
pub struct NullQuotaCtl;

impl QuotaCtl for NullQuotaCtl {
    fn supported(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    fn set_quota(&self, _path: &Path, _size: u64) -> Result<()> {
        Err(crate::Error::QuotaUnsupported)
    }

    fn usage(&self, path: &Path) -> Result<DiskUsage> {
        walk_usage(path)
    }
}

/// Best-effort usage accounting by walking the tree, used as a fallback
/// when no quota backend can report usage directly.
pub fn walk_usage(path: &Path) -> Result<DiskUsage> {
    let mut usage = DiskUsage::default();
    if !path.exists() {
        return Ok(usage);
    }
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry?;
        let meta = entry.metadata()?;
        usage.size_bytes += meta.len();
        usage.inode_count += 1;
    }
    Ok(usage)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_null_quota_unsupported() {
        let dir = TempDir::new().unwrap();
        let ctl = NullQuotaCtl;
        assert!(!ctl.supported(dir.path()).unwrap());
        assert!(matches!(ctl.set_quota(dir.path(), 1024), Err(crate::Error::QuotaUnsupported)));
    }

    #[test]
    fn test_walk_usage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();
        let usage = walk_usage(dir.path()).unwrap();
        assert!(usage.size_bytes >= 5);
        assert!(usage.inode_count >= 2);
    }
}
