//! Lower-Chain Resolver (spec §4.3).
//!
//! Expands a layer's `lower` file into ordered absolute and relative
//! path lists, uppermost first, following rotated-diff suffixes and
//! falling back to additional image stores.

use std::fs;
use std::path::PathBuf;

use crate::layout::{read_link_file, Layout};
use crate::linkfarm::LinkFarm;
use crate::{Error, Result};

/// Hard cap on lower-chain depth, independent of the short-id length
/// chosen to keep mount data within one memory page.
pub const MAX_LOWER_DEPTH: usize = 128;

/// The two parallel, uppermost-first path lists fed to the mounter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LowerChain {
    pub absolute: Vec<PathBuf>,
    pub relative: Vec<String>,
}

impl LowerChain {
    fn push(&mut self, abs: PathBuf, rel: String) {
        self.absolute.push(abs);
        self.relative.push(rel);
    }

    pub fn len(&self) -> usize {
        self.absolute.len()
    }

    pub fn is_empty(&self) -> bool {
        self.absolute.is_empty()
    }
}

pub struct LowerResolver<'a> {
    layout: &'a Layout,
}

impl<'a> LowerResolver<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    pub fn resolve(&self, id: &str) -> Result<LowerChain> {
        let mut chain = LowerChain::default();
        let id_dir = self.layout.dir(id)?;
        let own_short = read_link_file(&self.layout.link_path(id)?)?;

        self.expand_rotated(&mut chain, &id_dir, &format!("l/{own_short}"))?;

        let lower_path = self.layout.lower_path(id)?;
        if lower_path.exists() {
            let content = std::fs::read_to_string(&lower_path)?;
            let entries: Vec<&str> = content.split(':').filter(|e| !e.is_empty()).collect();
            if entries.len() > MAX_LOWER_DEPTH {
                return Err(Error::DepthExceeded {
                    limit: MAX_LOWER_DEPTH,
                    actual: entries.len(),
                });
            }
            for entry in entries {
                let abs = self.resolve_link_entry(entry)?;
                chain.push(abs.clone(), entry.to_string());
                let ancestor_dir = abs
                    .parent()
                    .ok_or_else(|| Error::MountError(format!("malformed lower entry {entry:?}")))?;
                self.expand_rotated(&mut chain, ancestor_dir, entry)?;
            }
        }

        if chain.is_empty() {
            chain.push(self.layout.empty_path(id)?, format!("{id}/empty"));
        }

        if chain.len() > MAX_LOWER_DEPTH {
            return Err(Error::DepthExceeded {
                limit: MAX_LOWER_DEPTH,
                actual: chain.len(),
            });
        }

        Ok(chain)
    }

    /// Appends `<dir>/diff1`, `<dir>/diff2`, … (contiguous, so the loop
    /// stops at the first gap) as additional lower entries below
    /// `rel_base` (itself `l/<short>` or a lower-file entry).
    fn expand_rotated(&self, chain: &mut LowerChain, dir: &std::path::Path, rel_base: &str) -> Result<()> {
        let mut k = 1;
        loop {
            let candidate = dir.join(format!("diff{k}"));
            if !candidate.exists() {
                break;
            }
            chain.push(candidate, format!("{rel_base}/../diff{k}"));
            k += 1;
        }
        Ok(())
    }

    /// Resolves a single `lower`-file entry (e.g. `l/<short>`) to an
    /// absolute path, for callers that only need the uppermost entry
    /// (e.g. the Diff Engine's `isParent` check).
    pub fn resolve_single(&self, entry: &str) -> Result<PathBuf> {
        self.resolve_link_entry(entry)
    }

    /// Resolves a `lower`-file entry (e.g. `l/<short>`) to an absolute
    /// path, trying `home` first, then each additional image store, and
    /// rebuilding the link farm once on a not-found error before
    /// retrying.
    fn resolve_link_entry(&self, entry: &str) -> Result<PathBuf> {
        match self.try_resolve_link_entry(entry) {
            Ok(path) => Ok(path),
            Err(Error::LayerNotFound(_)) => {
                LinkFarm::new(self.layout).rebuild()?;
                self.try_resolve_link_entry(entry)
            }
            Err(e) => Err(e),
        }
    }

    /// `entry` names an `l/<short>` link-farm symlink (or an
    /// `.../diffK` path derived from one); resolves it to the real
    /// target directory, not the symlink path itself, so that the
    /// caller can recurse into its parent (for rotated-diff expansion)
    /// or compare it against another layer's directory (`isParent`).
    fn try_resolve_link_entry(&self, entry: &str) -> Result<PathBuf> {
        let primary = self.layout.home().join(entry);
        if primary.exists() {
            return Ok(fs::canonicalize(&primary)?);
        }
        for store in self.layout.additional_image_stores() {
            let candidate = store.join(crate::layout::DRIVER_NAME).join(entry);
            if candidate.exists() {
                return Ok(fs::canonicalize(&candidate)?);
            }
        }
        Err(Error::LayerNotFound(entry.to_string()))
    }
}
