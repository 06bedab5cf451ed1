//! ID-mapping value type (spec §1: "ID-mapping computation: interface
//! only"). This crate only needs to *apply* an already-computed map —
//! computing one from subuid/subgid ranges is the embedder's job.

/// One contiguous range of a uid/gid mapping: `size` ids starting at
/// `container_id` map to ids starting at `host_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// An ordered list of mapping entries for either uids or gids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    entries: Vec<IdMapEntry>,
}

impl IdMap {
    pub fn new(entries: Vec<IdMapEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True for a single identity mapping of size 1 — the case spec.md
    /// §4.4 calls out for `squash_to_uid=`/`squash_to_gid=` instead of
    /// the general `uidmapping=`/`gidmapping=` label.
    pub fn is_single_identity(&self) -> bool {
        self.entries.len() == 1 && self.entries[0].size == 1
    }

    /// Maps a container-side id to its host-side id, or returns the
    /// input unchanged if it falls outside every entry's range.
    pub fn shift(&self, container_id: u32) -> u32 {
        for entry in &self.entries {
            if container_id >= entry.container_id && container_id < entry.container_id + entry.size {
                return entry.host_id + (container_id - entry.container_id);
            }
        }
        container_id
    }

    /// Renders the mapping in the `from:to:size` triples the mount
    /// label / helper options expect, space-separated.
    pub fn to_label(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}:{}:{}", e.container_id, e.host_id, e.size))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
