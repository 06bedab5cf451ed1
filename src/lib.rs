//! Layered-filesystem storage driver for container images and
//! containers, backed by the kernel overlay filesystem (or an external
//! mount helper as an alternative stacking mechanism).
//!
//! See [`Driver`] for the entry point; the rest of the modules are the
//! components it wires together: path layout, the link farm, the
//! lower-chain resolver, the mounter, layer lifecycle, the diff engine,
//! and the ID-map remapper.

pub mod diff;
mod error;
pub mod idmap;
pub mod idmap_remap;
pub mod layout;
pub mod lifecycle;
pub mod linkfarm;
mod locks;
pub mod lower;
pub mod mount;
pub mod options;
pub mod quota;

mod driver;
pub use driver::{Driver, DriverStatus};
pub use error::{Error, Result};
