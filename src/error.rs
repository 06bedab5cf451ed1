use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the layer store driver.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("some lock is poisoned")]
    PoisonError,
    #[error("unable to parse mountinfo file: {0}")]
    MountInfoParseError(#[from] libmount::mountinfo::ParseError),
    #[error("mount error: {0}")]
    MountError(String),
    #[error(transparent)]
    SyscallError(#[from] nix::Error),
    #[error(transparent)]
    FsTraverseError(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefixError(#[from] std::path::StripPrefixError),

    #[error("unknown driver option: {0}")]
    UnknownOption(String),
    #[error("invalid value for driver option {0}: {1}")]
    InvalidOptionValue(String, String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),
    #[error("layer already exists: {0}")]
    LayerExists(String),
    #[error("parent layer not found: {0}")]
    ParentNotFound(String),

    #[error("lower chain depth exceeds the limit of {limit} layers (has {actual})")]
    DepthExceeded { limit: usize, actual: usize },

    #[error("mount label too large to fit in one page even with relative paths")]
    MountLabelTooLarge,

    #[error("mount helper {program:?} failed with status {status}: {stderr}")]
    HelperFailed {
        program: PathBuf,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("your kernel does not support overlayfs")]
    OverlayFsUnavailable,
    #[error("backing filesystem {0} is not supported by overlay (aufs/zfs/ecryptfs/overlay itself, without a mount_program)")]
    UnsupportedBackingFs(String),
    #[error("kernel or backing filesystem does not support d_type, which overlay requires")]
    DTypeUnsupported,
    #[error("native overlay diff is not supported in this configuration")]
    NativeDiffUnsupported,
    #[error("naive diff requested but no naive diff engine is configured")]
    NaiveDiffUnavailable,
    #[error("overlay metacopy is not supported by this driver")]
    MetaCopyUnsupported,

    #[error("per-layer quota was requested but the backing filesystem does not support project quotas")]
    QuotaUnsupported,

    #[error("layer {0:?} is not the direct parent of layer {1:?}")]
    NotDirectParent(String, String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::PoisonError
    }
}

impl From<libmount::Error> for Error {
    fn from(err: libmount::Error) -> Self {
        Self::MountError(format!("{err:?}"))
    }
}
