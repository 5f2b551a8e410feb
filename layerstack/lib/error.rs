use std::path::PathBuf;

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a layerstack-related operation.
pub type LayerstackResult<T> = Result<T, LayerstackError>;

/// An error that occurred during a layer, mount or archive operation.
#[derive(Debug, Error)]
pub enum LayerstackError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred when a layer dirname failed validation.
    #[error("invalid layer dirname: {0}")]
    InvalidLayerDirname(String),

    /// An error that occurred when a filesystem was configured in a way that cannot be mounted.
    #[error("invalid mount configuration for mountpoint {mountpoint}: {reason}")]
    MountConfiguration {
        /// The mountpoint the filesystem was meant to be mounted at.
        mountpoint: PathBuf,

        /// Why the configuration was rejected.
        reason: String,
    },

    /// An error that occurred when the overlay mount syscall failed.
    #[error("overlay mount failed at {mountpoint}: {source}")]
    Mount {
        /// The mountpoint the overlay was meant to be mounted at.
        mountpoint: PathBuf,

        /// The kernel error.
        #[source]
        source: nix::Error,
    },

    /// An error that occurred when the unmount syscall failed.
    #[error("unmount failed at {mountpoint}: {source}")]
    Unmount {
        /// The mountpoint the overlay was mounted at.
        mountpoint: PathBuf,

        /// The kernel error.
        #[source]
        source: nix::Error,
    },

    /// An error that occurred when an operation requiring a mounted filesystem was invoked
    /// while unmounted.
    #[error("filesystem not mounted")]
    NotMounted,

    /// An error that occurred when a resolved path fell outside its permitted root.
    #[error("path {path} escapes root {root}")]
    PathEscape {
        /// The offending resolved path.
        path: PathBuf,

        /// The root the path was required to stay under.
        root: PathBuf,
    },

    /// An error that occurred when a symlink could not be resolved to a real path.
    #[error("failed to resolve symlink {path}: {source}")]
    SymlinkResolution {
        /// The symlink that failed to resolve.
        path: PathBuf,

        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An error that occurred when a glob pattern failed to parse.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// An error that occurred when an archive operation was canceled by the caller.
    #[error("archive operation canceled")]
    Canceled,

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<glob::GlobError> for LayerstackError {
    fn from(error: glob::GlobError) -> Self {
        LayerstackError::Io(error.into_error())
    }
}

impl From<walkdir::Error> for LayerstackError {
    fn from(error: walkdir::Error) -> Self {
        LayerstackError::Io(error.into())
    }
}
