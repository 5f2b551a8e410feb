use std::path::{Path, PathBuf};

use getset::Getters;
use nix::mount::{mount, umount, MsFlags};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::Layer;
use crate::archive::{self, Tarball};
use crate::{LayerstackError, LayerstackResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An ordered stack of [`Layer`]s composed into one overlay union mount.
///
/// The topmost layer is the sole writable layer; all others are read-only and are
/// consulted top-to-bottom for lookups. Mount state is recorded on the instance only and
/// is never reconciled against the kernel mount table; concurrent `mount`/`unmount`
/// calls on one instance must be serialized by the caller.
#[derive(Debug, TypedBuilder, Getters)]
#[getset(get = "pub")]
pub struct Filesystem {
    /// The ordered layer stack, bottom-most first.
    layers: Vec<Layer>,

    /// The path the union view is mounted at.
    #[builder(setter(transform = |path: impl AsRef<Path>| path.as_ref().to_path_buf()))]
    mountpoint: PathBuf,

    /// The scratch directory handed to the kernel at mount time.
    #[builder(default, setter(skip))]
    #[getset(skip)]
    work_dir: Option<PathBuf>,

    /// Recorded mount state.
    #[builder(default, setter(skip))]
    #[getset(skip)]
    mounted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Creates any missing layer directories and mounts the union at the mountpoint.
    ///
    /// `work_dir` is the kernel's scratch directory; it must name a fresh path and is
    /// created with mode `0700`. The layer order is preserved exactly in the overlay
    /// `lowerdir` option, so earlier layers shadow later ones for duplicate paths.
    ///
    /// Failures are fail-fast and leave partial state behind: layers created before the
    /// failure are kept, and a scratch directory created before a failed mount syscall
    /// is not removed. Re-mounting an already-mounted instance is not supported.
    ///
    /// # Errors
    ///
    /// Returns [`LayerstackError::MountConfiguration`] when fewer than two layers are
    /// configured or `work_dir` is empty, and [`LayerstackError::Mount`] when the mount
    /// syscall fails.
    pub async fn mount(&mut self, work_dir: impl AsRef<Path>) -> LayerstackResult<()> {
        let work_dir = work_dir.as_ref();

        for layer in &self.layers {
            if !layer.exists().await {
                layer.create().await?;
            }
        }

        if self.layers.len() < 2 {
            return Err(LayerstackError::MountConfiguration {
                mountpoint: self.mountpoint.clone(),
                reason: format!("need at least 2 layers, got {}", self.layers.len()),
            });
        }

        let (lower, upper) = self.layers.split_at(self.layers.len() - 1);
        let upper = &upper[0];

        if work_dir.as_os_str().is_empty() {
            return Err(LayerstackError::MountConfiguration {
                mountpoint: self.mountpoint.clone(),
                reason: "work directory cannot be empty".to_string(),
            });
        }

        self.work_dir = Some(work_dir.to_path_buf());

        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        builder.create(work_dir).await?;

        let lower_dirs = lower
            .iter()
            .map(|layer| layer.path().display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower_dirs,
            upper.path().display(),
            work_dir.display()
        );

        tracing::debug!(
            mountpoint = %self.mountpoint.display(),
            options = %options,
            "mounting overlay"
        );

        mount(
            Some("overlay"),
            &self.mountpoint,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|source| LayerstackError::Mount {
            mountpoint: self.mountpoint.clone(),
            source,
        })?;

        self.mounted = true;

        tracing::info!(
            mountpoint = %self.mountpoint.display(),
            layers = self.layers.len(),
            "mounted overlay"
        );

        Ok(())
    }

    /// Unmounts the union view and removes the scratch directory.
    ///
    /// If the unmount syscall fails the instance remains mounted so a retry is
    /// meaningful. Once the syscall succeeds the instance is unmounted even when the
    /// subsequent scratch-directory removal fails; that failure is reported as an I/O
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`LayerstackError::NotMounted`] when the instance is not mounted, and
    /// [`LayerstackError::Unmount`] when the unmount syscall fails.
    pub async fn unmount(&mut self) -> LayerstackResult<()> {
        if !self.mounted {
            return Err(LayerstackError::NotMounted);
        }

        umount(&self.mountpoint).map_err(|source| LayerstackError::Unmount {
            mountpoint: self.mountpoint.clone(),
            source,
        })?;

        self.mounted = false;
        tracing::info!(mountpoint = %self.mountpoint.display(), "unmounted overlay");

        if let Some(work_dir) = self.work_dir.take() {
            fs::remove_dir_all(&work_dir).await?;
        }

        Ok(())
    }

    /// Returns whether this instance mounted the union view.
    ///
    /// This is recorded state only, not a live kernel query.
    pub fn mounted(&self) -> bool {
        self.mounted
    }

    /// Archives the entire mounted union view into a content-addressed tarball.
    ///
    /// The mount state is untouched; the caller must still [`Filesystem::unmount`]
    /// separately.
    ///
    /// # Errors
    ///
    /// Returns [`LayerstackError::NotMounted`] when the instance is not mounted.
    pub async fn flatten(&self) -> LayerstackResult<Tarball> {
        if !self.mounted {
            return Err(LayerstackError::NotMounted);
        }

        archive::create(
            self.mountpoint.display().to_string(),
            "/",
            &[],
            CancellationToken::new(),
        )
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
