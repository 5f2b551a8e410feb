use std::io;
use std::path::{Component, Path, PathBuf};

use getset::Getters;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, Tarball};
use crate::{LayerstackError, LayerstackResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single directory-backed filesystem layer in a container-style build.
///
/// A `Layer` value outlives its on-disk directory: it is constructed validated but not
/// yet materialized, and [`Layer::exists`] always reflects the current disk state rather
/// than an internal flag.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct Layer {
    /// The layer's directory name, relative to the working directory.
    dirname: PathBuf,

    /// The absolute base directory the layer lives under.
    working_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Layer {
    /// Creates a new validated, not-yet-materialized layer.
    ///
    /// `dirname` must be a non-empty relative path without any `..` segment, so the
    /// layer can never resolve above `working_dir`. An empty `working_dir` defaults to
    /// the process current directory; either way it is resolved to an absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`LayerstackError::InvalidLayerDirname`] when `dirname` fails validation,
    /// or an I/O error when the working directory cannot be resolved.
    pub fn new(dirname: impl AsRef<Path>, working_dir: impl AsRef<Path>) -> LayerstackResult<Self> {
        let dirname = dirname.as_ref();
        if dirname.as_os_str().is_empty() {
            return Err(LayerstackError::InvalidLayerDirname(
                "dirname may not be empty".to_string(),
            ));
        }

        if dirname.is_absolute() {
            return Err(LayerstackError::InvalidLayerDirname(format!(
                "cannot use absolute path {:?}",
                dirname
            )));
        }

        if dirname.components().any(|c| c == Component::ParentDir) {
            return Err(LayerstackError::InvalidLayerDirname(format!(
                "cannot use .. in path names: {:?}",
                dirname
            )));
        }

        let working_dir = working_dir.as_ref();
        let working_dir = if working_dir.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            std::path::absolute(working_dir)?
        };

        Ok(Self {
            dirname: dirname.to_path_buf(),
            working_dir,
        })
    }

    /// The fully-qualified path to the layer directory.
    pub fn path(&self) -> PathBuf {
        self.working_dir.join(&self.dirname)
    }

    /// Creates the layer directory on disk.
    ///
    /// Creation is not idempotent: creating a layer whose directory already exists is
    /// an error.
    pub async fn create(&self) -> LayerstackResult<()> {
        fs::create_dir(self.path()).await?;
        tracing::debug!(layer = %self.path().display(), "created layer");
        Ok(())
    }

    /// Recursively removes the layer directory and all of its contents.
    ///
    /// Removing a layer that does not exist on disk succeeds.
    pub async fn remove(&self) -> LayerstackResult<()> {
        match fs::remove_dir_all(self.path()).await {
            Ok(()) => {
                tracing::debug!(layer = %self.path().display(), "removed layer");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether the layer directory currently exists on disk.
    ///
    /// Any stat failure, including permission errors, reads as non-existence.
    pub async fn exists(&self) -> bool {
        fs::metadata(self.path()).await.is_ok()
    }

    /// Archives the layer directory into a content-addressed tarball.
    ///
    /// The archive is rooted at the layer directory with a `/` target prefix and no
    /// ignore rules; see [`archive::create`] for the full contract.
    pub async fn archive(&self) -> LayerstackResult<Tarball> {
        archive::create(
            self.path().display().to_string(),
            "/",
            &[],
            CancellationToken::new(),
        )
        .await
    }

    /// Unpacks `tar_file` into the layer directory.
    pub async fn unarchive(&self, tar_file: impl AsRef<Path>) -> LayerstackResult<()> {
        archive::extract(self.path(), tar_file).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_layer_new_validates_dirname() {
        for (dirname, working_dir) in [
            ("", ""),
            ("..", ""),
            ("..", ".."),
            ("a/../b", ""),
            ("/absolute", ""),
        ] {
            let result = Layer::new(dirname, working_dir);
            assert!(
                matches!(result, Err(LayerstackError::InvalidLayerDirname(_))),
                "expected {:?} to be rejected",
                dirname
            );
        }

        for (dirname, working_dir) in [(".", ".."), (".", ""), ("quux", ""), ("a/b", "/tmp")] {
            assert!(
                Layer::new(dirname, working_dir).is_ok(),
                "expected {:?} to be accepted",
                dirname
            );
        }
    }

    #[test]
    fn test_layer_path_joins_working_dir() {
        let layer = Layer::new("quux", "/tmp/work").unwrap();
        assert_eq!(layer.path(), PathBuf::from("/tmp/work/quux"));
        assert_eq!(layer.dirname(), &PathBuf::from("quux"));
        assert_eq!(layer.working_dir(), &PathBuf::from("/tmp/work"));
    }

    #[test]
    fn test_layer_new_defaults_to_current_dir() {
        let layer = Layer::new("quux", "").unwrap();
        assert_eq!(layer.working_dir(), &std::env::current_dir().unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_layer_create_remove_exists() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = Layer::new("quux", temp.path())?;

        assert!(!layer.exists().await);

        layer.create().await?;
        assert!(layer.exists().await);
        assert!(fs::metadata(layer.path()).await?.is_dir());

        // Creation is not idempotent.
        assert!(layer.create().await.is_err());

        layer.remove().await?;
        assert!(!layer.exists().await);

        // Removal is idempotent.
        layer.remove().await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_layer_remove_deletes_contents() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let layer = Layer::new("quux", temp.path())?;

        layer.create().await?;
        fs::create_dir(layer.path().join("nested")).await?;
        fs::write(layer.path().join("nested/file.txt"), "contents").await?;

        layer.remove().await?;
        assert!(!layer.exists().await);

        Ok(())
    }
}
