use std::fs::{File, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};

use getset::Getters;
use sha2::{Digest, Sha256};
use tar::{Builder, Header};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::sum_reader;
use crate::utils::ProgressReader;
use crate::{LayerstackError, LayerstackResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Capacity of the in-memory pipe between the tar producer and the hashing drain.
///
/// The producer blocks once this much of the stream is buffered, so memory stays bounded
/// regardless of archive size.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Prefix of archive temp file names in the system temp directory.
const TEMP_PREFIX: &str = "layerstack-archive.";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A produced archive artifact: a temporary tar file and the content digest of its exact
/// byte stream.
///
/// The digest is computed over the tar bytes as produced, so reordering entries changes
/// it. The caller owns deletion of the temp file.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Tarball {
    /// Path of the temporary tar file.
    path: PathBuf,

    /// Hex-encoded SHA-256 digest of the file's exact byte stream.
    digest: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Tarball {
    /// Recomputes the digest of the on-disk file and compares it against the recorded
    /// digest.
    pub async fn verify(&self) -> LayerstackResult<bool> {
        let path = self.path.clone();
        let sum = task::spawn_blocking(move || -> io::Result<String> {
            sum_reader(File::open(path)?)
        })
        .await??;

        Ok(sum == self.digest)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Archives the glob-expanded `source` into a fresh temporary tar file, computing the
/// SHA-256 digest of the stream as it is written.
///
/// Every glob match is resolved through symlinks and `lstat`-ed before any byte is
/// written; a failure to resolve any entry aborts the whole operation. Matched
/// directories are walked lexicographically: entries matched by an `ignore` glob are
/// skipped entirely, only regular files and symlinks are archived, and every symlink is
/// resolved to its real target — a target outside the directory being archived fails the
/// operation. Entry names are `target` joined with the resolved relative path (stored
/// without a leading separator). Matches that are not directories become single entries
/// named `target` itself, with the source's base name appended when `target` ends in a
/// separator; such explicitly-named entries are archived whatever their file type.
///
/// `cancel` is checked before each top-level entry; cancellation mid-entry is not
/// supported.
///
/// # Errors
///
/// Returns [`LayerstackError::PathEscape`] when a symlink resolves outside the archived
/// root, [`LayerstackError::SymlinkResolution`] for dangling symlinks, and
/// [`LayerstackError::Canceled`] when `cancel` fires. Errors never reference a temp
/// file: partial output is dropped with the error.
pub async fn create(
    source: impl AsRef<str>,
    target: impl AsRef<str>,
    ignore: &[String],
    cancel: CancellationToken,
) -> LayerstackResult<Tarball> {
    if cancel.is_cancelled() {
        return Err(LayerstackError::Canceled);
    }

    let source = source.as_ref().to_string();
    let entries = task::spawn_blocking(move || resolve_entries(&source)).await??;

    let (temp_file, temp_path) = NamedTempFile::with_prefix(TEMP_PREFIX)?.into_parts();

    let (pipe_writer, mut pipe_reader) = tokio::io::duplex(PIPE_CAPACITY);

    // Drain side of the pipe: stream the tar bytes into the temp file while the digest
    // accumulator observes every chunk on the way through.
    let drain = tokio::spawn(async move {
        let mut hasher = Sha256::new();
        let mut out = tokio::fs::File::from_std(temp_file);
        let mut buf = vec![0u8; PIPE_CAPACITY];

        loop {
            let n = pipe_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }

        out.flush().await?;
        Ok::<String, io::Error>(hex::encode(hasher.finalize()))
    });

    let target = target.as_ref().to_string();
    let ignore = ignore.to_vec();
    let producer = task::spawn_blocking(move || {
        write_entries(
            SyncIoBridge::new(pipe_writer),
            &entries,
            &target,
            &ignore,
            &cancel,
        )
    });

    let (producer_result, drain_result) = tokio::join!(producer, drain);
    producer_result??;
    let digest = drain_result??;

    let path = temp_path
        .keep()
        .map_err(|e| LayerstackError::Io(e.error))?;

    tracing::debug!(path = %path.display(), digest = %digest, "archive complete");

    Ok(Tarball { path, digest })
}

/// Glob-expands `source` and resolves every match through symlinks to an absolute path,
/// `lstat`-ing the result.
fn resolve_entries(source: &str) -> LayerstackResult<Vec<(PathBuf, Metadata)>> {
    let mut entries = Vec::new();

    for matched in glob::glob(source)? {
        let matched = matched?;
        let resolved =
            matched
                .canonicalize()
                .map_err(|source| LayerstackError::SymlinkResolution {
                    path: matched.clone(),
                    source,
                })?;
        let metadata = std::fs::symlink_metadata(&resolved)?;
        entries.push((resolved, metadata));
    }

    Ok(entries)
}

/// Writes all resolved top-level entries as a complete tar stream, checking `cancel`
/// between entries.
fn write_entries<W: io::Write>(
    writer: W,
    entries: &[(PathBuf, Metadata)],
    target: &str,
    ignore: &[String],
    cancel: &CancellationToken,
) -> LayerstackResult<()> {
    let mut builder = Builder::new(writer);

    for (path, metadata) in entries {
        if cancel.is_cancelled() {
            return Err(LayerstackError::Canceled);
        }

        if metadata.is_dir() {
            append_tree(&mut builder, path, metadata, target, ignore)?;
        } else {
            let ignored = expand_ignore(path, ignore)?;
            if is_ignored(path, &ignored) {
                continue;
            }
            append_single(&mut builder, path, metadata, target)?;
        }
    }

    // Writes the trailer; dropping the returned pipe writer signals EOF to the drain.
    builder.into_inner()?;

    Ok(())
}

/// Appends a directory entry for `root` followed by its recursive, filtered contents.
fn append_tree<W: io::Write>(
    builder: &mut Builder<W>,
    root: &Path,
    metadata: &Metadata,
    target: &str,
    ignore: &[String],
) -> LayerstackResult<()> {
    // A "." target makes the entry's own resolved path the archive's logical root.
    let prefix = if target == "." {
        root.to_path_buf()
    } else {
        PathBuf::from(target)
    };

    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_link_name(&prefix)?;
    builder.append_data(&mut header, entry_name(&prefix), io::empty())?;

    let ignored = expand_ignore(root, ignore)?;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();

        if is_ignored(path, &ignored) {
            continue;
        }

        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        let resolved =
            path.canonicalize()
                .map_err(|source| LayerstackError::SymlinkResolution {
                    path: path.to_path_buf(),
                    source,
                })?;

        let resolved_rel =
            resolved
                .strip_prefix(root)
                .map_err(|_| LayerstackError::PathEscape {
                    path: resolved.clone(),
                    root: root.to_path_buf(),
                })?;

        let resolved_meta = std::fs::symlink_metadata(&resolved)?;

        let mut header = Header::new_gnu();
        header.set_metadata(&resolved_meta);

        let name = entry_name(&prefix.join(resolved_rel));
        if resolved_meta.is_file() {
            let file = File::open(&resolved)?;
            let label = format!("Writing {}", resolved.display());
            builder.append_data(&mut header, name, ProgressReader::new(file, label))?;
        } else {
            builder.append_data(&mut header, name, io::empty())?;
        }
    }

    Ok(())
}

/// Appends a single non-directory entry named by `target`.
///
/// The header is synthesized from the entry's `lstat` metadata whatever the file type;
/// only regular files contribute content bytes.
fn append_single<W: io::Write>(
    builder: &mut Builder<W>,
    path: &Path,
    metadata: &Metadata,
    target: &str,
) -> LayerstackResult<()> {
    let name = if target.ends_with('/') {
        Path::new(target).join(path.file_name().unwrap_or_default())
    } else {
        PathBuf::from(target)
    };

    let mut header = Header::new_gnu();
    header.set_metadata(metadata);

    if metadata.is_file() {
        let file = File::open(path)?;
        let label = format!("Writing {}", path.display());
        builder.append_data(&mut header, entry_name(&name), ProgressReader::new(file, label))?;
    } else {
        builder.append_data(&mut header, entry_name(&name), io::empty())?;
    }

    Ok(())
}

/// Expands each ignore pattern relative to `base`, returning every on-disk match.
fn expand_ignore(base: &Path, ignore: &[String]) -> LayerstackResult<Vec<PathBuf>> {
    let mut matches = Vec::new();

    for pattern in ignore {
        let full = base.join(pattern);
        for matched in glob::glob(&full.to_string_lossy())? {
            matches.push(matched?);
        }
    }

    Ok(matches)
}

/// Returns whether `path` equals or lies under any ignore match.
fn is_ignored(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|matched| path.starts_with(matched))
}

/// Converts a composed entry name to the relative form tar entries are stored as.
///
/// Root and current-directory components are dropped; a name that strips to nothing
/// becomes `.`, the conventional root marker.
fn entry_name(path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|component| {
            !matches!(
                component,
                Component::Prefix(_) | Component::RootDir | Component::CurDir
            )
        })
        .collect();

    if relative.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        relative
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
