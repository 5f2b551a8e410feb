use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};
use tar::Archive;
use tokio::task;

use crate::utils::copy_with_progress;
use crate::{LayerstackError, LayerstackResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams the tar file at `tar_file` entry-by-entry and materializes it under `dest`.
///
/// Entry names are stripped of leading separators, cleaned, and containment-checked
/// against `dest`; an entry that would escape stops the extraction with a
/// [`LayerstackError::PathEscape`], leaving whatever was extracted so far on disk. A
/// degenerate entry naming the destination itself is skipped. Directory entries are
/// created recursively with the recorded mode (pre-existing directories are kept as-is);
/// file entries are created truncating any existing file. After each entry its
/// ownership is restored from the header — an ownership failure aborts the extraction.
pub async fn extract(dest: impl AsRef<Path>, tar_file: impl AsRef<Path>) -> LayerstackResult<()> {
    let dest = dest.as_ref().to_path_buf();
    let tar_file = tar_file.as_ref().to_path_buf();

    task::spawn_blocking(move || extract_blocking(&dest, &tar_file)).await?
}

fn extract_blocking(dest: &Path, tar_file: &Path) -> LayerstackResult<()> {
    let file = File::open(tar_file)?;
    let mut archive = Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header().clone();

        let raw_path = entry.path()?.into_owned();
        let Some(relative) = normalize_entry_path(&raw_path, dest)? else {
            continue;
        };
        let entry_path = dest.join(relative);

        let mode = header.mode()?;
        if header.entry_type().is_dir() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            builder.mode(mode);
            builder.create(&entry_path)?;
        } else {
            if let Some(parent) = entry_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(mode)
                .open(&entry_path)?;

            let label = format!("Unpacking {}", entry_path.display());
            copy_with_progress(&mut file, &mut entry, &label)?;
        }

        let uid = header.uid()?;
        let gid = header.gid()?;
        chown(
            &entry_path,
            Some(Uid::from_raw(uid as u32)),
            Some(Gid::from_raw(gid as u32)),
        )
        .map_err(io::Error::from)?;
    }

    tracing::debug!(dest = %dest.display(), tar_file = %tar_file.display(), "extracted archive");

    Ok(())
}

/// Cleans an archive entry name into a destination-relative path.
///
/// Prefix, root, and current-directory components are dropped, `..` pops the component
/// stack, and popping past the bottom is an escape. A name that cleans to nothing is the
/// degenerate destination-root entry, reported as `None`.
fn normalize_entry_path(path: &Path, dest: &Path) -> LayerstackResult<Option<PathBuf>> {
    let mut relative = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(LayerstackError::PathEscape {
                        path: path.to_path_buf(),
                        root: dest.to_path_buf(),
                    });
                }
            }
            Component::Normal(part) => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        return Ok(None);
    }

    Ok(Some(relative))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_normalize_entry_path() {
        let dest = Path::new("/dest");

        assert_eq!(
            normalize_entry_path(Path::new("/etc/passwd"), dest).unwrap(),
            Some(PathBuf::from("etc/passwd"))
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/./b"), dest).unwrap(),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/../b"), dest).unwrap(),
            Some(PathBuf::from("b"))
        );
        assert_eq!(normalize_entry_path(Path::new("."), dest).unwrap(), None);
        assert_eq!(normalize_entry_path(Path::new("/"), dest).unwrap(), None);

        assert!(matches!(
            normalize_entry_path(Path::new("../escape"), dest),
            Err(LayerstackError::PathEscape { .. })
        ));
        assert!(matches!(
            normalize_entry_path(Path::new("a/../../escape"), dest),
            Err(LayerstackError::PathEscape { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_materializes_entries() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("test.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;

        let data = helper::archive(&[
            helper::Entry::dir("sub", 0o755),
            helper::Entry::file("sub/hello.txt", b"hello", 0o644),
            helper::Entry::file("top.txt", b"top", 0o600),
        ])?;
        std::fs::write(&tar_file, data)?;

        extract(&dest, &tar_file).await?;

        assert_eq!(std::fs::read_to_string(dest.join("sub/hello.txt"))?, "hello");
        assert_eq!(std::fs::read_to_string(dest.join("top.txt"))?, "top");
        assert_eq!(
            std::fs::metadata(dest.join("top.txt"))?.permissions().mode() & 0o777,
            0o600
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_creates_missing_parents() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("test.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;

        // No directory entries at all, only a deeply nested file.
        let data = helper::archive(&[helper::Entry::file("a/b/c/deep.txt", b"deep", 0o644)])?;
        std::fs::write(&tar_file, data)?;

        extract(&dest, &tar_file).await?;
        assert_eq!(std::fs::read_to_string(dest.join("a/b/c/deep.txt"))?, "deep");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_truncates_existing_files() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("test.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;
        std::fs::write(dest.join("file.txt"), "a much longer pre-existing body")?;

        let data = helper::archive(&[helper::Entry::file("file.txt", b"short", 0o644)])?;
        std::fs::write(&tar_file, data)?;

        extract(&dest, &tar_file).await?;
        assert_eq!(std::fs::read_to_string(dest.join("file.txt"))?, "short");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_rejects_escaping_entry() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("evil.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;

        let data = helper::raw_archive(b"../escape.txt", b"escaped");
        std::fs::write(&tar_file, data)?;

        let result = extract(&dest, &tar_file).await;
        assert!(matches!(result, Err(LayerstackError::PathEscape { .. })));
        assert!(!temp.path().join("escape.txt").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_normalizes_absolute_names() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("abs.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;

        let data = helper::raw_archive(b"/etc/passwd", b"not really");
        std::fs::write(&tar_file, data)?;

        extract(&dest, &tar_file).await?;
        assert_eq!(
            std::fs::read_to_string(dest.join("etc/passwd"))?,
            "not really"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_extract_skips_degenerate_root_entry() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let tar_file = temp.path().join("root.tar");
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest)?;

        let data = helper::archive(&[
            helper::Entry::dir(".", 0o755),
            helper::Entry::file("after.txt", b"after", 0o644),
        ])?;
        std::fs::write(&tar_file, data)?;

        extract(&dest, &tar_file).await?;
        assert_eq!(std::fs::read_to_string(dest.join("after.txt"))?, "after");

        Ok(())
    }

    mod helper {
        use super::*;

        pub(super) struct Entry {
            name: &'static str,
            content: &'static [u8],
            mode: u32,
            dir: bool,
        }

        impl Entry {
            pub(super) fn file(name: &'static str, content: &'static [u8], mode: u32) -> Self {
                Self {
                    name,
                    content,
                    mode,
                    dir: false,
                }
            }

            pub(super) fn dir(name: &'static str, mode: u32) -> Self {
                Self {
                    name,
                    content: b"",
                    mode,
                    dir: true,
                }
            }
        }

        /// Builds a tar archive whose entries are owned by the current user, so the
        /// extractor's ownership restoration can succeed without privileges.
        pub(super) fn archive(entries: &[Entry]) -> anyhow::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());

            for entry in entries {
                let mut header = tar::Header::new_gnu();
                header.set_path(entry.name)?;
                header.set_mode(entry.mode);
                header.set_uid(u64::from(nix::unistd::getuid().as_raw()));
                header.set_gid(u64::from(nix::unistd::getgid().as_raw()));
                if entry.dir {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                } else {
                    header.set_size(entry.content.len() as u64);
                }
                header.set_cksum();
                builder.append(&header, entry.content)?;
            }

            Ok(builder.into_inner()?)
        }

        /// Builds a single-file tar archive by hand, bypassing `tar::Builder`'s path
        /// validation so escaping and absolute names can be exercised.
        pub(super) fn raw_archive(name: &[u8], content: &[u8]) -> Vec<u8> {
            let mut header = [0u8; 512];

            let name_len = name.len().min(100);
            header[..name_len].copy_from_slice(&name[..name_len]);

            header[100..107].copy_from_slice(b"0000644");

            let uid = format!("{:07o}", nix::unistd::getuid().as_raw());
            header[108..115].copy_from_slice(uid.as_bytes());
            let gid = format!("{:07o}", nix::unistd::getgid().as_raw());
            header[116..123].copy_from_slice(gid.as_bytes());

            let size = format!("{:011o}", content.len());
            header[124..135].copy_from_slice(size.as_bytes());
            header[136..147].copy_from_slice(b"00000000000");
            header[156] = b'0';
            header[257..262].copy_from_slice(b"ustar");
            header[263..265].copy_from_slice(b"00");

            header[148..156].copy_from_slice(b"        ");
            let checksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
            let checksum = format!("{checksum:06o}\0 ");
            header[148..156].copy_from_slice(checksum.as_bytes());

            let mut data = Vec::new();
            data.write_all(&header).unwrap();
            data.write_all(content).unwrap();
            let padding = (512 - (content.len() % 512)) % 512;
            data.extend(std::iter::repeat(0u8).take(padding));
            data.extend_from_slice(&[0u8; 1024]);

            data
        }
    }
}
