use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{format_err, Context, Error};
use tokio_util::io::{StreamReader, SyncIoBridge};

use vbk_datastore::Store;

use crate::compression::decompress_reader;

#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveRestoreOptions {
    /// Restore only entries below `mysql/`.
    pub mysql_only: bool,
    /// Walk the archive but write nothing.
    pub dry_run: bool,
}

/// Stream an archive object and unpack it below `target`. Compression is
/// detected from the key suffix. Entries whose cleaned name is empty,
/// absolute or escapes upwards are skipped. Returns the number of
/// restored entries.
pub async fn restore_archive(
    store: &Store,
    archive_key: &str,
    target: &Path,
    options: ArchiveRestoreOptions,
) -> Result<usize, Error> {
    let stream = store.get_stream(archive_key).await?;
    let reader = SyncIoBridge::new(StreamReader::new(stream));

    let archive_key = archive_key.to_string();
    let target = target.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let reader = decompress_reader(reader, &archive_key)?;
        extract_entries(reader, &target, options)
            .with_context(|| format!("extracting '{}' failed", archive_key))
    })
    .await
    .map_err(|err| format_err!("restore task failed - {}", err))?
}

/// Reject anything that would land outside the restore root.
fn clean_entry_name(name: &str) -> Option<PathBuf> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => (),
            // absolute or upward escaping names are not restored
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }

    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn extract_entries<R: Read>(
    reader: R,
    target: &Path,
    options: ArchiveRestoreOptions,
) -> Result<usize, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut restored = 0;

    for entry in archive.entries().context("reading tar stream failed")? {
        let mut entry = entry.context("reading tar entry failed")?;

        let raw_name = entry.path().context("tar entry has unreadable name")?;
        let name = match clean_entry_name(&raw_name.to_string_lossy()) {
            Some(name) => name,
            None => {
                log::warn!("skipping tar entry with unsafe name {:?}", raw_name);
                continue;
            }
        };

        if options.mysql_only && !name.starts_with("mysql") {
            continue;
        }

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);
        let dest = target.join(&name);

        match entry_type {
            tar::EntryType::Directory => {
                if !options.dry_run {
                    std::fs::create_dir_all(&dest)?;
                    set_mode(&dest, mode);
                }
                restored += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if options.dry_run {
                    std::io::copy(&mut entry, &mut std::io::sink())?;
                } else {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut file = open_with_mode(&dest, mode)
                        .with_context(|| format!("creating {:?} failed", dest))?;
                    std::io::copy(&mut entry, &mut file)?;
                }
                restored += 1;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| format_err!("symlink entry {:?} without target", name))?;
                if !options.dry_run {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let _ = std::fs::remove_file(&dest);
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&link, &dest)
                        .with_context(|| format!("creating symlink {:?} failed", dest))?;
                }
                restored += 1;
            }
            _ => (), // hardlinks, devices etc. are not restored
        }
    }

    Ok(restored)
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> std::io::Result<std::fs::File> {
    std::fs::File::create(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_entry_name() {
        assert_eq!(clean_entry_name("a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(clean_entry_name("./a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(clean_entry_name(""), None);
        assert_eq!(clean_entry_name("  "), None);
        assert_eq!(clean_entry_name(".."), None);
        assert_eq!(clean_entry_name("../evil"), None);
        assert_eq!(clean_entry_name("a/../../evil"), None);
        assert_eq!(clean_entry_name("/etc/passwd"), None);
        assert_eq!(clean_entry_name("."), None);
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_skips_traversal_entries() {
        let data = tar_with(&[("good.txt", b"ok"), ("../evil.txt", b"bad")]);
        let dir = tempfile::tempdir().unwrap();

        let restored =
            extract_entries(&data[..], dir.path(), ArchiveRestoreOptions::default()).unwrap();
        assert_eq!(restored, 1);
        assert!(dir.path().join("good.txt").exists());
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn test_extract_mysql_only() {
        let data = tar_with(&[("mysql/dump.sql", b"sql"), ("etc/nginx.conf", b"conf")]);
        let dir = tempfile::tempdir().unwrap();

        let restored = extract_entries(
            &data[..],
            dir.path(),
            ArchiveRestoreOptions { mysql_only: true, dry_run: false },
        )
        .unwrap();
        assert_eq!(restored, 1);
        assert!(dir.path().join("mysql/dump.sql").exists());
        assert!(!dir.path().join("etc/nginx.conf").exists());
    }

    #[test]
    fn test_extract_dry_run_writes_nothing() {
        let data = tar_with(&[("a.txt", b"x")]);
        let dir = tempfile::tempdir().unwrap();

        let restored = extract_entries(
            &data[..],
            dir.path(),
            ArchiveRestoreOptions { mysql_only: false, dry_run: true },
        )
        .unwrap();
        assert_eq!(restored, 1);
        assert!(!dir.path().join("a.txt").exists());
    }
}
