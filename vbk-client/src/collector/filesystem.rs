use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::Collector;

#[derive(Clone, Debug, Default)]
pub struct FilesystemOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
}

/// Streams the included directories as one tar archive, with entry names
/// relative to each include root. Symlinks are stored as links unless
/// `follow_symlinks` is set; devices, sockets and fifos are skipped.
pub struct FilesystemCollector {
    include: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
    follow_symlinks: bool,
}

impl FilesystemCollector {
    pub fn new(options: FilesystemOptions) -> Self {
        // excludes are compared against resolved walk paths
        let exclude = options
            .exclude
            .iter()
            .map(|path| {
                let path = PathBuf::from(path);
                path.canonicalize().unwrap_or(path)
            })
            .collect();
        Self {
            include: options.include.iter().map(PathBuf::from).collect(),
            exclude,
            follow_symlinks: options.follow_symlinks,
        }
    }

    fn excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|prefix| path.starts_with(prefix))
    }

    fn add_root<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let root = root
            .canonicalize()
            .with_context(|| format!("unable to resolve include path {:?}", root))?;

        let mut walker = WalkDir::new(&root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            if cancel.is_cancelled() {
                bail!("backup cancelled");
            }

            let entry = entry.map_err(|err| format_err!("walking {:?} failed - {}", root, err))?;
            if entry.depth() == 0 {
                continue; // entries are rooted *below* each include dir
            }

            let full = entry.path();
            if self.excluded(full) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let rel = full
                .strip_prefix(&root)
                .map_err(|err| format_err!("unexpected walk path {:?} - {}", full, err))?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                builder
                    .append_dir(rel, full)
                    .with_context(|| format!("archiving directory {:?} failed", full))?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(full)
                    .with_context(|| format!("reading symlink {:?} failed", full))?;
                let metadata = std::fs::symlink_metadata(full)?;
                let mut header = tar::Header::new_gnu();
                header.set_metadata(&metadata);
                header.set_size(0);
                builder
                    .append_link(&mut header, rel, &target)
                    .with_context(|| format!("archiving symlink {:?} failed", full))?;
            } else if file_type.is_file() {
                builder
                    .append_path_with_name(full, rel)
                    .with_context(|| format!("archiving file {:?} failed", full))?;
            }
            // anything else (device, socket, fifo) is skipped
        }

        Ok(())
    }
}

impl Collector for FilesystemCollector {
    fn collect(
        &self,
        _job: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if self.include.is_empty() {
            return Ok(());
        }

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(self.follow_symlinks);

        for root in &self.include {
            self.add_root(&mut builder, root, cancel)?;
        }

        builder.finish().context("finishing tar stream failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn collect_to_vec(collector: &FilesystemCollector) -> Vec<u8> {
        let mut out = Vec::new();
        collector.collect("job", &mut out, &CancellationToken::new()).unwrap();
        out
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_relative_names_and_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/nested.txt"), b"nested").unwrap();

        let collector = FilesystemCollector::new(FilesystemOptions {
            include: vec![dir.path().to_string_lossy().into_owned()],
            ..Default::default()
        });

        let data = collect_to_vec(&collector);
        let names = entry_names(&data);
        assert!(names.contains(&"hello.txt".to_string()));
        assert!(names.contains(&"sub/nested.txt".to_string()));
        assert!(names.iter().all(|n| !n.starts_with('/')));

        let mut archive = tar::Archive::new(&data[..]);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "hello.txt" {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                assert_eq!(content, "hello world");
            }
        }
    }

    #[test]
    fn test_exclude_drops_subtree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();
        std::fs::create_dir(dir.path().join("skip")).unwrap();
        std::fs::write(dir.path().join("skip/drop.txt"), b"drop").unwrap();

        let root = dir.path().canonicalize().unwrap();
        let collector = FilesystemCollector::new(FilesystemOptions {
            include: vec![root.to_string_lossy().into_owned()],
            exclude: vec![root.join("skip").to_string_lossy().into_owned()],
            ..Default::default()
        });

        let names = entry_names(&collect_to_vec(&collector));
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("skip")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_stored_as_link() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"t").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link.txt")).unwrap();

        let collector = FilesystemCollector::new(FilesystemOptions {
            include: vec![dir.path().to_string_lossy().into_owned()],
            ..Default::default()
        });

        let data = collect_to_vec(&collector);
        let mut archive = tar::Archive::new(&data[..]);
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "link.txt" {
                assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
                assert_eq!(
                    entry.link_name().unwrap().unwrap().to_string_lossy(),
                    "target.txt"
                );
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_cancelled_walk_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let collector = FilesystemCollector::new(FilesystemOptions {
            include: vec![dir.path().to_string_lossy().into_owned()],
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        assert!(collector.collect("job", &mut out, &cancel).is_err());
    }
}
