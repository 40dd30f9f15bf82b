//! Project archive codec
//!
//! Snapshots store the project tree as a single zip file. Writing walks the
//! tree with exclusion rules applied; reading either enumerates the central
//! directory (structural check) or extracts entries into a target root.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cancel::CancelToken;
use crate::errors::{SnapError, SnapResult};
use crate::secure_file_ops::contained_join;

/// What to leave out of an archive.
#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    /// Directory or file names skipped wherever they appear.
    names: HashSet<String>,
    /// Absolute paths skipped (e.g. the snapshot storage area).
    paths: Vec<PathBuf>,
    /// Files larger than this are skipped.
    max_file_size: Option<u64>,
}

impl ExclusionRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn max_file_size(mut self, limit: Option<u64>) -> Self {
        self.max_file_size = limit;
        self
    }

    /// Whether `path` is left out by name or by location. Size is not considered.
    pub fn skips_entry(&self, path: &Path) -> bool {
        if self.paths.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        path.file_name()
            .map(|n| self.names.contains(n.to_string_lossy().as_ref()))
            .unwrap_or(false)
    }
}

/// Summary of a written archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub skipped_large: usize,
    pub compressed_bytes: u64,
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn restore_mode(target: &Path, mode: Option<u32>) -> SnapResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| SnapError::io("restoring permissions", e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_mode(_target: &Path, _mode: Option<u32>) -> SnapResult<()> {
    Ok(())
}

/// Archive `root` into `dest`, honouring `rules`. Checks `cancel` between files.
pub fn write_archive(
    root: &Path,
    dest: &Path,
    rules: &ExclusionRules,
    compression_level: u8,
    cancel: &CancelToken,
) -> SnapResult<ArchiveStats> {
    let file = File::create(dest).map_err(|e| SnapError::io("creating archive", e))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let base = if compression_level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(compression_level)))
    };

    let mut stats = ArchiveStats {
        files: 0,
        directories: 0,
        symlinks: 0,
        skipped_large: 0,
        compressed_bytes: 0,
    };

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !rules.skips_entry(entry.path()));

    for entry in walker {
        cancel.check("archive creation")?;

        let entry = entry.map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("walk error"));
            SnapError::io("walking project tree", source)
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|_| SnapError::io_other("archive creation", "entry outside project root"))?;
        let name = entry_name(relative);
        let metadata = entry
            .metadata()
            .map_err(|e| SnapError::io_other("reading metadata", e.to_string()))?;

        if entry.file_type().is_symlink() {
            let link = fs::read_link(path)
                .map_err(|e| SnapError::io(format!("reading link {name}"), e))?;
            zip.add_symlink(name.as_str(), link.to_string_lossy().into_owned(), base.clone())?;
            stats.symlinks += 1;
            continue;
        }

        let mut options = base.clone();
        if let Some(mode) = unix_mode(&metadata) {
            options = options.unix_permissions(mode);
        }

        if metadata.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
            stats.directories += 1;
        } else if metadata.is_file() {
            if let Some(limit) = rules.max_file_size {
                if metadata.len() > limit {
                    debug!("skipping large file {} ({} bytes)", name, metadata.len());
                    stats.skipped_large += 1;
                    continue;
                }
            }
            options = options.large_file(metadata.len() >= u64::from(u32::MAX));
            zip.start_file(name.as_str(), options)?;
            let mut source = BufReader::new(
                File::open(path).map_err(|e| SnapError::io(format!("reading {name}"), e))?,
            );
            io::copy(&mut source, &mut zip)
                .map_err(|e| SnapError::io(format!("archiving {name}"), e))?;
            stats.files += 1;
        } else {
            // Sockets and device files are not captured.
            warn!("skipping non-regular entry {}", name);
        }
    }

    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer).map_err(|e| SnapError::io("flushing archive", e))?;
    let file = writer
        .into_inner()
        .map_err(|e| SnapError::io("flushing archive", e.into_error()))?;
    file.sync_all().map_err(|e| SnapError::io("syncing archive", e))?;

    stats.compressed_bytes = fs::metadata(dest)
        .map_err(|e| SnapError::io("reading archive size", e))?
        .len();
    Ok(stats)
}

/// Enumerate the archive's table of contents without decompressing.
pub fn list_entries(archive_path: &Path) -> SnapResult<Vec<String>> {
    let file = File::open(archive_path).map_err(|e| SnapError::io("opening archive", e))?;
    let archive = ZipArchive::new(BufReader::new(file))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// True when the zip central directory can be read.
pub fn is_readable(archive_path: &Path) -> bool {
    list_entries(archive_path).is_ok()
}

#[cfg(unix)]
fn restore_symlink(link_target: &str, at: &Path) -> SnapResult<()> {
    std::os::unix::fs::symlink(link_target, at)
        .map_err(|e| SnapError::io(format!("restoring link {}", at.display()), e))
}

#[cfg(not(unix))]
fn restore_symlink(link_target: &str, at: &Path) -> SnapResult<()> {
    warn!("symlinks unsupported here, {} -> {link_target} not restored", at.display());
    Ok(())
}

/// Extract every entry into `dest`. Checks `cancel` between entries.
///
/// Symlinks are created last so that no regular entry is ever written
/// through a link restored from the same archive.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancelToken,
) -> SnapResult<usize> {
    let file = File::open(archive_path).map_err(|e| SnapError::io("opening archive", e))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut restored = 0;
    let mut links: Vec<(PathBuf, String)> = Vec::new();

    for index in 0..archive.len() {
        cancel.check("archive extraction")?;

        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            SnapError::io_other(
                "archive extraction",
                format!("unsafe entry path: {}", entry.name()),
            )
        })?;
        let target = contained_join(dest, &relative)?;

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| SnapError::io("creating directory", e))?;
            continue;
        }
        if entry.is_symlink() {
            let mut link_target = String::new();
            entry
                .read_to_string(&mut link_target)
                .map_err(|e| SnapError::io(format!("reading link {}", relative.display()), e))?;
            links.push((target, link_target));
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapError::io("creating directory", e))?;
        }
        let mut out = BufWriter::new(
            File::create(&target)
                .map_err(|e| SnapError::io(format!("restoring {}", relative.display()), e))?,
        );
        io::copy(&mut entry, &mut out)
            .map_err(|e| SnapError::io(format!("restoring {}", relative.display()), e))?;
        drop(out);

        restore_mode(&target, entry.unix_mode())?;
        restored += 1;
    }

    for (at, link_target) in links {
        cancel.check("archive extraction")?;
        if let Some(parent) = at.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapError::io("creating directory", e))?;
        }
        restore_symlink(&link_target, &at)?;
        restored += 1;
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn archive_then_extract_preserves_content() {
        let src = tempdir().unwrap();
        write(src.path(), "src/main.rs", b"fn main() {}");
        write(src.path(), "README.md", b"hello");
        fs::create_dir_all(src.path().join("empty")).unwrap();

        let out = tempdir().unwrap();
        let archive = out.path().join("project.zip");
        let rules = ExclusionRules::new();
        let stats = write_archive(src.path(), &archive, &rules, 6, &CancelToken::new()).unwrap();
        assert_eq!(stats.files, 2);
        assert!(stats.compressed_bytes > 0);

        let dest = tempdir().unwrap();
        let restored = extract_archive(&archive, dest.path(), &CancelToken::new()).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(fs::read(dest.path().join("src/main.rs")).unwrap(), b"fn main() {}");
        assert!(dest.path().join("empty").is_dir());
    }

    #[test]
    fn exclusions_skip_names_paths_and_large_files() {
        let src = tempdir().unwrap();
        write(src.path(), ".git/HEAD", b"ref: refs/heads/main");
        write(src.path(), "node_modules/pkg/index.js", b"x");
        write(src.path(), ".snapshots/old/project.zip", b"zip");
        write(src.path(), "big.bin", &vec![0u8; 2048]);
        write(src.path(), "keep.txt", b"keep");

        let rules = ExclusionRules::new()
            .exclude_names([".git", "node_modules"])
            .exclude_path(src.path().join(".snapshots"))
            .max_file_size(Some(1024));

        let out = tempdir().unwrap();
        let archive = out.path().join("project.zip");
        let stats = write_archive(src.path(), &archive, &rules, 0, &CancelToken::new()).unwrap();
        assert_eq!(stats.skipped_large, 1);

        let names = list_entries(&archive).unwrap();
        assert_eq!(names, vec!["keep.txt".to_string()]);
    }

    #[test]
    fn cancelled_token_stops_archiving() {
        let src = tempdir().unwrap();
        write(src.path(), "a.txt", b"a");
        let token = CancelToken::new();
        token.cancel();

        let out = tempdir().unwrap();
        let dest = out.path().join("p.zip");
        let result = write_archive(src.path(), &dest, &ExclusionRules::new(), 6, &token);
        assert!(matches!(result, Err(SnapError::Cancelled { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_archived_as_links() {
        let src = tempdir().unwrap();
        write(src.path(), "lib/real.js", b"export default 1;");
        std::os::unix::fs::symlink("../lib/real.js", src.path().join("lib/alias.js")).unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        std::os::unix::fs::symlink("../lib", src.path().join("bin/lib")).unwrap();

        let out = tempdir().unwrap();
        let archive = out.path().join("project.zip");
        let rules = ExclusionRules::new();
        let stats = write_archive(src.path(), &archive, &rules, 6, &CancelToken::new()).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks, 2);

        let dest = tempdir().unwrap();
        let restored = extract_archive(&archive, dest.path(), &CancelToken::new()).unwrap();
        assert_eq!(restored, 3);
        let alias = dest.path().join("lib/alias.js");
        assert!(fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&alias).unwrap(), PathBuf::from("../lib/real.js"));
        assert_eq!(fs::read(dest.path().join("bin/lib/real.js")).unwrap(), b"export default 1;");
    }

    #[test]
    fn garbage_file_is_not_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(!is_readable(&path));
    }
}
