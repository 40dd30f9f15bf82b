//! Secure file operations shared by the store, verifier and rollback engine
//!
//! All metadata and registry writes go through [`atomic_write`]: data lands
//! in a uniquely named temp file in the destination directory, is fsynced and
//! then renamed over the target, so readers never observe a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::errors::{SnapError, SnapResult};

/// Write `data` to `path` via temp file + fsync + rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> SnapResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SnapError::io_other("atomic write", "target has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| SnapError::io("creating directory", e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(SnapError::io(format!("writing {}", path.display()), e));
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> SnapResult<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| SnapError::serialization(format!("encoding {}", path.display()), e))?;
    atomic_write(path, &data)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> SnapResult<T> {
    let file =
        File::open(path).map_err(|e| SnapError::io(format!("opening {}", path.display()), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| SnapError::serialization(format!("parsing {}", path.display()), e))
}

/// Calculate the SHA256 hash of a file, streaming
pub fn calculate_file_hash(path: &Path) -> SnapResult<String> {
    let file =
        File::open(path).map_err(|e| SnapError::io(format!("opening {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| SnapError::io(format!("hashing {}", path.display()), e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Join a relative path onto `root`, refusing traversal outside it.
pub fn contained_join(root: &Path, relative: &Path) -> SnapResult<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => {
                return Err(SnapError::io_other(
                    "path validation",
                    format!("path traversal attempt detected: {}", relative.display()),
                ))
            }
        }
    }
    Ok(joined)
}

/// Copy a file, creating parent directories of the destination.
pub fn copy_with_parents(src: &Path, dst: &Path) -> SnapResult<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| SnapError::io("creating directory", e))?;
    }
    fs::copy(src, dst).map_err(|e| SnapError::io(format!("copying {}", src.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("registry.json");

        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temp files must not linger");
    }

    #[test]
    fn file_hash_matches_known_digest() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("test.txt");
        fs::write(&file, b"abc").unwrap();

        assert_eq!(
            calculate_file_hash(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn contained_join_rejects_traversal() {
        let root = Path::new("/srv/app");
        assert_eq!(
            contained_join(root, Path::new("src/./main.rs")).unwrap(),
            PathBuf::from("/srv/app/src/main.rs")
        );
        assert!(contained_join(root, Path::new("../../etc/passwd")).is_err());
        assert!(contained_join(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn json_roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("nested").join("value.json");
        write_json_atomic(&file, &vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = read_json(&file).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
