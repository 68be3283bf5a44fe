use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-process counter so concurrent writers in one process never share a temp name.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_sibling(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn rename_into_place(temp_path: &Path, path: &Path) -> io::Result<()> {
    match fs::rename(temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // On Windows, rename can fail if target exists. Try copy + remove as fallback.
            if cfg!(windows) {
                fs::copy(temp_path, path)?;
                let _ = fs::remove_file(temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(temp_path);
                Err(e)
            }
        }
    }
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// The file will either have the old contents or the new contents, never a
/// partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    // Temp file lives in the same directory so the rename stays on one filesystem
    let temp_path = temp_sibling(path);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    rename_into_place(&temp_path, path)
}

/// Atomically copy `src` to `dest` (copy to a sibling temp file, then rename).
///
/// # Errors
/// Returns an error if the copy or rename fails.
pub fn atomic_copy(src: &Path, dest: &Path) -> io::Result<()> {
    let temp_path = temp_sibling(dest);
    if let Err(e) = fs::copy(src, &temp_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    rename_into_place(&temp_path, dest)
}

/// Create `path` and any missing parents.
///
/// Returns the first (outermost) directory that had to be created, or `None`
/// if `path` already existed.
///
/// # Errors
/// Returns an error if a directory cannot be created.
pub fn mkdirp(path: &Path) -> io::Result<Option<PathBuf>> {
    if path.is_dir() {
        return Ok(None);
    }

    let mut first_missing = path.to_path_buf();
    let mut cursor = path.parent();
    while let Some(parent) = cursor {
        if parent.as_os_str().is_empty() || parent.exists() {
            break;
        }
        first_missing = parent.to_path_buf();
        cursor = parent.parent();
    }

    fs::create_dir_all(path)?;
    Ok(Some(first_missing))
}

/// Check whether `child` is `parent` or lies beneath it, lexically.
#[must_use]
pub fn path_is_inside(child: &Path, parent: &Path) -> bool {
    child.starts_with(parent)
}

/// Recursively change ownership of `path` and everything beneath it.
///
/// Symlinks are re-owned themselves and never followed.
///
/// # Errors
/// Returns the first ownership or traversal error encountered.
#[cfg(unix)]
pub fn chownr(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    use std::os::unix::fs::lchown;

    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        lchown(entry.path(), Some(uid), Some(gid))?;
    }
    Ok(())
}

/// Ownership is not managed on this platform.
///
/// # Errors
/// Never fails.
#[cfg(not(unix))]
pub fn chownr(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        // Overwrite
        atomic_write(&path, b"world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "world");
    }

    #[test]
    fn test_atomic_write_no_temp_left_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        atomic_write(&path, b"content").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].as_ref().unwrap().file_name().to_str().unwrap(),
            "test.txt"
        );
    }

    #[test]
    fn test_atomic_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        fs::write(&src, b"payload").unwrap();

        atomic_copy(&src, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(src.exists());
    }

    #[test]
    fn test_mkdirp_reports_first_created() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("c");

        let made = mkdirp(&target).unwrap();
        assert_eq!(made, Some(dir.path().join("a")));
        assert!(target.is_dir());

        // Second call creates nothing
        assert_eq!(mkdirp(&target).unwrap(), None);
    }

    #[test]
    fn test_path_is_inside() {
        assert!(path_is_inside(Path::new("/cache/a/b"), Path::new("/cache")));
        assert!(!path_is_inside(Path::new("/cachex/a"), Path::new("/cache")));
        assert!(!path_is_inside(Path::new("/tmp/a"), Path::new("/cache")));
    }

    #[cfg(unix)]
    #[test]
    fn test_chownr_to_current_owner() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("f"), b"1").unwrap();

        let md = fs::metadata(dir.path()).unwrap();
        chownr(dir.path(), md.uid(), md.gid()).unwrap();
        assert_eq!(fs::metadata(nested.join("f")).unwrap().uid(), md.uid());
    }
}
