//! Tarball packing and extraction.

use crate::error::{CacheError, IoResultExt, Result};
use crate::registry::Manifest;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use walkdir::WalkDir;

/// Directories never included when packing a package directory.
const SKIP_DIRS: &[&str] = &[".git", "node_modules"];

/// Unpack `tgz` into a scratch directory and read its `package.json`.
///
/// # Errors
/// [`CacheError::BadPackage`] if the archive cannot be unpacked or holds no
/// readable `package.json`.
pub fn read_manifest(tgz: &Path, scratch_root: &Path) -> Result<Manifest> {
    fs::create_dir_all(scratch_root).with_path(scratch_root)?;
    let scratch = tempfile::Builder::new()
        .prefix("unpack-")
        .tempdir_in(scratch_root)
        .with_path(scratch_root)?;

    let file = File::open(tgz).with_path(tgz)?;
    extract_to(BufReader::new(file), scratch.path())
        .map_err(|e| CacheError::bad_package(format!("{}: {e}", tgz.display())))?;

    let root = find_extracted_root(scratch.path())?;
    let pkg_json = root.join("package.json");
    let bytes = fs::read(&pkg_json).map_err(|e| {
        CacheError::bad_package(format!("{}: no package.json ({e})", tgz.display()))
    })?;
    Manifest::from_slice(&bytes)
        .map_err(|e| CacheError::bad_package(format!("{}: {e}", pkg_json.display())))
}

/// Extract `tgz` into `dest`, replacing whatever is there.
///
/// Extraction happens in a sibling temp directory which is then renamed into
/// place, so `dest` never holds a partial tree.
///
/// # Errors
/// Archive, path-safety and file errors.
pub fn extract_tgz_atomic(tgz: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| CacheError::bad_package(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(parent).with_path(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .with_path(parent)?;

    let file = File::open(tgz).with_path(tgz)?;
    extract_to(BufReader::new(file), staging.path())
        .map_err(|e| CacheError::bad_package(format!("{}: {e}", tgz.display())))?;
    let root = find_extracted_root(staging.path())?;

    if dest.exists() {
        fs::remove_dir_all(dest).with_path(dest)?;
    }
    match fs::rename(&root, dest) {
        Ok(()) => Ok(()),
        Err(_) => copy_dir_all(&root, dest).with_path(dest),
    }
}

/// Pack `src` into a gzipped tarball at `dest` with every entry under `package/`.
///
/// # Errors
/// File errors while walking or writing.
pub fn pack_directory(src: &Path, dest: &Path) -> Result<()> {
    let out = File::create(dest).with_path(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && e.file_name().to_str().is_some_and(|n| SKIP_DIRS.contains(&n)))
        });

    for entry in walker {
        let entry = entry.map_err(|e| CacheError::io(src, io::Error::from(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .unwrap_or_else(|_| entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = Path::new("package").join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder
                .append_dir(&name, entry.path())
                .with_path(entry.path())?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(entry.path(), &name)
                .with_path(entry.path())?;
        }
        // Symlinks are not packed
    }

    let encoder = builder.into_inner().with_path(dest)?;
    let writer = encoder.finish().with_path(dest)?;
    writer
        .into_inner()
        .map_err(|e| CacheError::io(dest, e.into_error()))?
        .sync_all()
        .with_path(dest)
}

fn extract_to<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let shown = path.to_string_lossy().into_owned();

        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe path in archive: {shown}"),
            ));
        }

        let dest_path = dest.join(&path);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if kind.is_file() {
            let mut file = File::create(&dest_path)?;
            io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    // Never extract setuid/setgid bits
                    let _ = fs::set_permissions(
                        &dest_path,
                        fs::Permissions::from_mode((mode | 0o600) & 0o777),
                    );
                }
            }
        }
        // Links and special entries are skipped
    }

    Ok(())
}

/// The single top-level directory of an unpacked tarball (`package/` usually).
fn find_extracted_root(dir: &Path) -> Result<PathBuf> {
    let package = dir.join("package");
    if package.is_dir() {
        return Ok(package);
    }

    let dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_path(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();

    match dirs.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(CacheError::bad_package("tarball has no top-level directory")),
        many => Err(CacheError::bad_package(format!(
            "tarball has {} top-level directories, expected 1",
            many.len()
        ))),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &to)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}
