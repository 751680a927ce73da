//! Tree walking, whole-file mapping and permission helpers.

use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use walkdir::WalkDir;

use crate::error::{Error, Result, ResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories and symlinks).
    pub size: u64,
    pub mode: u32,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Symlinks are reported as such, never followed. Paths use forward slashes.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let root = root.canonicalize().at(root)?;
    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root.as_path()).to_path_buf();
            Error::io(path, io::Error::from(e))
        })?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path.strip_prefix(&root).unwrap_or(&full_path);
        let relative_path = relative
            .to_str()
            .ok_or_else(|| {
                Error::io(
                    &full_path,
                    io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 path"),
                )
            })?
            .replace('\\', "/");

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry
            .metadata()
            .map_err(|e| Error::io(&full_path, io::Error::from(e)))?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path,
            kind,
            full_path,
            size,
            mode: mode_of(&meta),
        });
    }

    Ok(entries)
}

/// Read-only view of a whole file, memory-mapped unless it is empty.
pub enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Empty => &[],
        }
    }
}

pub fn map_file(path: &Path) -> Result<FileBytes> {
    let file = File::open(path).at(path)?;
    if file.metadata().at(path)?.len() == 0 {
        return Ok(FileBytes::Empty);
    }
    // SAFETY: read-only mapping; nothing in this process writes the file while it is mapped.
    let map = unsafe { Mmap::map(&file) }.at(path)?;
    Ok(FileBytes::Mapped(map))
}

/// Absolute destinations are taken as-is, relative ones hang off `target`.
pub fn resolve(target: &Path, dst: &str) -> PathBuf {
    let dst = Path::new(dst);
    if dst.is_absolute() {
        dst.to_path_buf()
    } else {
        target.join(dst)
    }
}

/// `path` with `.new` appended to its file name.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".new");
    path.with_file_name(name)
}

#[cfg(unix)]
pub fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn mode_of(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).at(path)
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path).at(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).at(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_reports_kinds_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"12345").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", dir.path().join("sub/link")).unwrap();

        let entries = walk_directory(dir.path()).unwrap();
        let find = |p: &str| entries.iter().find(|e| e.relative_path == p).unwrap();
        assert_eq!(find("sub").kind, EntryKind::Dir);
        assert_eq!(find("sub/deep").kind, EntryKind::Dir);
        assert_eq!(find("sub/a.txt").size, 5);
        #[cfg(unix)]
        assert_eq!(find("sub/link").kind, EntryKind::Symlink);
    }

    #[test]
    fn test_map_empty_and_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        fs::write(&empty, b"").unwrap();
        fs::write(&full, b"bytes").unwrap();
        assert!(map_file(&empty).unwrap().is_empty());
        assert_eq!(&map_file(&full).unwrap()[..], b"bytes");
    }

    #[test]
    fn test_resolve_and_staging_path() {
        assert_eq!(resolve(Path::new("/opt/app"), "bin/x"), PathBuf::from("/opt/app/bin/x"));
        assert_eq!(resolve(Path::new("/opt/app"), "/etc/x.conf"), PathBuf::from("/etc/x.conf"));
        assert_eq!(staging_path(Path::new("/opt/app/bin/x")), PathBuf::from("/opt/app/bin/x.new"));
    }
}
