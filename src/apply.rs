//! The apply engine: realize a `Patch` against an installed tree.
//!
//! Stages run in a fixed order and each one gates the next: permission
//! normalization, writability and space precheck, pre-patch script, staging
//! into `<dst>.new`, commit by rename, best-effort deletion, post-patch script.
//! Every staged file is verified by checksum before anything is renamed.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::binary_patch::{self, DecodeOptions};
use crate::checksum::{self, Checksum};
use crate::error::{Error, Result, ResultExt};
use crate::ops::{AddFile, AddPath, Patch, PatchFile, SymlinkFile};
use crate::script::{self, ScriptEnv};
use crate::space::{self, DiskSpace, StatvfsSpace};
use crate::stream::{self, DigestWriter};
use crate::util;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Resident page ceiling used when decoding each delta.
    pub max_pages: usize,
    /// Kill hook scripts that run longer than this.
    pub script_timeout: Option<Duration>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            max_pages: usize::MAX,
            script_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_patched: usize,
    /// Patch-file destinations that already had a target checksum.
    pub files_current: usize,
    pub symlinks: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
    pub cleanup_failures: usize,
    pub post_script_failed: bool,
}

/// A verified `.new` file waiting to be renamed over its destination.
#[derive(Debug)]
struct Staged {
    staging: PathBuf,
    dst: PathBuf,
}

struct Progress {
    done_kib: u64,
    total_kib: u64,
}

impl Progress {
    fn advance(&mut self, size: u64) {
        self.done_kib += size.div_ceil(1024);
        if self.total_kib > 0 {
            let pct = (self.done_kib as f64 / self.total_kib as f64 * 100.0).min(100.0);
            log::info!("{pct:.0}%");
        }
    }
}

/// Apply `patch` to the tree at `target`, probing free space with statvfs.
pub fn apply_patch(patch: &mut Patch, target: &Path, opts: &ApplyOptions) -> Result<ApplySummary> {
    apply_patch_with(patch, target, opts, &StatvfsSpace)
}

pub fn apply_patch_with(
    patch: &mut Patch,
    target: &Path,
    opts: &ApplyOptions,
    probe: &dyn DiskSpace,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();

    // 1. make sure we can get into every directory
    normalize_permissions(target);

    // 2. nothing is touched unless the whole patch fits
    let total_kib = space::precheck(target, patch, probe).inspect_err(|e| log::error!("{e}"))?;

    // 3. scripts get an explicit environment
    let env = ScriptEnv::for_patch(patch, target);
    if let Some(command) = patch.prepatch.clone() {
        script::run_script(&command, &env, opts.script_timeout).inspect_err(|e| {
            log::error!("Prepatch script failed, aborting: {e}");
        })?;
    }

    // 4. stage
    log::info!("0%");
    let mut progress = Progress { done_kib: 0, total_kib };
    let mut staged = Vec::new();
    if let Err(err) = stage_writes(patch, target, opts, &mut progress, &mut staged, &mut summary) {
        log::error!("{err}");
        discard(&staged);
        return Err(err);
    }

    // 5. commit
    for item in &staged {
        fs::rename(&item.staging, &item.dst)
            .at(&item.dst)
            .inspect_err(|e| log::error!("Unable to rename {}: {e}", item.staging.display()))?;
    }

    // 6. delete, best effort
    delete_entries(patch, target, &mut summary);

    // 7. post-script failure is only worth a warning now
    if let Some(command) = patch.postpatch.clone() {
        if let Err(err) = script::run_script(&command, &env, opts.script_timeout) {
            log::warn!("Postpatch script failed: {err}");
            summary.post_script_failed = true;
        }
    }

    log::info!("100%");
    Ok(summary)
}

/// Give the owner read, write and search on every directory below `root`.
/// Failures are only logged; later stages report real access problems.
fn normalize_permissions(root: &Path) {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Unable to list {}: {e}", e.path().unwrap_or(root).display());
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            log::debug!("Unable to stat {}", entry.path().display());
            continue;
        };
        let mode = util::mode_of(&meta);
        if mode & 0o700 != 0o700 {
            if let Err(e) = util::set_mode(entry.path(), mode | 0o700) {
                log::debug!("{e}");
            }
        }
    }
}

fn stage_writes(
    patch: &mut Patch,
    target: &Path,
    opts: &ApplyOptions,
    progress: &mut Progress,
    staged: &mut Vec<Staged>,
    summary: &mut ApplySummary,
) -> Result<()> {
    let base = patch.base.clone();

    for op in &mut patch.patch_file {
        match stage_patch_file(&base, op, target, opts, staged)? {
            PatchOutcome::Staged => summary.files_patched += 1,
            PatchOutcome::Current => summary.files_current += 1,
            PatchOutcome::Skipped => {}
        }
        progress.advance(op.size);
    }

    for op in &mut patch.add_path {
        apply_add_path(op, target)?;
        if op.performed {
            summary.dirs_created += 1;
        }
    }

    for op in &mut patch.add_file {
        stage_add_file(&base, op, target, staged)?;
        summary.files_added += 1;
        progress.advance(op.size);
    }

    for op in &mut patch.symlink_file {
        apply_symlink(op, target)?;
        summary.symlinks += 1;
    }

    Ok(())
}

fn discard(staged: &[Staged]) {
    for item in staged {
        if let Err(e) = fs::remove_file(&item.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Unable to remove {}: {e}", item.staging.display());
            }
        }
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(path, e)),
        _ => Ok(()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PatchOutcome {
    Staged,
    /// Already carries one of the target checksums.
    Current,
    /// Optional and absent.
    Skipped,
}

fn stage_patch_file(
    base: &Path,
    op: &mut PatchFile,
    target: &Path,
    opts: &ApplyOptions,
    staged: &mut Vec<Staged>,
) -> Result<PatchOutcome> {
    log::debug!("-> PATCH FILE {}", op.dst);
    let dst = util::resolve(target, &op.dst);

    let Some(current) = checksum::md5_file_if_exists(&dst)? else {
        if op.optional {
            log::debug!("{} is optional and absent, skipping", op.dst);
            return Ok(PatchOutcome::Skipped);
        }
        return Err(Error::MissingFile(dst));
    };

    let Some(index) = op.option_from(&current) else {
        if op.produces(&current) {
            log::debug!("{} is already up to date", op.dst);
            return Ok(PatchOutcome::Current);
        }
        return Err(Error::NoMatchingDelta {
            path: dst,
            checksum: current,
        });
    };

    let option = &mut op.options[index];
    let archive = base.join(&option.src);
    if !archive.is_file() {
        return Err(Error::MissingFile(archive));
    }

    let staging = util::staging_path(&dst);
    remove_stale(&staging)?;
    staged.push(Staged {
        staging: staging.clone(),
        dst: dst.clone(),
    });

    let decode = DecodeOptions {
        max_pages: opts.max_pages,
        pristine: true,
    };
    binary_patch::decode_file(&archive, &dst, &staging, &decode)?;
    util::set_mode(&staging, op.mode)?;

    let actual = checksum::md5_file(&staging)?;
    if actual != option.new_checksum {
        return Err(Error::ChecksumMismatch {
            path: dst,
            expected: option.new_checksum,
            actual,
        });
    }
    option.installed = true;
    Ok(PatchOutcome::Staged)
}

fn apply_add_path(op: &mut AddPath, target: &Path) -> Result<()> {
    log::debug!("-> ADD PATH {}", op.dst);
    let path = util::resolve(target, &op.dst);
    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => {
            if util::mode_of(&meta) & 0o777 != op.mode & 0o777 {
                util::set_mode(&path, op.mode & 0o777)?;
            }
            Ok(())
        }
        Ok(_) => Err(Error::NotADirectory(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&path).at(&path)?;
            util::set_mode(&path, op.mode & 0o777)?;
            op.performed = true;
            Ok(())
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

fn stage_add_file(base: &Path, op: &mut AddFile, target: &Path, staged: &mut Vec<Staged>) -> Result<()> {
    log::debug!("-> ADD FILE {}", op.dst);
    let src = base.join(&op.src);
    let dst = util::resolve(target, &op.dst);
    let staging = util::staging_path(&dst);

    let input = BufReader::with_capacity(256 * 1024, File::open(&src).at(&src)?);
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    remove_stale(&staging)?;
    let output = File::create(&staging).at(&staging)?;
    staged.push(Staged {
        staging: staging.clone(),
        dst: dst.clone(),
    });

    let mut writer = DigestWriter::new(BufWriter::new(output));
    if stream::is_zstd_file(&src)? {
        zstd::stream::copy_decode(input, &mut writer).map_err(|e| Error::corrupt(&src, e.to_string()))?;
    } else {
        let mut input = input;
        io::copy(&mut input, &mut writer).at(&staging)?;
    }
    let (mut output, actual, _) = writer.finish();
    output.flush().at(&staging)?;
    drop(output);
    util::set_mode(&staging, op.mode)?;

    if actual != op.checksum {
        return Err(Error::ChecksumMismatch {
            path: dst,
            expected: op.checksum,
            actual,
        });
    }
    op.performed = true;
    Ok(())
}

fn apply_symlink(op: &mut SymlinkFile, target: &Path) -> Result<()> {
    log::debug!("-> SYMLINK FILE {} -> {}", op.dst, op.link);
    let path = util::resolve(target, &op.dst);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    remove_stale(&path)?;
    make_symlink(&op.link, &path)?;
    op.performed = true;
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, path).at(path)
}

#[cfg(not(unix))]
fn make_symlink(_link: &str, path: &Path) -> Result<()> {
    Err(Error::io(
        path,
        io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported on this platform"),
    ))
}

fn relative_to(target: &Path, path: &Path) -> String {
    path.strip_prefix(target)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn delete_entries(patch: &mut Patch, target: &Path, summary: &mut ApplySummary) {
    for op in &patch.del_file {
        log::debug!("-> DEL FILE {}", op.dst);
        let path = util::resolve(target, &op.dst);
        match fs::remove_file(&path) {
            Ok(()) => {
                patch.removed_paths.push(relative_to(target, &path));
                summary.files_deleted += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} already gone", path.display());
            }
            Err(e) => {
                log::warn!("Unable to remove {}: {e}", path.display());
                summary.cleanup_failures += 1;
            }
        }
    }

    for op in &patch.del_path {
        log::debug!("-> DEL PATH {}", op.dst);
        let path = util::resolve(target, &op.dst);
        let failures = remove_tree(&path, target, &mut patch.removed_paths);
        if failures == 0 {
            summary.dirs_deleted += 1;
        }
        summary.cleanup_failures += failures;
    }
}

/// Remove `root` recursively, recording each removed path. Returns the
/// number of entries that could not be removed.
fn remove_tree(root: &Path, target: &Path, removed: &mut Vec<String>) -> usize {
    if fs::symlink_metadata(root).is_err() {
        log::debug!("{} already gone", root.display());
        return 0;
    }

    let mut failures = 0;
    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Unable to list {}: {e}", e.path().unwrap_or(root).display());
                failures += 1;
                continue;
            }
        };
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => removed.push(relative_to(target, path)),
            Err(e) => {
                log::warn!("Unable to remove {}: {e}", path.display());
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{DelFile, DelPath, DeltaOption};
    use crate::space::FixedSpace;
    use tempfile::TempDir;

    fn empty_patch(base: &Path) -> Patch {
        Patch::new("game", "1.1", base)
    }

    #[test]
    fn test_add_path_over_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("maps"), b"not a dir").unwrap();
        let mut op = AddPath {
            dst: "maps".into(),
            mode: 0o755,
            performed: false,
        };
        assert!(matches!(apply_add_path(&mut op, dir.path()), Err(Error::NotADirectory(_))));
        assert!(!op.performed);
    }

    #[test]
    fn test_existing_directory_is_not_performed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("maps")).unwrap();
        let mut op = AddPath {
            dst: "maps".into(),
            mode: 0o755,
            performed: false,
        };
        apply_add_path(&mut op, dir.path()).unwrap();
        assert!(!op.performed);
    }

    #[test]
    fn test_remove_tree_records_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("old/sub")).unwrap();
        fs::write(dir.path().join("old/sub/a"), b"a").unwrap();
        fs::write(dir.path().join("old/b"), b"b").unwrap();

        let mut removed = Vec::new();
        assert_eq!(remove_tree(&dir.path().join("old"), dir.path(), &mut removed), 0);
        assert!(!dir.path().join("old").exists());
        removed.sort();
        assert_eq!(removed, vec!["old", "old/b", "old/sub", "old/sub/a"]);

        assert_eq!(remove_tree(&dir.path().join("old"), dir.path(), &mut removed), 0);
    }

    #[test]
    fn test_deletions_are_best_effort() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("obsolete.cfg"), b"x").unwrap();
        let mut patch = empty_patch(dir.path());
        patch.del_file.push(DelFile { dst: "obsolete.cfg".into() });
        patch.del_file.push(DelFile { dst: "never-existed".into() });
        patch.del_path.push(DelPath { dst: "no-such-dir".into() });

        let mut summary = ApplySummary::default();
        delete_entries(&mut patch, dir.path(), &mut summary);
        assert_eq!(summary.files_deleted, 1);
        assert_eq!(summary.cleanup_failures, 0);
        assert_eq!(patch.removed_paths, vec!["obsolete.cfg"]);
    }

    #[test]
    fn test_no_matching_delta_leaves_tree_untouched() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("game");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("bin"), b"unknown build").unwrap();

        let mut patch = empty_patch(&dir.path().join("data"));
        patch.patch_file.push(PatchFile {
            dst: "bin".into(),
            mode: 0o755,
            size: 10,
            options: vec![DeltaOption {
                old_checksum: Checksum::of(b"A"),
                src: "bin.0".into(),
                new_checksum: Checksum::of(b"B"),
                installed: false,
            }],
            optional: false,
        });

        let err = apply_patch_with(&mut patch, &target, &ApplyOptions::default(), &FixedSpace(u64::MAX))
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchingDelta { .. }));
        assert_eq!(fs::read(target.join("bin")).unwrap(), b"unknown build");
        assert!(!target.join("bin.new").exists());
    }

    #[test]
    fn test_already_current_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bin"), b"B").unwrap();
        let mut op = PatchFile {
            dst: "bin".into(),
            mode: 0o755,
            size: 1,
            options: vec![DeltaOption {
                old_checksum: Checksum::of(b"A"),
                src: "bin.0".into(),
                new_checksum: Checksum::of(b"B"),
                installed: false,
            }],
            optional: false,
        };
        let mut staged = Vec::new();
        let outcome =
            stage_patch_file(dir.path(), &mut op, dir.path(), &ApplyOptions::default(), &mut staged).unwrap();
        assert_eq!(outcome, PatchOutcome::Current);
        assert!(staged.is_empty());
    }
}
