//! Patch construction: the `PatchBuilder` precedence map and the tree differ
//! that feeds it.

use anyhow::{bail, Context};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::binary_diff::{self, EncodeOptions, EncodeReport};
use crate::checksum::{self, Checksum};
use crate::error::{Error, Result, ResultExt};
use crate::ops::{AddFile, AddPath, DelFile, DelPath, DeltaOption, Patch, PatchFile, SymlinkFile};
use crate::util::{self, DirEntry, EntryKind};

/// zstd level for whole-file payloads.
pub const PAYLOAD_LEVEL: i32 = 19;

/// Formats that are already compressed only get a cheap zstd frame.
fn payload_level(path: &Path) -> i32 {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let packed = matches!(
        ext.as_deref(),
        Some(
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif"
                | "mp3" | "ogg" | "opus" | "flac" | "mp4" | "mkv" | "webm"
                | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar" | "jar"
                | "woff" | "woff2" | "pdf"
        )
    );
    if packed { 1 } else { PAYLOAD_LEVEL }
}

#[derive(Debug, Clone)]
enum Entry {
    AddPath(AddPath),
    AddFile(AddFile),
    PatchFile(PatchFile),
    Symlink(SymlinkFile),
    DelFile(DelFile),
    DelPath(DelPath),
}

impl Entry {
    fn dst(&self) -> &str {
        match self {
            Entry::AddPath(op) => &op.dst,
            Entry::AddFile(op) => &op.dst,
            Entry::PatchFile(op) => &op.dst,
            Entry::Symlink(op) => &op.dst,
            Entry::DelFile(op) => &op.dst,
            Entry::DelPath(op) => &op.dst,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Entry::AddPath(_) => "ADD PATH",
            Entry::AddFile(_) => "ADD FILE",
            Entry::PatchFile(_) => "PATCH FILE",
            Entry::Symlink(_) => "SYMLINK FILE",
            Entry::DelFile(_) => "DEL FILE",
            Entry::DelPath(_) => "DEL PATH",
        }
    }
}

/// Outcome of asking the builder for a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaPlan {
    /// Generate the delta into this store-relative path.
    Generate(String),
    /// An ADD FILE for the path already covers it.
    SupersededByAdd,
    /// Old and new are identical; any existing entry became optional.
    Unchanged,
    /// This exact (old, new) pair is already in the patch.
    Duplicate,
}

/// Patch under construction: an insertion-ordered list of entries plus a
/// destination index, so each path carries at most one operation.
pub struct PatchBuilder {
    patch: Patch,
    entries: Vec<Option<Entry>>,
    by_dst: HashMap<String, usize>,
}

impl PatchBuilder {
    /// Start from the metadata of `patch` and any operations it already carries.
    pub fn from_patch(mut patch: Patch) -> Result<Self> {
        let existing: Vec<Entry> = patch
            .add_path
            .drain(..)
            .map(Entry::AddPath)
            .chain(patch.add_file.drain(..).map(Entry::AddFile))
            .chain(patch.patch_file.drain(..).map(Entry::PatchFile))
            .chain(patch.symlink_file.drain(..).map(Entry::Symlink))
            .chain(patch.del_file.drain(..).map(Entry::DelFile))
            .chain(patch.del_path.drain(..).map(Entry::DelPath))
            .collect();

        let mut builder = Self {
            patch,
            entries: Vec::with_capacity(existing.len()),
            by_dst: HashMap::with_capacity(existing.len()),
        };
        for entry in existing {
            let dst = entry.dst().to_string();
            if let Some(prev) = builder.lookup(&dst) {
                return Err(Error::conflict(&dst, format!("listed as both {} and {}", prev.describe(), entry.describe())));
            }
            builder.push(dst, entry);
        }
        Ok(builder)
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// Whether `dst` still carries a delta option stored at `src`.
    pub fn has_delta(&self, dst: &str, src: &str) -> bool {
        matches!(self.lookup(dst), Some(Entry::PatchFile(op)) if op.options.iter().any(|o| o.src == src))
    }

    pub fn has_add_file(&self, dst: &str) -> bool {
        matches!(self.lookup(dst), Some(Entry::AddFile(_)))
    }

    fn lookup(&self, dst: &str) -> Option<&Entry> {
        self.by_dst.get(dst).and_then(|&i| self.entries[i].as_ref())
    }

    fn lookup_mut(&mut self, dst: &str) -> Option<&mut Entry> {
        let i = *self.by_dst.get(dst)?;
        self.entries[i].as_mut()
    }

    fn push(&mut self, dst: String, entry: Entry) {
        self.by_dst.insert(dst, self.entries.len());
        self.entries.push(Some(entry));
    }

    fn remove(&mut self, dst: &str) {
        if let Some(i) = self.by_dst.remove(dst) {
            self.entries[i] = None;
        }
    }

    /// Drop whatever sits at `dst` if `supersedes` allows it, else refuse.
    fn claim(&mut self, dst: &str, what: &str, supersedes: impl Fn(&Entry) -> bool) -> Result<()> {
        if let Some(existing) = self.lookup(dst) {
            if !supersedes(existing) {
                return Err(Error::conflict(dst, format!("cannot {what}, already {}", existing.describe())));
            }
            self.remove(dst);
        }
        if let Some(parent) = self.deleted_ancestor(dst) {
            return Err(Error::conflict(dst, format!("cannot {what} inside deleted path {parent}")));
        }
        Ok(())
    }

    fn deleted_ancestor(&self, dst: &str) -> Option<String> {
        let mut path = Path::new(dst).parent();
        while let Some(p) = path.filter(|p| !p.as_os_str().is_empty()) {
            let key = p.to_string_lossy();
            if let Some(Entry::DelPath(op)) = self.lookup(&key) {
                return Some(op.dst.clone());
            }
            path = p.parent();
        }
        None
    }

    pub fn add_path(&mut self, dst: &str, mode: u32) -> Result<()> {
        log::debug!("-> ADD PATH {dst}");
        self.claim(dst, "add path", |e| matches!(e, Entry::AddPath(_)))?;
        self.push(
            dst.to_string(),
            Entry::AddPath(AddPath {
                dst: dst.to_string(),
                mode,
                performed: false,
            }),
        );
        Ok(())
    }

    /// Register a whole-file add; the payload is expected at `base/dst`.
    pub fn add_file(&mut self, dst: &str, checksum: Checksum, mode: u32, size: u64) -> Result<()> {
        log::debug!("-> ADD FILE {dst}");
        self.claim(dst, "add file", |e| {
            matches!(e, Entry::AddFile(_) | Entry::Symlink(_) | Entry::PatchFile(_))
        })?;
        self.push(
            dst.to_string(),
            Entry::AddFile(AddFile {
                dst: dst.to_string(),
                src: dst.to_string(),
                checksum,
                mode,
                size,
                performed: false,
            }),
        );
        Ok(())
    }

    pub fn symlink(&mut self, dst: &str, link: &str) -> Result<()> {
        log::debug!("-> SYMLINK FILE {dst} -> {link}");
        self.claim(dst, "add symlink", |e| matches!(e, Entry::AddFile(_) | Entry::Symlink(_)))?;
        self.push(
            dst.to_string(),
            Entry::Symlink(SymlinkFile {
                dst: dst.to_string(),
                link: link.to_string(),
                performed: false,
            }),
        );
        Ok(())
    }

    /// Register a delta from `old` to `new` for `dst`.
    pub fn patch_file(
        &mut self,
        dst: &str,
        old: Checksum,
        new: Checksum,
        mode: u32,
        size: u64,
    ) -> Result<DeltaPlan> {
        match self.lookup(dst) {
            Some(Entry::AddFile(_)) => return Ok(DeltaPlan::SupersededByAdd),
            Some(Entry::PatchFile(_)) | None => {}
            Some(other) => {
                return Err(Error::conflict(dst, format!("cannot patch file, already {}", other.describe())));
            }
        }

        if old == new {
            if let Some(Entry::PatchFile(op)) = self.lookup_mut(dst) {
                op.optional = true;
            }
            return Ok(DeltaPlan::Unchanged);
        }

        if let Some(Entry::PatchFile(op)) = self.lookup(dst) {
            if op.options.iter().any(|o| o.old_checksum == old && o.new_checksum == new) {
                return Ok(DeltaPlan::Duplicate);
            }
        }
        if let Some(parent) = self.deleted_ancestor(dst) {
            return Err(Error::conflict(dst, format!("cannot patch file inside deleted path {parent}")));
        }

        log::debug!("-> PATCH FILE {dst}");
        let src = self.next_delta_name(dst);
        let option = DeltaOption {
            old_checksum: old,
            src: src.clone(),
            new_checksum: new,
            installed: false,
        };
        match self.lookup_mut(dst) {
            Some(Entry::PatchFile(op)) => {
                op.size = op.size.max(size);
                op.mode = mode;
                op.options.push(option);
            }
            _ => self.push(
                dst.to_string(),
                Entry::PatchFile(PatchFile {
                    dst: dst.to_string(),
                    mode,
                    size,
                    options: vec![option],
                    optional: false,
                }),
            ),
        }
        Ok(DeltaPlan::Generate(src))
    }

    /// First `dst.N` not used by an option or already present in the store.
    fn next_delta_name(&self, dst: &str) -> String {
        let taken: BTreeSet<&str> = match self.lookup(dst) {
            Some(Entry::PatchFile(op)) => op.options.iter().map(|o| o.src.as_str()).collect(),
            _ => BTreeSet::new(),
        };
        (0..)
            .map(|n| format!("{dst}.{n}"))
            .find(|name| !taken.contains(name.as_str()) && !self.patch.store_path(name).exists())
            .unwrap_or_else(|| format!("{dst}.0"))
    }

    pub fn del_file(&mut self, dst: &str) -> Result<()> {
        match self.lookup(dst) {
            Some(Entry::DelFile(_)) => return Ok(()),
            Some(other) => {
                return Err(Error::conflict(dst, format!("cannot delete file, already {}", other.describe())));
            }
            None => {}
        }
        log::debug!("-> DEL FILE {dst}");
        self.push(dst.to_string(), Entry::DelFile(DelFile { dst: dst.to_string() }));
        Ok(())
    }

    pub fn del_path(&mut self, dst: &str) -> Result<()> {
        let prefix = format!("{dst}/");
        for (path, &i) in &self.by_dst {
            if path != dst && !path.starts_with(&prefix) {
                continue;
            }
            match &self.entries[i] {
                Some(Entry::DelPath(_)) if path == dst => return Ok(()),
                Some(Entry::DelPath(_)) | None => {}
                Some(other) => {
                    return Err(Error::conflict(
                        dst,
                        format!("cannot delete path, {path} is {}", other.describe()),
                    ));
                }
            }
        }
        log::debug!("-> DEL PATH {dst}");
        self.push(dst.to_string(), Entry::DelPath(DelPath { dst: dst.to_string() }));
        Ok(())
    }

    /// Entry counts per kind; delta fields are left for the caller.
    pub fn tally(&self) -> CreateSummary {
        let mut summary = CreateSummary::default();
        for entry in self.entries.iter().flatten() {
            match entry {
                Entry::AddPath(_) => summary.dirs_added += 1,
                Entry::AddFile(_) => summary.files_added += 1,
                Entry::PatchFile(_) => summary.files_patched += 1,
                Entry::Symlink(_) => summary.symlinks += 1,
                Entry::DelFile(_) => summary.files_deleted += 1,
                Entry::DelPath(_) => summary.dirs_deleted += 1,
            }
        }
        summary
    }

    /// Lay the entries out into the patch's per-kind lists, in insertion order.
    pub fn finish(mut self) -> Patch {
        for entry in self.entries.into_iter().flatten() {
            match entry {
                Entry::AddPath(op) => self.patch.add_path.push(op),
                Entry::AddFile(op) => self.patch.add_file.push(op),
                Entry::PatchFile(op) => self.patch.patch_file.push(op),
                Entry::Symlink(op) => self.patch.symlink_file.push(op),
                Entry::DelFile(op) => self.patch.del_file.push(op),
                Entry::DelPath(op) => self.patch.del_path.push(op),
            }
        }
        self.patch
    }
}

/// Compress `source` into the store at `store_path`.
pub fn store_payload(source: &Path, store_path: &Path) -> Result<()> {
    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    let input = fs::File::open(source).at(source)?;
    let output = BufWriter::new(fs::File::create(store_path).at(store_path)?);
    let mut encoder = zstd::stream::write::Encoder::new(output, payload_level(source)).at(store_path)?;
    std::io::copy(&mut std::io::BufReader::with_capacity(256 * 1024, input), &mut encoder).at(store_path)?;
    encoder.finish().at(store_path)?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSummary {
    pub dirs_added: usize,
    pub files_added: usize,
    pub files_patched: usize,
    /// Deltas generated by this run.
    pub deltas: usize,
    pub deltas_without_overlap: usize,
    pub symlinks: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

struct DeltaJob {
    dst: String,
    src: String,
    old_path: PathBuf,
    new_path: PathBuf,
    out: PathBuf,
}

fn read_link(entry: &DirEntry) -> Result<String> {
    let target = fs::read_link(&entry.full_path).at(&entry.full_path)?;
    Ok(target.to_string_lossy().into_owned())
}

fn index(entries: &[DirEntry]) -> HashMap<&str, &DirEntry> {
    entries.iter().map(|e| (e.relative_path.as_str(), e)).collect()
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Compare every tree in `old_dirs` against `new_dir` and add the
/// differences to `builder`, writing payloads and deltas into its store.
/// Walks run on blocking tasks; hashing and delta generation fan out over rayon.
pub async fn create_patch(
    builder: &mut PatchBuilder,
    old_dirs: &[PathBuf],
    new_dir: &Path,
) -> anyhow::Result<CreateSummary> {
    // Stage 1: walk every tree concurrently
    let new_owned = new_dir.to_path_buf();
    let old_owned = old_dirs.to_vec();
    let (new_entries, old_trees) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_directory(&new_owned)),
        tokio::task::spawn_blocking(move || {
            old_owned
                .par_iter()
                .map(|dir| util::walk_directory(dir))
                .collect::<Result<Vec<_>>>()
        }),
    )?;
    let new_entries = new_entries.with_context(|| format!("Failed to walk {}", new_dir.display()))?;
    let old_trees = old_trees.context("Failed to walk old tree")?;

    // Stage 2: hash new files, and old files that have a counterpart
    let new_map = index(&new_entries);
    let mut to_hash: BTreeSet<PathBuf> = BTreeSet::new();
    for old_entries in &old_trees {
        for old in old_entries.iter().filter(|e| e.kind == EntryKind::File) {
            if let Some(new) = new_map.get(old.relative_path.as_str()).filter(|n| n.kind == EntryKind::File) {
                to_hash.insert(old.full_path.clone());
                to_hash.insert(new.full_path.clone());
            }
        }
    }
    for new in new_entries.iter().filter(|e| e.kind == EntryKind::File) {
        to_hash.insert(new.full_path.clone());
    }
    let sums: HashMap<PathBuf, Checksum> = tokio::task::spawn_blocking(move || {
        to_hash
            .into_par_iter()
            .map(|path| checksum::md5_file(&path).map(|sum| (path, sum)))
            .collect::<Result<HashMap<_, _>>>()
    })
    .await??;
    let sum_of = |path: &Path| -> anyhow::Result<Checksum> {
        sums.get(path)
            .copied()
            .with_context(|| format!("No checksum computed for {}", path.display()))
    };

    // Stage 3: sequential builder decisions
    let mut payloads: HashMap<String, PathBuf> = HashMap::new();
    let mut delta_jobs: Vec<DeltaJob> = Vec::new();

    for old_entries in &old_trees {
        let old_map = index(old_entries);

        for new in &new_entries {
            let dst = new.relative_path.as_str();
            match (old_map.get(dst), new.kind) {
                (None, EntryKind::Dir) => builder.add_path(dst, new.mode)?,
                (None, EntryKind::Symlink) => builder.symlink(dst, &read_link(new)?)?,
                (None, EntryKind::File) => {
                    builder.add_file(dst, sum_of(&new.full_path)?, new.mode, new.size)?;
                    payloads.insert(dst.to_string(), new.full_path.clone());
                }
                (Some(old), kind) => match (old.kind, kind) {
                    (EntryKind::Dir, EntryKind::Dir) => {}
                    (EntryKind::Dir, _) | (_, EntryKind::Dir) => {
                        bail!("{dst} is a directory in one tree and a file in the other");
                    }
                    (EntryKind::Symlink, EntryKind::Symlink) => {
                        let link = read_link(new)?;
                        if read_link(old)? != link {
                            builder.symlink(dst, &link)?;
                        }
                    }
                    (_, EntryKind::Symlink) => builder.symlink(dst, &read_link(new)?)?,
                    (EntryKind::Symlink, EntryKind::File) => {
                        builder.add_file(dst, sum_of(&new.full_path)?, new.mode, new.size)?;
                        payloads.insert(dst.to_string(), new.full_path.clone());
                    }
                    (EntryKind::File, EntryKind::File) => {
                        let plan = builder.patch_file(
                            dst,
                            sum_of(&old.full_path)?,
                            sum_of(&new.full_path)?,
                            new.mode,
                            new.size,
                        )?;
                        if let DeltaPlan::Generate(src) = plan {
                            delta_jobs.push(DeltaJob {
                                dst: dst.to_string(),
                                out: builder.patch().store_path(&src),
                                src,
                                old_path: old.full_path.clone(),
                                new_path: new.full_path.clone(),
                            });
                        }
                    }
                },
            }
        }

        // Removals: only the topmost vanished directory, and files outside it.
        for old in old_entries {
            let dst = old.relative_path.as_str();
            if new_map.contains_key(dst) {
                continue;
            }
            let parent_survives = parent_of(dst).map_or(true, |p| new_map.contains_key(p));
            if !parent_survives {
                continue;
            }
            if old.kind == EntryKind::Dir {
                builder.del_path(dst)?;
            } else {
                builder.del_file(dst)?;
            }
        }
    }

    // An ADD FILE decided for a later tree may have superseded an earlier delta.
    delta_jobs.retain(|job| builder.has_delta(&job.dst, &job.src));
    let live_payloads: Vec<(PathBuf, PathBuf)> = payloads
        .into_iter()
        .filter(|(dst, _)| builder.has_add_file(dst))
        .map(|(dst, source)| (source, builder.patch().store_path(&dst)))
        .collect();
    let mut summary = builder.tally();

    // Stage 4: generate payloads and deltas in parallel
    let opts = EncodeOptions {
        pristine: true,
        ..Default::default()
    };
    let (reports, stored) = tokio::try_join!(
        tokio::task::spawn_blocking(move || {
            delta_jobs
                .par_iter()
                .map(|job| -> Result<EncodeReport> {
                    if let Some(parent) = job.out.parent() {
                        fs::create_dir_all(parent).at(parent)?;
                    }
                    binary_diff::encode_file(&job.old_path, &job.new_path, &job.out, &opts)
                })
                .collect::<Result<Vec<_>>>()
        }),
        tokio::task::spawn_blocking(move || {
            live_payloads
                .par_iter()
                .map(|(source, stored)| store_payload(source, stored))
                .collect::<Result<Vec<_>>>()
        }),
    )?;
    let reports = reports.context("Failed to generate delta")?;
    stored.context("Failed to store payload")?;
    summary.deltas = reports.len();
    summary.deltas_without_overlap = reports.iter().filter(|r| r.from_unused).count();

    Ok(summary)
}
