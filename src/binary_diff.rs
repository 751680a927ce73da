//! Delta encoder.
//!
//! Matching is rsync-like: the from file is cut into fixed-size blocks whose
//! rolling and strong hashes go into an index, then a rolling window slides
//! over the to file. A window whose rolling digest and BLAKE3 hash both hit a
//! block becomes a copy, which is then grown forwards through the from file
//! and backwards into bytes that were about to become literals. Everything
//! else is literal data, streamed straight into the archive.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use md5::{Digest, Md5};

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::paged::PagedSource;
use crate::patch_format::{Control, DeltaFlags, Header, Instruction, Revision, SourceInfo, MAGIC};
use crate::rolling_hash::RollingHash;
use crate::stream::{self, ArchiveWriter};
use crate::util;

pub const MIN_BLOCK_SIZE: usize = 4;
pub const MAX_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_LEVEL: i32 = 3;

/// Name recorded for the embedded literal-data source.
pub const DATA_SOURCE_NAME: &str = "(patch data)";

/// The data source is always first, the from file (if used) second.
const FROM_SOURCE: u32 = 1;

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// zstd level for the literal and control segments; 0 stores them raw.
    pub level: i32,
    /// Ask the decoder to skip source checksum verification.
    pub no_verify: bool,
    /// Take inputs byte-for-byte even when they look zstd-compressed.
    pub pristine: bool,
    /// Resident page ceiling for the from file.
    pub max_pages: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            no_verify: false,
            pristine: false,
            max_pages: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeReport {
    /// No part of the from file was reused; the delta is all literals.
    pub from_unused: bool,
    pub copies: u32,
    pub copy_length: u64,
    pub literal_length: u64,
    pub instructions: usize,
    pub to_len: u64,
    pub archive_len: u64,
}

/// Smallest power of two whose square covers the from file, within bounds.
pub fn block_size_for(from_len: u64) -> usize {
    let mut size = MIN_BLOCK_SIZE;
    while size < MAX_BLOCK_SIZE && (size as u64) * (size as u64) < from_len {
        size <<= 1;
    }
    size
}

struct BlockSignature {
    strong_hash: blake3::Hash,
    offset: u64,
}

/// Rolling digest -> every full block of the from file with that digest.
struct BlockIndex {
    block_size: usize,
    table: HashMap<u32, Vec<BlockSignature>>,
}

impl BlockIndex {
    fn build(from: &PagedSource) -> Result<Self> {
        let block_size = block_size_for(from.len());
        let full_blocks = from.len() / block_size as u64;
        let mut table: HashMap<u32, Vec<BlockSignature>> = HashMap::with_capacity(full_blocks as usize);

        // Pages are a multiple of every block size, so no block straddles two pages.
        for pgno in 0..from.page_count() {
            let page = from.acquire(pgno)?;
            let page_start = pgno as u64 * crate::paged::PAGE_SIZE as u64;
            for (i, block) in page.chunks_exact(block_size).enumerate() {
                table
                    .entry(RollingHash::over(block).digest())
                    .or_default()
                    .push(BlockSignature {
                        strong_hash: blake3::hash(block),
                        offset: page_start + (i * block_size) as u64,
                    });
            }
        }

        Ok(Self { block_size, table })
    }

    /// Offset of a from block equal to `window`, preferring `hint`.
    fn find(&self, digest: u32, window: &[u8], hint: u64) -> Option<u64> {
        let candidates = self.table.get(&digest)?;
        let strong = blake3::hash(window);
        let mut found = None;
        for sig in candidates.iter().filter(|s| s.strong_hash == strong) {
            if sig.offset == hint {
                return Some(sig.offset);
            }
            found.get_or_insert(sig.offset);
        }
        found
    }
}

/// Accumulates instructions and streams literal bytes into the archive.
struct Emitter<'w, W: Write> {
    out: &'w mut ArchiveWriter<W>,
    instructions: Vec<Instruction>,
    literal_hasher: Md5,
    literal_len: u64,
    inserts: u32,
    copies: u32,
    copy_length: u64,
    last_copy_offset: Option<u64>,
    sequential: bool,
}

impl<'w, W: Write> Emitter<'w, W> {
    fn new(out: &'w mut ArchiveWriter<W>) -> Self {
        Self {
            out,
            instructions: Vec::new(),
            literal_hasher: Md5::new(),
            literal_len: 0,
            inserts: 0,
            copies: 0,
            copy_length: 0,
            last_copy_offset: None,
            sequential: true,
        }
    }

    fn insert(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.out.write_all(bytes)?;
        self.literal_hasher.update(bytes);
        self.literal_len += bytes.len() as u64;

        let length = bytes.len() as u64;
        match self.instructions.last_mut() {
            Some(Instruction::Insert { length: prev }) => *prev += length,
            _ => {
                self.instructions.push(Instruction::Insert { length });
                self.inserts += 1;
            }
        }
        Ok(())
    }

    fn copy(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        if self.last_copy_offset.is_some_and(|last| offset < last) {
            self.sequential = false;
        }
        self.last_copy_offset = Some(offset);
        self.copy_length += length;

        if let Some(Instruction::Copy {
            source: FROM_SOURCE,
            offset: prev_offset,
            length: prev_length,
        }) = self.instructions.last_mut()
        {
            if *prev_offset + *prev_length == offset {
                *prev_length += length;
                return;
            }
        }
        self.instructions.push(Instruction::Copy {
            source: FROM_SOURCE,
            offset,
            length,
        });
        self.copies += 1;
    }
}

/// Scan `to` against `from`, emitting instructions and literal bytes.
fn scan<W: Write>(from: &PagedSource, to: &[u8], emit: &mut Emitter<'_, W>) -> Result<()> {
    let index = BlockIndex::build(from)?;
    let block = index.block_size;

    if from.len() < block as u64 || to.len() < block {
        return emit.insert(to);
    }

    let mut pos = 0usize;
    let mut pending = 0usize;
    let mut next_hint = 0u64;
    let mut rolling = RollingHash::over(&to[..block]);

    while pos + block <= to.len() {
        let found = index.find(rolling.digest(), &to[pos..pos + block], next_hint);
        let Some(offset) = found else {
            pos += 1;
            if pos + block <= to.len() {
                rolling.roll(to[pos - 1], to[pos + block - 1]);
            }
            continue;
        };

        let back = from.common_suffix(offset, &to[pending..pos])?;
        let forward = from.common_prefix(offset + block as u64, &to[pos + block..])?;
        let start = pos - back;
        let length = back + block + forward;

        emit.insert(&to[pending..start])?;
        emit.copy(offset - back as u64, length as u64);

        pos = start + length;
        pending = pos;
        next_hint = offset + (block + forward) as u64;
        if pos + block <= to.len() {
            rolling = RollingHash::over(&to[pos..pos + block]);
        }
    }

    emit.insert(&to[pending..])
}

fn effective_input(path: &Path, pristine: bool) -> Result<(Option<tempfile::NamedTempFile>, bool)> {
    if pristine || !stream::is_zstd_file(path)? {
        return Ok((None, false));
    }
    log::debug!("{} is zstd-compressed, encoding its contents", path.display());
    Ok((Some(stream::decompress_to_temp(path)?), true))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Encode the delta turning `from` into `to` and write it to `out`.
pub fn encode_file(from: &Path, to: &Path, out: &Path, opts: &EncodeOptions) -> Result<EncodeReport> {
    let mut created = false;
    let result = encode_inner(from, to, out, opts, &mut created);
    if result.is_err() && created {
        let _ = fs::remove_file(out);
    }
    result
}

fn encode_inner(
    from: &Path,
    to: &Path,
    out: &Path,
    opts: &EncodeOptions,
    created: &mut bool,
) -> Result<EncodeReport> {
    let (from_tmp, from_compressed) = effective_input(from, opts.pristine)?;
    let (to_tmp, to_compressed) = effective_input(to, opts.pristine)?;
    let from_path = from_tmp.as_ref().map_or(from, |t| t.path());
    let to_path = to_tmp.as_ref().map_or(to, |t| t.path());

    let mut flags = DeltaFlags::empty();
    flags.set(DeltaFlags::NO_VERIFY, opts.no_verify);
    flags.set(DeltaFlags::FROM_COMPRESSED, from_compressed);
    flags.set(DeltaFlags::TO_COMPRESSED, to_compressed);
    flags.set(DeltaFlags::PATCH_COMPRESSED, opts.level != 0);

    let header = Header {
        revision: Revision::Current,
        flags,
        from_name: file_name(from),
        to_name: file_name(to),
    };

    let source = PagedSource::open(from_path, opts.max_pages)?;
    let target = util::map_file(to_path)?;

    let file = File::create(out).map_err(|e| Error::io(out, e))?;
    *created = true;
    let mut writer = ArchiveWriter::new(BufWriter::new(file), opts.level, out);
    header.write(&mut writer)?;

    writer.begin_compression()?;
    let mut emit = Emitter::new(&mut writer);
    scan(&source, &target, &mut emit)?;
    let Emitter {
        instructions,
        literal_hasher,
        literal_len,
        inserts,
        copies,
        copy_length,
        sequential,
        ..
    } = emit;
    writer.end_compression()?;

    let mut sources = vec![SourceInfo {
        name: DATA_SOURCE_NAME.to_string(),
        checksum: Checksum::from_hasher(literal_hasher),
        len: literal_len,
        is_data: true,
        sequential: true,
        copies: inserts,
        copy_length: literal_len,
    }];
    if copies > 0 {
        sources.push(SourceInfo {
            name: header.from_name.clone(),
            checksum: source.finish_checksum()?,
            len: source.len(),
            is_data: false,
            sequential,
            copies,
            copy_length,
        });
    }

    let control = Control {
        flags: header.flags.bits(),
        to_checksum: Checksum::of(&target),
        to_len: target.len() as u64,
        sources,
        instructions,
    };

    let control_offset = writer.begin_compression()?;
    writer.write_all(&control.to_bytes()?)?;
    writer.end_compression()?;

    let control_offset = u32::try_from(control_offset).map_err(|_| {
        Error::io(
            out,
            io::Error::new(io::ErrorKind::InvalidInput, "delta exceeds the 4 GiB archive limit"),
        )
    })?;
    writer.put_u32(control_offset)?;
    writer.write_all(MAGIC)?;
    let archive_len = writer.offset();
    writer.finish()?.flush().map_err(|e| Error::io(out, e))?;

    let report = EncodeReport {
        from_unused: copies == 0 && !target.is_empty(),
        copies,
        copy_length,
        literal_length: literal_len,
        instructions: control.instructions.len(),
        to_len: control.to_len,
        archive_len,
    };
    if report.from_unused {
        log::warn!(
            "{} shares nothing with {}; the delta carries all {} bytes",
            to.display(),
            from.display(),
            report.to_len
        );
    }
    log::debug!(
        "encoded {} -> {}: {} copies ({} bytes), {} literal bytes, {} byte archive",
        from.display(),
        to.display(),
        report.copies,
        report.copy_length,
        report.literal_length,
        report.archive_len
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ArchiveReader;

    fn encode_bytes(from: &[u8], to: &[u8], level: i32) -> (tempfile::TempDir, Control, EncodeReport) {
        let dir = tempfile::tempdir().unwrap();
        let from_path = dir.path().join("from");
        let to_path = dir.path().join("to");
        let out = dir.path().join("out.delta");
        fs::write(&from_path, from).unwrap();
        fs::write(&to_path, to).unwrap();
        let opts = EncodeOptions {
            level,
            ..Default::default()
        };
        let report = encode_file(&from_path, &to_path, &out, &opts).unwrap();

        let mut reader = ArchiveReader::open(&out).unwrap();
        let len = reader.len();
        reader.narrow(len - 12, len - 8, false).unwrap();
        let control_offset = reader.read_u32().unwrap() as u64;
        reader.narrow(control_offset, len - 12, level != 0).unwrap();
        let control = Control::from_bytes(&reader.read_to_end().unwrap(), &out).unwrap();
        (dir, control, report)
    }

    #[test]
    fn test_block_size_bounds() {
        assert_eq!(block_size_for(0), 4);
        assert_eq!(block_size_for(10), 4);
        assert_eq!(block_size_for(17), 8);
        assert_eq!(block_size_for(1 << 20), 1024);
        assert_eq!(block_size_for(1 << 40), 4096);
    }

    #[test]
    fn test_copy_then_insert() {
        let (_dir, control, report) = encode_bytes(b"AAAAABBBBB", b"AAAAACCCCC", 3);
        assert_eq!(
            control.instructions,
            vec![
                Instruction::Copy {
                    source: 1,
                    offset: 0,
                    length: 5
                },
                Instruction::Insert { length: 5 },
            ]
        );
        assert_eq!(control.to_checksum, Checksum::of(b"AAAAACCCCC"));
        assert_eq!(control.sources[0].checksum, Checksum::of(b"CCCCC"));
        assert_eq!(control.sources[1].checksum, Checksum::of(b"AAAAABBBBB"));
        assert!(!report.from_unused);
    }

    #[test]
    fn test_unrelated_files_are_all_literal() {
        let (_dir, control, report) = encode_bytes(&[0u8; 5000], &[1u8; 3000], 0);
        assert!(report.from_unused);
        assert_eq!(control.sources.len(), 1);
        assert_eq!(control.instructions, vec![Instruction::Insert { length: 3000 }]);
    }

    #[test]
    fn test_moved_blocks_clear_sequential_hint() {
        let a: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let b: Vec<u8> = (0..4096u32).map(|i| (i * 13 % 241) as u8).collect();
        let from = [a.clone(), b.clone()].concat();
        let to = [b, a].concat();
        let (_dir, control, report) = encode_bytes(&from, &to, 3);
        assert_eq!(report.copies, 2);
        assert_eq!(report.literal_length, 0);
        assert!(!control.sources[1].sequential);
    }

    #[test]
    fn test_insertion_keeps_both_sides_as_copies() {
        let from: Vec<u8> = (0..40_000u32).map(|i| (i * 31 % 256) as u8 ^ (i >> 8) as u8).collect();
        let mut to = from.clone();
        to.splice(20_000..20_000, vec![0xAA; 100]);
        let (_dir, control, report) = encode_bytes(&from, &to, 3);
        assert_eq!(report.literal_length, 100);
        assert!(control.sources[1].sequential);
        assert_eq!(report.copy_length, from.len() as u64);
    }

    #[test]
    fn test_empty_inputs() {
        let (_dir, control, report) = encode_bytes(b"", b"", 3);
        assert!(control.instructions.is_empty());
        assert!(!report.from_unused);
        let (_dir, control, _) = encode_bytes(b"", b"x", 3);
        assert_eq!(control.instructions, vec![Instruction::Insert { length: 1 }]);
    }
}
