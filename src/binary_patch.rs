//! Delta decoder and archive inspection.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::binary_diff::DEFAULT_LEVEL;
use crate::checksum::Checksum;
use crate::error::{Error, Result, ResultExt};
use crate::paged::PagedSource;
use crate::patch_format::{
    Control, DeltaFlags, Header, Instruction, Revision, SourceInfo, MAGIC, MAGIC_LEN,
};
use crate::stream::{self, ArchiveReader, DigestWriter};

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Resident page ceiling for the from file.
    pub max_pages: usize,
    /// Never treat the from file as zstd-compressed.
    pub pristine: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_pages: usize::MAX,
            pristine: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// The from file differs from the one the delta was built against.
    pub from_mismatch: bool,
    pub to_len: u64,
    pub to_checksum: Checksum,
    pub copy_length: u64,
    pub literal_length: u64,
}

/// Everything an archive says about itself.
#[derive(Debug, Clone)]
pub struct DeltaInfo {
    pub revision: Revision,
    pub flags: DeltaFlags,
    pub from_name: String,
    pub to_name: String,
    pub archive_len: u64,
    pub control: Control,
}

struct Layout {
    header: Header,
    control: Control,
    header_end: u64,
    control_offset: u64,
}

/// Header, trailer and control segment of an open archive.
fn read_layout(reader: &mut ArchiveReader) -> Result<Layout> {
    let (header, header_end) = Header::read(reader)?;
    let trailer_len = header.revision.trailer_len();
    let len = reader.len();
    if len < header_end + trailer_len {
        return Err(Error::corrupt(reader.path(), "archive too short for its trailer"));
    }

    let trailer_start = len - trailer_len;
    reader.narrow(trailer_start, len, false)?;
    let control_offset = u64::from(reader.read_u32()?);
    if header.revision == Revision::Current && reader.read_vec(MAGIC_LEN)? != MAGIC {
        return Err(Error::corrupt(reader.path(), "trailing magic missing"));
    }
    if control_offset < header_end || control_offset > trailer_start {
        return Err(Error::corrupt(
            reader.path(),
            format!("control offset {control_offset} outside [{header_end}, {trailer_start}]"),
        ));
    }

    let compressed = header.flags.contains(DeltaFlags::PATCH_COMPRESSED);
    reader.narrow(control_offset, trailer_start, compressed)?;
    let control = Control::from_bytes(&reader.read_to_end()?, reader.path())?;
    if control.flags != header.flags.bits() {
        return Err(Error::corrupt(
            reader.path(),
            format!(
                "header flags {:#x} disagree with the recorded flags {:#x}",
                header.flags.bits(),
                control.flags
            ),
        ));
    }

    Ok(Layout {
        header,
        control,
        header_end,
        control_offset,
    })
}

/// Read an archive's header and control structure without decoding it.
pub fn info(archive: &Path) -> Result<DeltaInfo> {
    let mut reader = ArchiveReader::open(archive)?;
    let layout = read_layout(&mut reader)?;
    Ok(DeltaInfo {
        revision: layout.header.revision,
        flags: layout.header.flags,
        from_name: layout.header.from_name,
        to_name: layout.header.to_name,
        archive_len: reader.len(),
        control: layout.control,
    })
}

/// Replay every instruction into `out`. Returns (copied, literal) byte counts.
fn replay<W: Write>(
    control: &Control,
    literals: &mut ArchiveReader,
    from: Option<&PagedSource>,
    out: &mut DigestWriter<W>,
    out_path: &Path,
) -> Result<(u64, u64)> {
    let archive = literals.path().to_path_buf();
    let mut copied = 0u64;
    let mut literal = 0u64;

    for (i, inst) in control.instructions.iter().enumerate() {
        match *inst {
            Instruction::Insert { length } => {
                literals.copy_to(length, |chunk| out.write_all(chunk).at(out_path))?;
                literal += length;
            }
            Instruction::Copy {
                source,
                offset,
                length,
            } => {
                let info = &control.sources[source as usize];
                if info.is_data {
                    if offset != literals.position() {
                        return Err(Error::corrupt(
                            &archive,
                            format!("instruction {i} reads literal data out of order"),
                        ));
                    }
                    literals.copy_to(length, |chunk| out.write_all(chunk).at(out_path))?;
                    literal += length;
                    continue;
                }

                let src = from.ok_or_else(|| {
                    Error::corrupt(&archive, format!("instruction {i} copies from a missing source"))
                })?;
                if !offset.checked_add(length).is_some_and(|end| end <= src.len()) {
                    return Err(Error::corrupt(
                        &archive,
                        format!(
                            "instruction {i} copies {length} bytes at {offset} from a {} byte file",
                            src.len()
                        ),
                    ));
                }
                src.copy_range(offset, length, |chunk| out.write_all(chunk).at(out_path))?;
                copied += length;
            }
        }
    }
    Ok((copied, literal))
}

fn check_from(source: &PagedSource, info: &SourceInfo, verify: bool) -> Result<bool> {
    if source.len() != info.len {
        log::warn!(
            "{} is {} bytes, the delta was built against {} bytes",
            source.path().display(),
            source.len(),
            info.len
        );
        return Ok(true);
    }
    if !verify {
        return Ok(false);
    }
    let actual = source.finish_checksum()?;
    if actual != info.checksum {
        log::warn!(
            "{} has checksum {actual}, the delta was built against {}",
            source.path().display(),
            info.checksum
        );
        return Ok(true);
    }
    Ok(false)
}

enum Output {
    Plain(DigestWriter<BufWriter<File>>),
    Recompressed(DigestWriter<zstd::stream::write::Encoder<'static, BufWriter<File>>>),
}

/// Rebuild the to file of `archive` from `from`, writing it to `out`.
///
/// The result is built in a temporary file beside `out` and renamed into
/// place only once it verifies, so `out` is untouched on failure. `out` may
/// not be `from` itself.
pub fn decode_file(archive: &Path, from: &Path, out: &Path, opts: &DecodeOptions) -> Result<DecodeReport> {
    if same_file(from, out) {
        return Err(Error::OutputIsInput(out.to_path_buf()));
    }
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staged = tempfile::Builder::new()
        .prefix(".deltapatch-")
        .tempfile_in(dir)
        .at(dir)?;
    let file = staged.as_file().try_clone().at(staged.path())?;
    let report = decode_inner(archive, from, file, staged.path(), opts)?;

    if let Ok(meta) = fs::metadata(from) {
        if let Err(e) = fs::set_permissions(staged.path(), meta.permissions()) {
            log::debug!("keeping default permissions on {}: {e}", out.display());
        }
    }
    staged.persist(out).map_err(|e| Error::io(out, e.error))?;
    Ok(report)
}

/// Both paths exist and resolve to the same file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn decode_inner(
    archive: &Path,
    from: &Path,
    file: File,
    out: &Path,
    opts: &DecodeOptions,
) -> Result<DecodeReport> {
    let mut reader = ArchiveReader::open(archive)?;
    let Layout {
        header,
        control,
        header_end,
        control_offset,
    } = read_layout(&mut reader)?;
    let flags = header.flags;
    let verify = !flags.contains(DeltaFlags::NO_VERIFY);

    let from_info = control.from_source().map(|i| &control.sources[i]);
    let mut from_tmp = None;
    let source = match from_info {
        Some(_) => {
            let from_path = effective_from(from, flags, opts.pristine, &mut from_tmp)?;
            Some(PagedSource::open(&from_path, opts.max_pages)?)
        }
        None => None,
    };

    let mut from_mismatch = false;
    if let (Some(src), Some(info)) = (&source, from_info) {
        if src.len() != info.len {
            from_mismatch = check_from(src, info, verify)?;
        }
    }

    reader.narrow(header_end, control_offset, flags.contains(DeltaFlags::PATCH_COMPRESSED))?;

    let mut output = if flags.contains(DeltaFlags::TO_COMPRESSED) {
        let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), DEFAULT_LEVEL).at(out)?;
        Output::Recompressed(DigestWriter::new(encoder))
    } else {
        Output::Plain(DigestWriter::new(BufWriter::new(file)))
    };

    let (copy_length, literal_length) = match &mut output {
        Output::Plain(w) => replay(&control, &mut reader, source.as_ref(), w, out)?,
        Output::Recompressed(w) => replay(&control, &mut reader, source.as_ref(), w, out)?,
    };

    let (to_checksum, to_len) = match output {
        Output::Plain(w) => {
            let (mut inner, sum, count) = w.finish();
            inner.flush().at(out)?;
            (sum, count)
        }
        Output::Recompressed(w) => {
            let (encoder, sum, count) = w.finish();
            encoder.finish().at(out)?.flush().at(out)?;
            (sum, count)
        }
    };

    if verify {
        if let Some(data) = control.data_source().map(|i| &control.sources[i]) {
            let consumed = reader.position();
            let literal_sum = reader.finish_checksum();
            if consumed != data.len || literal_sum != data.checksum {
                return Err(Error::corrupt(archive, "literal data checksum mismatch"));
            }
        }
    }

    if let (Some(src), Some(info)) = (&source, from_info) {
        if !from_mismatch && src.len() == info.len {
            from_mismatch = check_from(src, info, verify)?;
        }
    }

    if to_len != control.to_len || to_checksum != control.to_checksum {
        return Err(Error::corrupt(
            archive,
            format!(
                "reconstructed {} bytes with checksum {to_checksum}, expected {} bytes with {}",
                to_len, control.to_len, control.to_checksum
            ),
        ));
    }

    log::debug!(
        "decoded {} into {} ({to_len} bytes, {copy_length} copied, {literal_length} literal)",
        archive.display(),
        out.display()
    );

    Ok(DecodeReport {
        from_mismatch,
        to_len,
        to_checksum,
        copy_length,
        literal_length,
    })
}

/// The file to page from: `from` itself, or a decompressed copy of it.
fn effective_from(
    from: &Path,
    flags: DeltaFlags,
    pristine: bool,
    tmp: &mut Option<tempfile::NamedTempFile>,
) -> Result<PathBuf> {
    if pristine {
        return Ok(from.to_path_buf());
    }
    let expected = flags.contains(DeltaFlags::FROM_COMPRESSED);
    let actual = stream::is_zstd_file(from)?;
    if expected != actual {
        log::warn!(
            "{} is {}compressed but the delta expects it {}compressed",
            from.display(),
            if actual { "" } else { "not " },
            if expected { "" } else { "un" }
        );
    }
    if expected && actual {
        let decompressed = stream::decompress_to_temp(from)?;
        let path = decompressed.path().to_path_buf();
        *tmp = Some(decompressed);
        return Ok(path);
    }
    Ok(from.to_path_buf())
}
