//! On-disk layout of a delta archive.
//!
//! ```text
//! MAGIC(8) | flags u32 | from_len<<16 | to_len u32 | reserved 4 x u32
//! from_name | to_name
//! literal data           (zstd segment when PATCH_COMPRESSED)
//! control | md5(control) (zstd segment when PATCH_COMPRESSED)
//! control_offset u32 | MAGIC(8, current revision only)
//! ```
//!
//! All integers are big-endian.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::stream::{ArchiveReader, ArchiveWriter};

pub const MAGIC_LEN: usize = 8;
pub const MAGIC: &[u8; MAGIC_LEN] = b"%DPZ003%";
pub const MAGIC_PREVIOUS: &[u8; MAGIC_LEN] = b"%DPZ002%";
const MAGIC_RETIRED: [&[u8; MAGIC_LEN]; 2] = [b"%DPZ001%", b"%DPZ000%"];

/// Magic plus the six fixed header words.
pub const FIXED_HEADER_LEN: u64 = MAGIC_LEN as u64 + 6 * 4;
const RESERVED_WORDS: usize = 4;
const CONTROL_DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// Trailer is the control offset followed by the magic again.
    Current,
    /// Trailer is the control offset only.
    Previous,
}

impl Revision {
    pub fn from_magic(magic: &[u8], path: &Path) -> Result<Self> {
        if magic == MAGIC {
            Ok(Revision::Current)
        } else if magic == MAGIC_PREVIOUS {
            Ok(Revision::Previous)
        } else if MAGIC_RETIRED.iter().any(|m| magic == &m[..]) {
            Err(Error::UnsupportedVersion(path.to_path_buf()))
        } else {
            Err(Error::BadMagic(path.to_path_buf()))
        }
    }

    pub fn magic(self) -> &'static [u8; MAGIC_LEN] {
        match self {
            Revision::Current => MAGIC,
            Revision::Previous => MAGIC_PREVIOUS,
        }
    }

    pub fn trailer_len(self) -> u64 {
        match self {
            Revision::Current => 4 + MAGIC_LEN as u64,
            Revision::Previous => 4,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.magic()))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeltaFlags: u32 {
        /// Skip source checksum verification when decoding.
        const NO_VERIFY = 1;
        /// The from file was zstd-compressed and decompressed before encoding.
        const FROM_COMPRESSED = 1 << 1;
        /// The to file was zstd-compressed; decoding re-compresses the output.
        const TO_COMPRESSED = 1 << 2;
        /// Literal and control segments are zstd-compressed.
        const PATCH_COMPRESSED = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub revision: Revision,
    pub flags: DeltaFlags,
    pub from_name: String,
    pub to_name: String,
}

impl Header {
    /// Write the header with the current magic.
    pub fn write<W: Write>(&self, out: &mut ArchiveWriter<W>) -> Result<()> {
        let name_len = |name: &str| {
            u16::try_from(name.len()).map_err(|_| {
                Error::io(
                    name,
                    io::Error::new(io::ErrorKind::InvalidInput, "file name longer than 65535 bytes"),
                )
            })
        };
        let lengths = (u32::from(name_len(&self.from_name)?) << 16) | u32::from(name_len(&self.to_name)?);

        out.write_all(MAGIC)?;
        out.put_u32(self.flags.bits())?;
        out.put_u32(lengths)?;
        for _ in 0..RESERVED_WORDS {
            out.put_u32(0)?;
        }
        out.write_all(self.from_name.as_bytes())?;
        out.write_all(self.to_name.as_bytes())
    }

    /// Read magic, fixed words and names from the start of `reader`.
    /// Returns the header and the archive offset just past it.
    pub fn read(reader: &mut ArchiveReader) -> Result<(Header, u64)> {
        if reader.len() < MAGIC_LEN as u64 {
            return Err(Error::BadMagic(reader.path().to_path_buf()));
        }
        let magic = reader.read_vec(MAGIC_LEN)?;
        let revision = Revision::from_magic(&magic, reader.path())?;

        let raw_flags = reader.read_u32()?;
        let flags = DeltaFlags::from_bits(raw_flags).ok_or_else(|| {
            Error::corrupt(reader.path(), format!("unknown header flags {raw_flags:#x}"))
        })?;
        let lengths = reader.read_u32()?;
        for _ in 0..RESERVED_WORDS {
            reader.read_u32()?;
        }
        let (from_len, to_len) = (u64::from(lengths >> 16), u64::from(lengths & 0xFFFF));
        let from_name = String::from_utf8_lossy(&reader.read_vec(from_len as usize)?).into_owned();
        let to_name = String::from_utf8_lossy(&reader.read_vec(to_len as usize)?).into_owned();

        let header = Header {
            revision,
            flags,
            from_name,
            to_name,
        };
        Ok((header, FIXED_HEADER_LEN + from_len + to_len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// `length` bytes starting at `offset` of source `source`.
    Copy { source: u32, offset: u64, length: u64 },
    /// The next `length` bytes of the literal data.
    Insert { length: u64 },
}

impl Instruction {
    pub fn len(&self) -> u64 {
        match *self {
            Instruction::Copy { length, .. } | Instruction::Insert { length } => length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    pub checksum: Checksum,
    pub len: u64,
    /// The embedded literal data rather than an external file.
    pub is_data: bool,
    /// Copies from this source never move backwards.
    pub sequential: bool,
    pub copies: u32,
    pub copy_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    /// Copy of the header flag word, covered by the control digest.
    pub flags: u32,
    pub to_checksum: Checksum,
    pub to_len: u64,
    pub sources: Vec<SourceInfo>,
    pub instructions: Vec<Instruction>,
}

impl Control {
    pub fn data_source(&self) -> Option<usize> {
        self.sources.iter().position(|s| s.is_data)
    }

    pub fn from_source(&self) -> Option<usize> {
        self.sources.iter().position(|s| !s.is_data)
    }

    /// bincode body followed by its MD5.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)
            .map_err(|e| Error::io("control", io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let digest = Checksum::of(&bytes);
        bytes.extend_from_slice(&digest.0);
        Ok(bytes)
    }

    /// Verify the trailing MD5, deserialize and check the structure.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Control> {
        if bytes.len() < CONTROL_DIGEST_LEN {
            return Err(Error::corrupt(path, "control segment too short"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - CONTROL_DIGEST_LEN);
        if Checksum::of(body).0 != digest {
            return Err(Error::corrupt(path, "control segment checksum mismatch"));
        }
        let control: Control = bincode::deserialize(body)
            .map_err(|e| Error::corrupt(path, format!("unreadable control segment: {e}")))?;
        control.validate(path)?;
        Ok(control)
    }

    /// Structural checks that do not need the sources themselves.
    pub fn validate(&self, path: &Path) -> Result<()> {
        let data_sources = self.sources.iter().filter(|s| s.is_data).count();
        if data_sources > 1 || self.sources.len() - data_sources > 1 {
            return Err(Error::corrupt(path, "more than one source of a kind"));
        }

        let mut total: u64 = 0;
        for (i, inst) in self.instructions.iter().enumerate() {
            let source = match *inst {
                Instruction::Copy { source, .. } => Some(source as usize),
                Instruction::Insert { .. } => self.data_source(),
            };
            match source.and_then(|s| self.sources.get(s)) {
                Some(info) => {
                    let fits = match *inst {
                        Instruction::Copy { offset, length, .. } => offset
                            .checked_add(length)
                            .is_some_and(|end| end <= info.len),
                        Instruction::Insert { length } => length <= info.len,
                    };
                    if !fits {
                        return Err(Error::corrupt(
                            path,
                            format!("instruction {i} reaches past the end of source {}", info.name),
                        ));
                    }
                }
                None => {
                    return Err(Error::corrupt(
                        path,
                        format!("instruction {i} names a source that does not exist"),
                    ))
                }
            }
            total = total
                .checked_add(inst.len())
                .ok_or_else(|| Error::corrupt(path, "instruction lengths overflow"))?;
        }
        if total != self.to_len {
            return Err(Error::corrupt(
                path,
                format!("instructions produce {total} bytes, target is {} bytes", self.to_len),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control() -> Control {
        Control {
            flags: DeltaFlags::PATCH_COMPRESSED.bits(),
            to_checksum: Checksum::of(b"AAAAACCCCC"),
            to_len: 10,
            sources: vec![
                SourceInfo {
                    name: "(patch data)".into(),
                    checksum: Checksum::of(b"CCCCC"),
                    len: 5,
                    is_data: true,
                    sequential: true,
                    copies: 0,
                    copy_length: 0,
                },
                SourceInfo {
                    name: "old".into(),
                    checksum: Checksum::of(b"AAAAABBBBB"),
                    len: 10,
                    is_data: false,
                    sequential: true,
                    copies: 1,
                    copy_length: 5,
                },
            ],
            instructions: vec![
                Instruction::Copy {
                    source: 1,
                    offset: 0,
                    length: 5,
                },
                Instruction::Insert { length: 5 },
            ],
        }
    }

    #[test]
    fn test_revisions() {
        let p = Path::new("x.delta");
        assert_eq!(Revision::from_magic(b"%DPZ003%", p).unwrap(), Revision::Current);
        assert_eq!(Revision::from_magic(b"%DPZ002%", p).unwrap(), Revision::Previous);
        assert!(matches!(
            Revision::from_magic(b"%DPZ001%", p),
            Err(Error::UnsupportedVersion(_))
        ));
        assert!(matches!(Revision::from_magic(b"PATCHV01", p), Err(Error::BadMagic(_))));
        assert_eq!(Revision::Current.trailer_len(), 12);
        assert_eq!(Revision::Previous.trailer_len(), 4);
    }

    #[test]
    fn test_control_digest_detects_tampering() {
        let p = Path::new("x.delta");
        let mut bytes = sample_control().to_bytes().unwrap();
        assert_eq!(Control::from_bytes(&bytes, p).unwrap(), sample_control());
        bytes[3] ^= 0x40;
        assert!(matches!(Control::from_bytes(&bytes, p), Err(Error::CorruptDelta { .. })));
    }

    #[test]
    fn test_validate_rejects_out_of_range_copy() {
        let mut control = sample_control();
        control.instructions[0] = Instruction::Copy {
            source: 1,
            offset: 8,
            length: 5,
        };
        assert!(control.validate(Path::new("x")).is_err());

        let mut control = sample_control();
        control.instructions[0] = Instruction::Copy {
            source: 7,
            offset: 0,
            length: 5,
        };
        assert!(control.validate(Path::new("x")).is_err());

        let mut control = sample_control();
        control.to_len = 11;
        assert!(control.validate(Path::new("x")).is_err());
    }

    #[test]
    fn test_header_round_trip_through_archive_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.delta");
        let header = Header {
            revision: Revision::Current,
            flags: DeltaFlags::NO_VERIFY | DeltaFlags::PATCH_COMPRESSED,
            from_name: "lib/old.so".into(),
            to_name: "lib/new.so".into(),
        };
        let mut writer = ArchiveWriter::new(std::fs::File::create(&path).unwrap(), 0, &path);
        header.write(&mut writer).unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let (read, end) = Header::read(&mut reader).unwrap();
        assert_eq!(read, header);
        assert_eq!(end, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_header_end_counts_raw_name_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.delta");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&((2u32 << 16) | 3).to_be_bytes());
        bytes.extend_from_slice(&[0; RESERVED_WORDS * 4]);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        bytes.extend_from_slice(b"new");
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let (header, end) = Header::read(&mut reader).unwrap();
        assert_eq!(header.from_name, "\u{FFFD}\u{FFFD}");
        assert_eq!(header.to_name, "new");
        assert_eq!(end, bytes.len() as u64);
    }
}
