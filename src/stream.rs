//! Sequential access to delta archives.
//!
//! [`ArchiveReader`] reads one physical archive file as a series of logical
//! segments: it is narrowed to a byte range, optionally through a zstd
//! decoder, and every byte read through it is folded into a running MD5.
//! [`ArchiveWriter`] is the writing half, switching zstd compression on and
//! off around segments while keeping track of the on-disk offset.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::checksum::Checksum;
use crate::error::{Error, Result, ResultExt};

const COPY_CHUNK: usize = 64 * 1024;

/// First four bytes of every zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// True if the file at `path` starts with a zstd frame header.
pub fn is_zstd_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path).at(path)?;
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).at(path)?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(head == ZSTD_MAGIC)
}

/// Decompress the zstd file at `path` into a temporary file.
pub fn decompress_to_temp(path: &Path) -> Result<tempfile::NamedTempFile> {
    let input = File::open(path).at(path)?;
    let mut tmp = tempfile::NamedTempFile::new().at(path)?;
    zstd::stream::copy_decode(input, tmp.as_file_mut()).at(path)?;
    Ok(tmp)
}

enum Segment {
    Plain(BufReader<Take<File>>),
    Compressed(zstd::stream::read::Decoder<'static, BufReader<Take<File>>>),
}

impl Read for Segment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Segment::Plain(r) => r.read(buf),
            Segment::Compressed(r) => r.read(buf),
        }
    }
}

pub struct ArchiveReader {
    file: File,
    path: PathBuf,
    len: u64,
    segment: Segment,
    position: u64,
    hasher: Md5,
}

impl ArchiveReader {
    /// Open `path`, initially narrowed to the whole file, uncompressed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();
        let segment = Segment::Plain(BufReader::new(Self::window(&file, path, 0, len)?));
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            segment,
            position: 0,
            hasher: Md5::new(),
        })
    }

    fn window(file: &File, path: &Path, low: u64, high: u64) -> Result<Take<File>> {
        let mut handle = file.try_clone().at(path)?;
        handle.seek(SeekFrom::Start(low)).at(path)?;
        Ok(handle.take(high - low))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical length of the archive file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Restrict reading to `[low, high)` of the file, decompressing if asked.
    /// Resets the position and the running checksum.
    pub fn narrow(&mut self, low: u64, high: u64, compressed: bool) -> Result<()> {
        if low > high || high > self.len {
            return Err(Error::corrupt(
                &self.path,
                format!("segment [{low}, {high}) lies outside a {} byte archive", self.len),
            ));
        }
        let limited = Self::window(&self.file, &self.path, low, high)?;
        self.segment = if compressed {
            Segment::Compressed(zstd::stream::read::Decoder::new(limited).at(&self.path)?)
        } else {
            Segment::Plain(BufReader::new(limited))
        };
        self.position = 0;
        self.hasher = Md5::new();
        Ok(())
    }

    /// Bytes consumed since the last narrow (logical, after decompression).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Decoder failures inside a compressed segment mean a damaged archive.
    fn classify(&self, e: io::Error, wanted: usize) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::corrupt(
                &self.path,
                format!("truncated: needed {wanted} bytes at segment offset {}", self.position),
            )
        } else if matches!(self.segment, Segment::Compressed(_)) {
            Error::corrupt(&self.path, format!("undecodable compressed segment: {e}"))
        } else {
            Error::io(&self.path, e)
        }
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Err(e) = self.segment.read_exact(buf) {
            return Err(self.classify(e, buf.len()));
        }
        self.hasher.update(&buf[..]);
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_exact(&mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read everything left in the current segment.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Err(e) = self.segment.read_to_end(&mut buf) {
            return Err(self.classify(e, 0));
        }
        self.hasher.update(&buf);
        self.position += buf.len() as u64;
        Ok(buf)
    }

    /// Hand the next `len` bytes to `sink` in bounded chunks.
    pub fn copy_to(&mut self, len: u64, mut sink: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let mut buf = vec![0u8; COPY_CHUNK.min(len as usize)];
        let mut left = len;
        while left > 0 {
            let n = left.min(buf.len() as u64) as usize;
            self.read_exact(&mut buf[..n])?;
            sink(&buf[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    /// MD5 of everything read since the last narrow.
    pub fn finish_checksum(&mut self) -> Checksum {
        Checksum::from_hasher(std::mem::take(&mut self.hasher))
    }
}

/// `Write` adapter that counts bytes passed through.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Sink<W: Write> {
    Plain(CountingWriter<W>),
    Compressed(zstd::stream::write::Encoder<'static, CountingWriter<W>>),
    Switching,
}

pub struct ArchiveWriter<W: Write> {
    sink: Sink<W>,
    level: i32,
    path: PathBuf,
}

impl<W: Write> ArchiveWriter<W> {
    /// `level` 0 leaves every segment uncompressed.
    pub fn new(inner: W, level: i32, path: &Path) -> Self {
        Self {
            sink: Sink::Plain(CountingWriter { inner, count: 0 }),
            level,
            path: path.to_path_buf(),
        }
    }

    /// On-disk offset. Only meaningful between segments.
    pub fn offset(&self) -> u64 {
        match &self.sink {
            Sink::Plain(w) => w.count,
            Sink::Compressed(enc) => enc.get_ref().count,
            Sink::Switching => 0,
        }
    }

    /// Start a compressed segment and return the on-disk offset it begins at.
    pub fn begin_compression(&mut self) -> Result<u64> {
        let offset = self.offset();
        if self.level == 0 {
            return Ok(offset);
        }
        self.sink = match std::mem::replace(&mut self.sink, Sink::Switching) {
            Sink::Plain(plain) => {
                Sink::Compressed(zstd::stream::write::Encoder::new(plain, self.level).at(&self.path)?)
            }
            Sink::Compressed(encoder) => Sink::Compressed(encoder),
            Sink::Switching => return Err(Error::io(&self.path, switching_error())),
        };
        Ok(offset)
    }

    /// Close the current compressed segment, if any.
    pub fn end_compression(&mut self) -> Result<()> {
        self.sink = match std::mem::replace(&mut self.sink, Sink::Switching) {
            Sink::Compressed(encoder) => Sink::Plain(encoder.finish().at(&self.path)?),
            Sink::Plain(plain) => Sink::Plain(plain),
            Sink::Switching => return Err(Error::io(&self.path, switching_error())),
        };
        Ok(())
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let written = match &mut self.sink {
            Sink::Plain(w) => w.write_all(buf),
            Sink::Compressed(w) => w.write_all(buf),
            Sink::Switching => Err(switching_error()),
        };
        written.at(&self.path)
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    /// Close any open segment, flush, and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.end_compression()?;
        match self.sink {
            Sink::Plain(mut w) => {
                w.flush().at(&self.path)?;
                Ok(w.inner)
            }
            _ => Err(Error::io(&self.path, switching_error())),
        }
    }
}

fn switching_error() -> io::Error {
    io::Error::other("archive writer lost its sink while switching compression")
}

/// `Write` adapter keeping a running MD5 and byte count of what passes through.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Md5,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            count: 0,
        }
    }

    pub fn finish(self) -> (W, Checksum, u64) {
        (self.inner, Checksum::from_hasher(self.hasher), self.count)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_segments_and_reader_narrowing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");

        let mut writer = ArchiveWriter::new(File::create(&path).unwrap(), 3, &path);
        writer.write_all(b"HEAD").unwrap();
        let start = writer.begin_compression().unwrap();
        assert_eq!(start, 4);
        writer.write_all(&[b'x'; 10_000]).unwrap();
        writer.end_compression().unwrap();
        let end = writer.offset();
        writer.put_u32(start as u32).unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert!(end < 4 + 10_000, "segment should have compressed");
        assert_eq!(reader.read_vec(4).unwrap(), b"HEAD");

        reader.narrow(end, reader.len(), false).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 4);

        reader.narrow(start, end, true).unwrap();
        let body = reader.read_to_end().unwrap();
        assert_eq!(body, vec![b'x'; 10_000]);
        assert_eq!(reader.position(), 10_000);
        assert_eq!(reader.finish_checksum(), Checksum::of(&body));
    }

    #[test]
    fn test_uncompressed_level_writes_raw() {
        let mut writer = ArchiveWriter::new(Vec::new(), 0, Path::new("mem"));
        assert_eq!(writer.begin_compression().unwrap(), 0);
        writer.write_all(b"raw").unwrap();
        writer.end_compression().unwrap();
        assert_eq!(writer.finish().unwrap(), b"raw");
    }

    #[test]
    fn test_truncated_read_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut reader = ArchiveReader::open(&path).unwrap();
        assert!(matches!(reader.read_u32(), Err(Error::CorruptDelta { .. })));
        assert!(matches!(reader.narrow(2, 9, false), Err(Error::CorruptDelta { .. })));
    }

    #[test]
    fn test_digest_writer() {
        let mut w = DigestWriter::new(Vec::new());
        w.write_all(b"ab").unwrap();
        w.write_all(b"c").unwrap();
        let (inner, sum, count) = w.finish();
        assert_eq!(inner, b"abc");
        assert_eq!(sum, Checksum::of(b"abc"));
        assert_eq!(count, 3);
    }

    #[test]
    fn test_zstd_detection() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        let packed = dir.path().join("packed");
        std::fs::write(&plain, b"hello world").unwrap();
        std::fs::write(&packed, zstd::encode_all(&b"hello world"[..], 3).unwrap()).unwrap();
        assert!(!is_zstd_file(&plain).unwrap());
        assert!(is_zstd_file(&packed).unwrap());

        let tmp = decompress_to_temp(&packed).unwrap();
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"hello world");
    }
}
