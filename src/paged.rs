//! Seekable, paged access to a "from" file under a page-count ceiling.
//!
//! A file is split into fixed-size pages that are memory-mapped (or read,
//! when mapping fails) on first touch. Resident pages sit in a recency list;
//! when the ceiling is reached, the least recently used page that nobody
//! currently holds is dropped before a new one is realized. Holding a page is
//! expressed by a [`PageGuard`]; dropping the guard releases it.
//!
//! The source also folds every page it realizes, in order, into a running MD5
//! so the caller can learn the file's checksum without a second pass.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use md5::{Digest, Md5};
use memmap2::{Mmap, MmapOptions};

use crate::checksum::Checksum;
use crate::error::{Error, Result, ResultExt};

pub const PAGE_SIZE: usize = 1 << 20;

/// Number of pages covering `len` bytes.
pub fn pages_for(len: u64) -> usize {
    len.div_ceil(PAGE_SIZE as u64) as usize
}

fn split(pos: u64) -> (usize, usize) {
    (
        (pos / PAGE_SIZE as u64) as usize,
        (pos % PAGE_SIZE as u64) as usize,
    )
}

enum PageData {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl Deref for PageData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageData::Mapped(map) => map,
            PageData::Buffered(buf) => buf,
        }
    }
}

#[derive(Default)]
struct Slot {
    data: Option<Rc<PageData>>,
    refs: u32,
    newer: Option<usize>,
    older: Option<usize>,
}

/// Page arena indexed by page number, threaded by a recency list.
struct PageTable {
    slots: Vec<Slot>,
    newest: Option<usize>,
    oldest: Option<usize>,
    resident: usize,
    max_pages: usize,
}

impl PageTable {
    fn new(page_count: usize, max_pages: usize) -> Self {
        Self {
            slots: (0..page_count).map(|_| Slot::default()).collect(),
            newest: None,
            oldest: None,
            resident: 0,
            max_pages,
        }
    }

    fn unlink(&mut self, pgno: usize) {
        let newer = self.slots[pgno].newer.take();
        let older = self.slots[pgno].older.take();
        match newer {
            Some(n) => self.slots[n].older = older,
            None => self.newest = older,
        }
        match older {
            Some(o) => self.slots[o].newer = newer,
            None => self.oldest = newer,
        }
    }

    fn push_newest(&mut self, pgno: usize) {
        self.slots[pgno].older = self.newest;
        self.slots[pgno].newer = None;
        if let Some(n) = self.newest {
            self.slots[n].newer = Some(pgno);
        }
        self.newest = Some(pgno);
        if self.oldest.is_none() {
            self.oldest = Some(pgno);
        }
    }

    fn touch(&mut self, pgno: usize) {
        if self.newest != Some(pgno) {
            self.unlink(pgno);
            self.push_newest(pgno);
        }
    }

    /// Drop the least recently used unreferenced page. False if every
    /// resident page is still held.
    fn evict_one(&mut self) -> bool {
        let mut cursor = self.oldest;
        while let Some(pgno) = cursor {
            if self.slots[pgno].refs == 0 {
                self.unlink(pgno);
                self.slots[pgno].data = None;
                self.resident -= 1;
                return true;
            }
            cursor = self.slots[pgno].newer;
        }
        false
    }
}

struct RunningDigest {
    hasher: Md5,
    next_page: usize,
    done: Option<Checksum>,
}

pub struct PagedSource {
    file: File,
    path: PathBuf,
    len: u64,
    pages: usize,
    table: RefCell<PageTable>,
    digest: RefCell<RunningDigest>,
}

impl PagedSource {
    /// Open `path` for paged access with at most `max_pages` resident pages.
    pub fn open(path: &Path, max_pages: usize) -> Result<Self> {
        let file = File::open(path).at(path)?;
        let meta = file.metadata().at(path)?;
        if !meta.is_file() {
            return Err(Error::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let len = meta.len();
        let pages = pages_for(len);
        let done = (pages == 0).then(|| Checksum::of(b""));

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            pages,
            table: RefCell::new(PageTable::new(pages, max_pages.max(1))),
            digest: RefCell::new(RunningDigest {
                hasher: Md5::new(),
                next_page: 0,
                done,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn resident_pages(&self) -> usize {
        self.table.borrow().resident
    }

    fn page_len(&self, pgno: usize) -> usize {
        let start = pgno as u64 * PAGE_SIZE as u64;
        (self.len - start).min(PAGE_SIZE as u64) as usize
    }

    /// Hold page `pgno`, realizing it if it is not resident.
    pub fn acquire(&self, pgno: usize) -> Result<PageGuard<'_>> {
        if pgno >= self.pages {
            return Err(Error::corrupt(
                &self.path,
                format!("page {pgno} is past the end of a {} byte file", self.len),
            ));
        }

        let data = {
            let mut table = self.table.borrow_mut();
            let data = match table.slots[pgno].data.clone() {
                Some(data) => {
                    table.touch(pgno);
                    data
                }
                None => {
                    if table.resident >= table.max_pages && !table.evict_one() {
                        return Err(Error::PageBudget {
                            max_pages: table.max_pages,
                        });
                    }
                    let data = Rc::new(self.realize(pgno)?);
                    table.slots[pgno].data = Some(Rc::clone(&data));
                    table.resident += 1;
                    table.push_newest(pgno);
                    data
                }
            };
            table.slots[pgno].refs += 1;
            data
        };

        self.absorb(pgno, &data);

        Ok(PageGuard {
            source: self,
            pgno,
            data,
        })
    }

    fn release(&self, pgno: usize) {
        let mut table = self.table.borrow_mut();
        let slot = &mut table.slots[pgno];
        debug_assert!(slot.refs > 0, "page {pgno} released more often than acquired");
        slot.refs = slot.refs.saturating_sub(1);
    }

    fn realize(&self, pgno: usize) -> Result<PageData> {
        let offset = pgno as u64 * PAGE_SIZE as u64;
        let len = self.page_len(pgno);

        // SAFETY: read-only mapping of a page-aligned range inside the file.
        // Callers must not truncate or rewrite the file while the source is open.
        let mapped = unsafe { MmapOptions::new().offset(offset).len(len).map(&self.file) };
        match mapped {
            Ok(map) => Ok(PageData::Mapped(map)),
            Err(e) => {
                log::debug!(
                    "mapping page {pgno} of {} failed ({e}), reading it instead",
                    self.path.display()
                );
                let mut buf = vec![0u8; len];
                let mut file = &self.file;
                file.seek(SeekFrom::Start(offset)).at(&self.path)?;
                file.read_exact(&mut buf).at(&self.path)?;
                Ok(PageData::Buffered(buf))
            }
        }
    }

    fn absorb(&self, pgno: usize, page: &[u8]) {
        let mut digest = self.digest.borrow_mut();
        if digest.done.is_some() || pgno != digest.next_page {
            return;
        }
        digest.hasher.update(page);
        digest.next_page += 1;
        if digest.next_page == self.pages {
            let hasher = std::mem::take(&mut digest.hasher);
            digest.done = Some(Checksum::from_hasher(hasher));
        }
    }

    /// MD5 of the whole file. Pages not yet visited are visited now.
    pub fn finish_checksum(&self) -> Result<Checksum> {
        loop {
            let next = {
                let digest = self.digest.borrow();
                if let Some(sum) = digest.done {
                    return Ok(sum);
                }
                digest.next_page
            };
            drop(self.acquire(next)?);
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<u64> {
        offset
            .checked_add(len)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| {
                Error::corrupt(
                    &self.path,
                    format!(
                        "range of {len} bytes at offset {offset} runs past the end of a {} byte file",
                        self.len
                    ),
                )
            })
    }

    /// Hand `len` bytes starting at `offset` to `sink`, one page slice at a time.
    pub fn copy_range(
        &self,
        offset: u64,
        len: u64,
        mut sink: impl FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let end = self.check_range(offset, len)?;
        let mut pos = offset;
        while pos < end {
            let (pgno, within) = split(pos);
            let page = self.acquire(pgno)?;
            let take = ((end - pos).min((page.len() - within) as u64)) as usize;
            sink(&page[within..within + take])?;
            pos += take as u64;
        }
        Ok(())
    }

    /// Count how many leading bytes of `other` equal the file starting at `offset`.
    pub fn common_prefix(&self, offset: u64, other: &[u8]) -> Result<usize> {
        let end = self.len.min(offset.saturating_add(other.len() as u64));
        let mut pos = offset;
        let mut matched = 0usize;
        while pos < end {
            let (pgno, within) = split(pos);
            let page = self.acquire(pgno)?;
            let take = ((end - pos).min((page.len() - within) as u64)) as usize;
            let same = page[within..within + take]
                .iter()
                .zip(&other[matched..])
                .take_while(|(a, b)| a == b)
                .count();
            matched += same;
            if same < take {
                break;
            }
            pos += take as u64;
        }
        Ok(matched)
    }

    /// Count how many trailing bytes of `other` equal the file ending just before `end`.
    pub fn common_suffix(&self, end: u64, other: &[u8]) -> Result<usize> {
        let end = end.min(self.len);
        let start = end.saturating_sub(other.len() as u64);
        let mut pos = end;
        let mut matched = 0usize;
        while pos > start {
            let (pgno, last) = split(pos - 1);
            let page = self.acquire(pgno)?;
            let page_start = pgno as u64 * PAGE_SIZE as u64;
            let lo = start.max(page_start);
            let slice = &page[(lo - page_start) as usize..=last];
            let remaining = &other[..other.len() - matched];
            let same = slice
                .iter()
                .rev()
                .zip(remaining.iter().rev())
                .take_while(|(a, b)| a == b)
                .count();
            matched += same;
            if same < slice.len() {
                break;
            }
            pos = lo;
        }
        Ok(matched)
    }
}

/// A held page. The page cannot be evicted while a guard for it is alive.
pub struct PageGuard<'a> {
    source: &'a PagedSource,
    pgno: usize,
    data: Rc<PageData>,
}

impl PageGuard<'_> {
    pub fn page_number(&self) -> usize {
        self.pgno
    }
}

impl Deref for PageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.source.release(self.pgno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31) ^ (i >> 11)) as u8).collect()
    }

    fn open_sample(len: usize, max_pages: usize) -> (tempfile::TempDir, Vec<u8>, PagedSource) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from.bin");
        let data = sample(len);
        std::fs::write(&path, &data).unwrap();
        let source = PagedSource::open(&path, max_pages).unwrap();
        (dir, data, source)
    }

    #[test]
    fn test_ceiling_is_never_exceeded() {
        let (_dir, data, source) = open_sample(PAGE_SIZE * 4 + 123, 2);
        assert_eq!(source.page_count(), 5);
        for pgno in 0..source.page_count() {
            let page = source.acquire(pgno).unwrap();
            let start = pgno * PAGE_SIZE;
            assert_eq!(&page[..], &data[start..(start + PAGE_SIZE).min(data.len())]);
            drop(page);
            assert!(source.resident_pages() <= 2);
        }
    }

    #[test]
    fn test_held_page_survives_eviction() {
        let (_dir, data, source) = open_sample(PAGE_SIZE * 3, 2);
        let held = source.acquire(0).unwrap();
        drop(source.acquire(1).unwrap());
        // Page 1 is the only unreferenced page, so it goes.
        drop(source.acquire(2).unwrap());
        assert_eq!(source.resident_pages(), 2);
        assert_eq!(held.page_number(), 0);
        assert_eq!(&held[..16], &data[..16]);
    }

    #[test]
    fn test_all_pages_held_is_an_error() {
        let (_dir, _data, source) = open_sample(PAGE_SIZE * 3, 2);
        let _a = source.acquire(0).unwrap();
        let _b = source.acquire(1).unwrap();
        assert!(matches!(
            source.acquire(2),
            Err(Error::PageBudget { max_pages: 2 })
        ));
    }

    #[test]
    fn test_checksum_after_out_of_order_access() {
        let (_dir, data, source) = open_sample(PAGE_SIZE * 2 + 777, 1);
        drop(source.acquire(2).unwrap());
        drop(source.acquire(1).unwrap());
        assert_eq!(source.finish_checksum().unwrap(), Checksum::of(&data));
    }

    #[test]
    fn test_copy_range_spans_pages() {
        let (_dir, data, source) = open_sample(PAGE_SIZE * 2 + 10, 1);
        let start = PAGE_SIZE as u64 - 5;
        let mut out = Vec::new();
        source
            .copy_range(start, PAGE_SIZE as u64 + 10, |chunk| {
                out.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(out, &data[start as usize..start as usize + PAGE_SIZE + 10]);

        let past_end = source.copy_range(data.len() as u64 - 2, 3, |_| Ok(()));
        assert!(matches!(past_end, Err(Error::CorruptDelta { .. })));
    }

    #[test]
    fn test_common_prefix_and_suffix_across_boundary() {
        let (_dir, data, source) = open_sample(PAGE_SIZE * 2, 2);
        let at = PAGE_SIZE - 100;
        let mut probe = data[at..at + 300].to_vec();
        assert_eq!(source.common_prefix(at as u64, &probe).unwrap(), 300);
        probe[250] ^= 0xFF;
        assert_eq!(source.common_prefix(at as u64, &probe).unwrap(), 250);

        let tail = data[at..at + 300].to_vec();
        assert_eq!(source.common_suffix((at + 300) as u64, &tail).unwrap(), 300);
        let mut tail = tail;
        tail[10] ^= 0xFF;
        assert_eq!(source.common_suffix((at + 300) as u64, &tail).unwrap(), 289);
    }

    #[test]
    fn test_empty_file() {
        let (_dir, _data, source) = open_sample(0, 4);
        assert_eq!(source.page_count(), 0);
        assert_eq!(source.finish_checksum().unwrap(), Checksum::of(b""));
        assert!(source.acquire(0).is_err());
    }
}
