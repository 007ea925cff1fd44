//! Memory-mapped data file.
//!
//! The file holds two meta pages followed by data pages of `PAGE_SIZE`
//! bytes. A writable environment reserves the whole map size up front and
//! grows only the file underneath it, so page slices handed out to readers
//! stay valid while a writer extends the file.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapOptions, MmapRaw};

use crate::constants::{PageFlags, Pgno, INITIAL_FILE_PAGES, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::{verify, PageHeader, PageView};

enum Mapping {
    ReadWrite(MmapRaw),
    ReadOnly(Mmap),
}

impl Mapping {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Mapping::ReadWrite(map) => map.as_ptr(),
            Mapping::ReadOnly(map) => map.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Mapping::ReadWrite(map) => map.len(),
            Mapping::ReadOnly(map) => map.len(),
        }
    }
}

pub(crate) struct Pager {
    file: File,
    map: Mapping,
    file_size: AtomicU64,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("map_size", &self.map.len())
            .field("file_size", &self.file_size())
            .finish()
    }
}

fn round_to_page(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
}

impl Pager {
    /// Open or create the data file and map it.
    ///
    /// Returns the pager and whether the file was freshly created.
    pub(crate) fn open(path: &Path, map_size: usize, readonly: bool) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .truncate(false)
            .open(path)?;

        let mut file_size = file.metadata()?.len();
        let is_new = file_size == 0;
        if is_new {
            if readonly {
                return Err(Error::Invalid);
            }
            let initial = (INITIAL_FILE_PAGES * PAGE_SIZE).min(map_size) as u64;
            file.set_len(initial)?;
            file_size = initial;
        }
        if file_size < (META_PAGES * PAGE_SIZE) as u64 {
            return Err(Error::Invalid);
        }

        let map = if readonly {
            let len = round_to_page(file_size) as usize;
            // SAFETY: the file is not truncated while mapped; readers only
            // touch pages below the committed next_pgno.
            Mapping::ReadOnly(unsafe { MmapOptions::new().len(len).map(&file)? })
        } else {
            let len = map_size.max(round_to_page(file_size) as usize);
            Mapping::ReadWrite(MmapOptions::new().len(len).map_raw(&file)?)
        };

        Ok((
            Self {
                file,
                map,
                file_size: AtomicU64::new(file_size),
            },
            is_new,
        ))
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map.len()
    }

    /// Pages the map can ever hold
    pub(crate) fn max_pages(&self) -> Pgno {
        (self.map.len() / PAGE_SIZE) as Pgno
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Borrow `npages` contiguous pages starting at `pgno`
    pub(crate) fn bytes(&self, pgno: Pgno, npages: usize) -> Result<&[u8]> {
        let start = pgno as usize * PAGE_SIZE;
        let len = npages * PAGE_SIZE;
        let end = start.checked_add(len).ok_or(Error::CorruptPage { pgno })?;
        if npages == 0 || end as u64 > self.file_size() || end > self.map.len() {
            return Err(Error::CorruptPage { pgno });
        }
        // SAFETY: the range lies inside both the mapping and the file.
        // Pages reachable from a pinned snapshot are never written while
        // that snapshot is alive, so the bytes do not change under the
        // returned borrow.
        Ok(unsafe { slice::from_raw_parts(self.map.as_ptr().add(start), len) })
    }

    /// Read a branch or leaf page
    pub(crate) fn read_node(&self, pgno: Pgno, check_sum: bool) -> Result<PageView<'_>> {
        let buf = self.bytes(pgno, 1)?;
        verify(buf, pgno, check_sum)?;
        PageView::parse(buf, pgno)
    }

    /// Read an overflow value of `len` bytes stored at `pgno`
    pub(crate) fn read_overflow(&self, pgno: Pgno, len: usize, check_sum: bool) -> Result<&[u8]> {
        let npages = crate::node::overflow_pages(len);
        let run = self.bytes(pgno, npages)?;
        let header = PageHeader::read(run);
        if !header.flags.contains(PageFlags::OVERFLOW) {
            return Err(Error::CorruptPage { pgno });
        }
        verify(run, pgno, check_sum)?;
        let start = crate::constants::OVERFLOW_DATA_OFFSET;
        Ok(&run[start..start + len])
    }

    /// Read a free list page
    pub(crate) fn read_freelist(&self, pgno: Pgno) -> Result<&[u8]> {
        let buf = self.bytes(pgno, 1)?;
        verify(buf, pgno, true)?;
        if !PageHeader::read(buf).flags.contains(PageFlags::FREELIST) {
            return Err(Error::CorruptPage { pgno });
        }
        Ok(buf)
    }

    /// Copy `data` into the map at `pgno`.
    ///
    /// Only the active writer calls this, and only for pages no pinned
    /// snapshot can reach.
    pub(crate) fn write(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let map = match &self.map {
            Mapping::ReadWrite(map) => map,
            Mapping::ReadOnly(_) => return Err(Error::ReadOnly),
        };
        let start = pgno as usize * PAGE_SIZE;
        if start + data.len() > self.file_size() as usize {
            return Err(Error::OutOfSpace);
        }
        // SAFETY: bounds checked above; see the method contract for aliasing.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), map.as_mut_ptr().add(start), data.len());
        }
        Ok(())
    }

    /// Make sure the file covers `len` bytes, doubling its size as needed.
    /// The file never shrinks.
    pub(crate) fn grow(&self, len: u64) -> Result<()> {
        let current = self.file_size();
        if len <= current {
            return Ok(());
        }
        if len > self.map.len() as u64 {
            return Err(Error::OutOfSpace);
        }
        let target = round_to_page(len.max(current * 2)).min(self.map.len() as u64);
        self.file.set_len(target)?;
        self.file_size.store(target, Ordering::Release);
        log::debug!("grew data file from {} to {} bytes", current, target);
        Ok(())
    }

    /// Flush a page range of the map to disk
    pub(crate) fn flush_pages(&self, pgno: Pgno, npages: usize) -> Result<()> {
        if let Mapping::ReadWrite(map) = &self.map {
            map.flush_range(pgno as usize * PAGE_SIZE, npages * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Flush the whole map, then the file metadata
    pub(crate) fn flush(&self) -> Result<()> {
        if let Mapping::ReadWrite(map) = &self.map {
            map.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
