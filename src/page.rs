//! Raw page format.
//!
//! Every page starts with a 16 byte header:
//!
//! ```text
//! | pgno u64 | flags u16 | count u16 | checksum u32 |
//! ```
//!
//! Branch and leaf pages follow the header with a slot array of `u16`
//! offsets, one per entry, while the entries themselves are packed from the
//! end of the page downward. All integers are little-endian.

use crc32fast::Hasher;

use crate::constants::{
    NodeFlags, PageFlags, Pgno, BRANCH_ENTRY_HEADER, LEAF_ENTRY_HEADER, PAGE_HEADER_SIZE,
    SLOT_SIZE,
};
use crate::error::{Error, Result};

const CHECKSUM_OFFSET: usize = 12;

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Page header matching the first 16 bytes of every page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    /// Page number
    pub(crate) pgno: Pgno,
    /// Page type flags
    pub(crate) flags: PageFlags,
    /// Number of entries (branch, leaf, free pages)
    pub(crate) count: u16,
    /// CRC-32 of the page with this field zeroed
    pub(crate) checksum: u32,
}

impl PageHeader {
    pub(crate) fn new(pgno: Pgno, flags: PageFlags, count: u16) -> Self {
        Self {
            pgno,
            flags,
            count,
            checksum: 0,
        }
    }

    pub(crate) fn read(buf: &[u8]) -> Self {
        Self {
            pgno: read_u64(buf, 0),
            flags: PageFlags::from_bits_retain(read_u16(buf, 8)),
            count: read_u16(buf, 10),
            checksum: read_u32(buf, CHECKSUM_OFFSET),
        }
    }

    pub(crate) fn write(&self, buf: &mut [u8]) {
        write_u64(buf, 0, self.pgno);
        write_u16(buf, 8, self.flags.bits());
        write_u16(buf, 10, self.count);
        write_u32(buf, CHECKSUM_OFFSET, self.checksum);
    }
}

/// CRC-32 over a page (or overflow run), skipping the checksum field
pub(crate) fn checksum(buf: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&buf[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[PAGE_HEADER_SIZE..]);
    hasher.finalize()
}

/// Stamp the checksum of a fully written page
pub(crate) fn seal(buf: &mut [u8]) {
    let sum = checksum(buf);
    write_u32(buf, CHECKSUM_OFFSET, sum);
}

/// Check the page number and checksum of a page read back from the map
pub(crate) fn verify(buf: &[u8], pgno: Pgno, check_sum: bool) -> Result<()> {
    let header = PageHeader::read(buf);
    if header.pgno != pgno {
        log::warn!("page {} carries page number {}", pgno, header.pgno);
        return Err(Error::CorruptPage { pgno });
    }
    if check_sum && header.checksum != checksum(buf) {
        log::warn!("checksum mismatch on page {}", pgno);
        return Err(Error::CorruptPage { pgno });
    }
    Ok(())
}

/// Location of a leaf value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: Pgno, len: usize },
}

/// Read-only view of a branch or leaf page inside the map.
///
/// The constructor validates the slot array and entry bounds once so the
/// accessors can index without further checks.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    header: PageHeader,
}

impl<'a> PageView<'a> {
    pub(crate) fn parse(data: &'a [u8], pgno: Pgno) -> Result<Self> {
        let header = PageHeader::read(data);
        let corrupt = || Error::CorruptPage { pgno };
        let leaf = header.flags.contains(PageFlags::LEAF);
        if leaf == header.flags.contains(PageFlags::BRANCH) {
            return Err(corrupt());
        }
        let count = header.count as usize;
        // descent always takes a child, so a branch needs at least one
        if !leaf && count == 0 {
            return Err(corrupt());
        }
        let slots_end = PAGE_HEADER_SIZE + count * SLOT_SIZE;
        if slots_end > data.len() {
            return Err(corrupt());
        }
        for i in 0..count {
            let off = read_u16(data, PAGE_HEADER_SIZE + i * SLOT_SIZE) as usize;
            let end = if leaf {
                if off + LEAF_ENTRY_HEADER > data.len() {
                    return Err(corrupt());
                }
                let flags = NodeFlags::from_bits_retain(data[off]);
                let klen = read_u16(data, off + 2) as usize;
                let dlen = read_u32(data, off + 4) as usize;
                let stored = if flags.contains(NodeFlags::BIGDATA) { 8 } else { dlen };
                off + LEAF_ENTRY_HEADER + klen + stored
            } else {
                if off + BRANCH_ENTRY_HEADER > data.len() {
                    return Err(corrupt());
                }
                off + BRANCH_ENTRY_HEADER + read_u16(data, off) as usize
            };
            if off < slots_end || end > data.len() {
                return Err(corrupt());
            }
        }
        Ok(Self { data, header })
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.header.flags.contains(PageFlags::LEAF)
    }

    pub(crate) fn len(&self) -> usize {
        self.header.count as usize
    }

    fn offset(&self, i: usize) -> usize {
        read_u16(self.data, PAGE_HEADER_SIZE + i * SLOT_SIZE) as usize
    }

    pub(crate) fn key(&self, i: usize) -> &'a [u8] {
        let off = self.offset(i);
        if self.is_leaf() {
            let klen = read_u16(self.data, off + 2) as usize;
            &self.data[off + LEAF_ENTRY_HEADER..off + LEAF_ENTRY_HEADER + klen]
        } else {
            let klen = read_u16(self.data, off) as usize;
            &self.data[off + BRANCH_ENTRY_HEADER..off + BRANCH_ENTRY_HEADER + klen]
        }
    }

    pub(crate) fn child(&self, i: usize) -> Pgno {
        read_u64(self.data, self.offset(i) + 2)
    }

    pub(crate) fn value(&self, i: usize) -> ValueRef<'a> {
        let off = self.offset(i);
        let flags = NodeFlags::from_bits_retain(self.data[off]);
        let klen = read_u16(self.data, off + 2) as usize;
        let dlen = read_u32(self.data, off + 4) as usize;
        let start = off + LEAF_ENTRY_HEADER + klen;
        if flags.contains(NodeFlags::BIGDATA) {
            ValueRef::Overflow {
                pgno: read_u64(self.data, start),
                len: dlen,
            }
        } else {
            ValueRef::Inline(&self.data[start..start + dlen])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    #[test]
    fn test_header_layout() {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::new(42, PageFlags::LEAF, 3).write(&mut buf);
        assert_eq!(&buf[0..8], &42u64.to_le_bytes());
        assert_eq!(&buf[8..10], &PageFlags::LEAF.bits().to_le_bytes());
        assert_eq!(&buf[10..12], &3u16.to_le_bytes());
        assert_eq!(PageHeader::read(&buf).count, 3);
    }

    #[test]
    fn test_seal_and_verify() {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::new(9, PageFlags::LEAF, 0).write(&mut buf);
        buf[100] = 0xAB;
        seal(&mut buf);
        assert!(verify(&buf, 9, true).is_ok());
        assert!(matches!(verify(&buf, 8, true), Err(Error::CorruptPage { pgno: 8 })));

        buf[200] ^= 0xFF;
        assert!(matches!(verify(&buf, 9, true), Err(Error::CorruptPage { pgno: 9 })));
        // number check still applies without checksums
        assert!(verify(&buf, 9, false).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_slots() {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::new(5, PageFlags::LEAF, 1).write(&mut buf);
        write_u16(&mut buf, PAGE_HEADER_SIZE, (PAGE_SIZE - 2) as u16);
        assert!(matches!(
            PageView::parse(&buf, 5),
            Err(Error::CorruptPage { pgno: 5 })
        ));
    }

    #[test]
    fn test_parse_rejects_empty_branch() {
        let mut buf = vec![0u8; PAGE_SIZE];
        PageHeader::new(6, PageFlags::BRANCH, 0).write(&mut buf);
        assert!(matches!(
            PageView::parse(&buf, 6),
            Err(Error::CorruptPage { pgno: 6 })
        ));

        // one entry with the empty first separator is fine
        PageHeader::new(6, PageFlags::BRANCH, 1).write(&mut buf);
        let off = PAGE_SIZE - BRANCH_ENTRY_HEADER;
        write_u16(&mut buf, PAGE_HEADER_SIZE, off as u16);
        write_u16(&mut buf, off, 0);
        write_u64(&mut buf, off + 2, 9);
        let view = PageView::parse(&buf, 6).unwrap();
        assert_eq!(view.child(0), 9);
    }
}
