use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const NOCHECKSUM = 0x1000000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();

        // Transaction-specific flags
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const DIRTY = 0x04;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        const BIGDATA = 0x01;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const FREELIST = 0x10;
    }
}

/// Page number inside the data file
pub type Pgno = u64;

/// Transaction id, doubles as the snapshot version
pub type TxnId = u64;

/// Marker for "no page" in meta and overflow fields
pub const P_INVALID: Pgno = u64::MAX;

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for embedb data files
pub const MAGIC: u32 = 0xBEEF_DEAD;
/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;
/// Pages 0 and 1 hold the double-buffered meta
pub const META_PAGES: usize = 2;

/// Size of the header at the start of every page
pub const PAGE_HEADER_SIZE: usize = 16;
/// Overflow data starts after the header and the run length
pub const OVERFLOW_DATA_OFFSET: usize = PAGE_HEADER_SIZE + 8;
/// Free pages store a next pointer before their records
pub const FREELIST_DATA_OFFSET: usize = PAGE_HEADER_SIZE + 8;
/// (txnid, pgno) pair
pub const FREELIST_RECORD_SIZE: usize = 16;

/// Largest key accepted by put
pub const MAX_KEY_SIZE: usize = 511;

/// Largest value a leaf entry can describe
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;
/// Largest leaf entry kept inline; bigger values move to overflow pages.
/// A quarter page keeps at least four entries on every leaf.
pub const NODE_MAX: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 4;

/// Leaf entry: flags, pad, key_len, data_len
pub const LEAF_ENTRY_HEADER: usize = 8;
/// Branch entry: key_len, child
pub const BRANCH_ENTRY_HEADER: usize = 10;
/// Slot array element
pub const SLOT_SIZE: usize = 2;

/// Default map size (10 MiB)
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
/// Default reader slots
pub const DEFAULT_MAX_READERS: u32 = 126;
/// File size for a fresh database, in pages
pub const INITIAL_FILE_PAGES: usize = 16;
