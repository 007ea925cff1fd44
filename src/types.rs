use std::time::Duration;

use crate::constants::{Pgno, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    GetCurrent,
    Last,
    Next,
    Prev,
    /// Position at the exact key
    Set,
    /// Position at the first key greater than or equal to the given one
    SetRange,
}

/// How `begin_write` behaves while another write transaction is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteWait {
    /// Fail right away with `Error::WriteConflict`
    #[default]
    NoWait,
    /// Block until the active writer finishes
    Block,
    /// Block for at most the given duration, then fail with `Error::WriteConflict`
    Timeout(Duration),
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of overflow pages
    pub overflow_pages: usize,
    /// Number of data entries
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub file_size: u64,
    pub last_pgno: Pgno,
    pub last_txnid: TxnId,
    pub max_readers: u32,
    pub num_readers: u32,
}

/// A pinned snapshot in the reader table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Snapshot version being read
    pub txn_id: TxnId,
    /// Open read transactions on that version
    pub count: usize,
}
