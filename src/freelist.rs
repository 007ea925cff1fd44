//! Free page tracking.
//!
//! Pages released by a commit are recorded under the id of the transaction
//! that released them. They stay untouched until every reader has moved past
//! that version, then a later writer may reuse them.
//!
//! The list is persisted as a chain of `FREELIST` pages:
//!
//! ```text
//! | header | next u64 | (txnid u64, pgno u64) * count |
//! ```

use std::collections::BTreeMap;

use crate::constants::{
    PageFlags, Pgno, TxnId, FREELIST_DATA_OFFSET, FREELIST_RECORD_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE,
    P_INVALID,
};
use crate::error::{Error, Result};
use crate::midl::IdList;
use crate::page::{read_u64, seal, write_u64, PageHeader};
use crate::pager::Pager;

/// Records that fit on one free list page
pub(crate) const RECORDS_PER_PAGE: usize = (PAGE_SIZE - FREELIST_DATA_OFFSET) / FREELIST_RECORD_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FreeList {
    pending: BTreeMap<TxnId, Vec<Pgno>>,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Load the persisted list. Also returns the pages of the chain itself,
    /// which the next commit releases.
    pub(crate) fn load(pager: &Pager, head: Option<Pgno>, limit: Pgno) -> Result<(Self, Vec<Pgno>)> {
        let mut list = FreeList::new();
        let mut chain = Vec::new();
        let mut next = head;
        while let Some(pgno) = next {
            if pgno >= limit || chain.len() as Pgno >= limit {
                return Err(Error::CorruptPage { pgno });
            }
            let buf = pager.read_freelist(pgno)?;
            let count = PageHeader::read(buf).count as usize;
            if count > RECORDS_PER_PAGE {
                return Err(Error::CorruptPage { pgno });
            }
            for i in 0..count {
                let off = FREELIST_DATA_OFFSET + i * FREELIST_RECORD_SIZE;
                list.free(read_u64(buf, off), read_u64(buf, off + 8));
            }
            chain.push(pgno);
            let link = read_u64(buf, PAGE_HEADER_SIZE);
            next = (link != P_INVALID).then_some(link);
        }
        Ok((list, chain))
    }

    pub(crate) fn free(&mut self, txnid: TxnId, pgno: Pgno) {
        self.pending.entry(txnid).or_default().push(pgno);
    }

    pub(crate) fn free_all<I: IntoIterator<Item = Pgno>>(&mut self, txnid: TxnId, pages: I) {
        for pgno in pages {
            self.free(txnid, pgno);
        }
    }

    /// Remove and return every page released at or before `oldest`
    pub(crate) fn take_reclaimable(&mut self, oldest: TxnId) -> IdList {
        let keep = self.pending.split_off(&oldest.saturating_add(1));
        let reclaimed = std::mem::replace(&mut self.pending, keep);
        reclaimed.into_values().flatten().collect()
    }

    /// Number of (txnid, pgno) records
    pub(crate) fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub(crate) fn pages_needed(&self) -> usize {
        self.len().div_ceil(RECORDS_PER_PAGE)
    }

    /// Serialize into the given chain of pages, one buffer per page.
    /// Pages beyond what the records need are written empty.
    pub(crate) fn encode(&self, chain: &[Pgno]) -> Vec<Vec<u8>> {
        debug_assert!(chain.len() >= self.pages_needed());
        let records: Vec<(TxnId, Pgno)> = self
            .pending
            .iter()
            .flat_map(|(txnid, pages)| pages.iter().map(move |pgno| (*txnid, *pgno)))
            .collect();
        let mut chunks = records.chunks(RECORDS_PER_PAGE);

        chain
            .iter()
            .enumerate()
            .map(|(i, pgno)| {
                let chunk = chunks.next().unwrap_or_default();
                let mut buf = vec![0u8; PAGE_SIZE];
                PageHeader::new(*pgno, PageFlags::FREELIST, chunk.len() as u16).write(&mut buf);
                let next = chain.get(i + 1).copied().unwrap_or(P_INVALID);
                write_u64(&mut buf, PAGE_HEADER_SIZE, next);
                for (j, (txnid, freed)) in chunk.iter().enumerate() {
                    let off = FREELIST_DATA_OFFSET + j * FREELIST_RECORD_SIZE;
                    write_u64(&mut buf, off, *txnid);
                    write_u64(&mut buf, off + 8, *freed);
                }
                seal(&mut buf);
                buf
            })
            .collect()
    }
}
