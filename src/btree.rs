//! Copy-on-write B+tree algorithms.
//!
//! Reads walk from the root of a snapshot down to a leaf. Writes copy every
//! node on the path into the transaction's dirty set first ("touch"), then
//! mutate the copies. Nodes that no longer fit are split and the split is
//! carried up to the root. Nodes left empty by a delete are unlinked; there
//! is no rebalancing.

use std::mem;

use crate::constants::{Pgno, WriteFlags, MAX_KEY_SIZE, MAX_VALUE_SIZE, P_INVALID};
use crate::error::{Error, Result};
use crate::meta::MetaHeader;
use crate::node::{needs_overflow, overflow_pages, BranchEntry, LeafEntry, LeafValue, Node, NodeRef};
use crate::page::ValueRef;

/// Read access to one consistent version of the tree.
///
/// Implemented by both transaction kinds. The trait lives in a private
/// module, so it can be named in bounds but not implemented outside the
/// crate.
pub trait Snapshot {
    /// Meta of the version this snapshot sees
    fn meta(&self) -> &MetaHeader;

    /// Fetch a branch or leaf node
    fn node(&self, pgno: Pgno) -> Result<NodeRef<'_>>;

    /// Fetch the bytes of a leaf value, following overflow pages
    fn resolve<'a>(&'a self, value: ValueRef<'a>) -> Result<&'a [u8]>;

    /// Fail with `InvalidState` once the transaction has finished
    fn ensure_active(&self) -> Result<()>;
}

/// Page management a write transaction offers to the tree algorithms
pub(crate) trait PageAlloc: Snapshot {
    /// Make `pgno` writable, copying it into the dirty set if needed.
    /// Returns the page number of the writable copy.
    fn touch(&mut self, pgno: Pgno) -> Result<Pgno>;

    /// Borrow a node previously returned by `touch` or `insert_node`
    fn dirty(&mut self, pgno: Pgno) -> Result<&mut Node>;

    /// Allocate a page for a new node
    fn insert_node(&mut self, node: Node) -> Result<Pgno>;

    /// Store a value in a fresh overflow run
    fn store_overflow(&mut self, data: &[u8]) -> Result<Pgno>;

    /// Give back `npages` pages starting at `pgno`
    fn release(&mut self, pgno: Pgno, npages: usize);

    fn meta_mut(&mut self) -> &mut MetaHeader;
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::BadValSize(key.len()));
    }
    Ok(())
}

/// Value lengths are stored as `u32`
fn check_value_len(len: usize) -> Result<()> {
    if len > MAX_VALUE_SIZE {
        return Err(Error::BadValSize(len));
    }
    Ok(())
}

/// Look up `key` in the snapshot
pub(crate) fn get<'t, S: Snapshot + ?Sized>(txn: &'t S, key: &[u8]) -> Result<Option<&'t [u8]>> {
    txn.ensure_active()?;
    let Some(mut pgno) = txn.meta().root() else {
        return Ok(None);
    };
    // a well-formed tree never needs more hops than its depth
    for _ in 0..txn.meta().depth.max(1) {
        let node = txn.node(pgno)?;
        if node.is_leaf() {
            return match node.search(key) {
                Ok(i) => txn.resolve(node.value(i)).map(Some),
                Err(_) => Ok(None),
            };
        }
        pgno = node.child(node.child_index(key));
    }
    Err(Error::CorruptPage { pgno })
}

/// Copy the path from the root to the leaf that owns `key` into the dirty
/// set. Returns the dirty leaf and the (branch, child index) pairs above it.
fn touch_path<T: PageAlloc + ?Sized>(
    txn: &mut T,
    root: Pgno,
    key: &[u8],
) -> Result<(Pgno, Vec<(Pgno, usize)>)> {
    let mut path = Vec::with_capacity(txn.meta().depth as usize);
    let mut pgno = txn.touch(root)?;
    txn.meta_mut().root = pgno;
    loop {
        let (idx, child) = match txn.dirty(pgno)? {
            Node::Leaf(_) => return Ok((pgno, path)),
            Node::Branch(entries) => {
                let idx = branch_index(entries, key);
                (idx, entries[idx].child)
            }
        };
        let copy = txn.touch(child)?;
        if copy != child {
            if let Node::Branch(entries) = txn.dirty(pgno)? {
                entries[idx].child = copy;
            }
        }
        path.push((pgno, idx));
        pgno = copy;
    }
}

fn branch_index(entries: &[BranchEntry], key: &[u8]) -> usize {
    entries
        .partition_point(|e| e.key.as_slice() <= key)
        .saturating_sub(1)
}

fn leaf_entries<T: PageAlloc + ?Sized>(txn: &mut T, pgno: Pgno) -> Result<&mut Vec<LeafEntry>> {
    match txn.dirty(pgno)? {
        Node::Leaf(entries) => Ok(entries),
        Node::Branch(_) => Err(Error::CorruptPage { pgno }),
    }
}

fn count_page(meta: &mut MetaHeader, leaf: bool, delta: i64) {
    let counter = if leaf {
        &mut meta.leaf_pages
    } else {
        &mut meta.branch_pages
    };
    *counter = counter.saturating_add_signed(delta);
}

fn release_value<T: PageAlloc + ?Sized>(txn: &mut T, value: LeafValue) {
    if let LeafValue::Overflow { pgno, len } = value {
        let npages = overflow_pages(len);
        txn.release(pgno, npages);
        let meta = txn.meta_mut();
        meta.overflow_pages = meta.overflow_pages.saturating_sub(npages as u64);
    }
}

/// Insert or replace `key`
pub(crate) fn put<T: PageAlloc + ?Sized>(
    txn: &mut T,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    check_key(key)?;
    check_value_len(data.len())?;
    if flags.contains(WriteFlags::NOOVERWRITE) && get(txn, key)?.is_some() {
        return Err(Error::KeyExist);
    }
    txn.ensure_active()?;

    let value = if needs_overflow(key, data) {
        LeafValue::Overflow {
            pgno: txn.store_overflow(data)?,
            len: data.len(),
        }
    } else {
        LeafValue::Inline(data.to_vec())
    };

    let Some(root) = txn.meta().root() else {
        let pgno = txn.insert_node(Node::Leaf(vec![LeafEntry {
            key: key.to_vec(),
            value,
        }]))?;
        let meta = txn.meta_mut();
        meta.root = pgno;
        meta.depth = 1;
        meta.leaf_pages += 1;
        meta.entries += 1;
        return Ok(());
    };

    let (leaf, mut path) = touch_path(txn, root, key)?;
    let entries = leaf_entries(txn, leaf)?;
    let replaced = match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
        Ok(i) => Some(mem::replace(&mut entries[i].value, value)),
        Err(i) => {
            entries.insert(
                i,
                LeafEntry {
                    key: key.to_vec(),
                    value,
                },
            );
            None
        }
    };
    match replaced {
        Some(old) => release_value(txn, old),
        None => txn.meta_mut().entries += 1,
    }

    // split upward while the current node overflows its page
    let mut current = leaf;
    while !txn.dirty(current)?.fits() {
        let (separator, right) = txn.dirty(current)?.split_off();
        let is_leaf = right.is_leaf();
        let right_pgno = txn.insert_node(right)?;
        count_page(txn.meta_mut(), is_leaf, 1);
        log::trace!("split page {} into {} at {:?}", current, right_pgno, separator);

        match path.pop() {
            Some((parent, idx)) => {
                if let Node::Branch(entries) = txn.dirty(parent)? {
                    entries.insert(
                        idx + 1,
                        BranchEntry {
                            key: separator,
                            child: right_pgno,
                        },
                    );
                }
                current = parent;
            }
            None => {
                let new_root = txn.insert_node(Node::Branch(vec![
                    BranchEntry {
                        key: Vec::new(),
                        child: current,
                    },
                    BranchEntry {
                        key: separator,
                        child: right_pgno,
                    },
                ]))?;
                let meta = txn.meta_mut();
                meta.root = new_root;
                meta.depth += 1;
                meta.branch_pages += 1;
                log::trace!("new root {} at depth {}", new_root, meta.depth);
                break;
            }
        }
    }
    Ok(())
}

/// Remove `key`. Returns whether it was present; an absent key leaves the
/// tree untouched.
pub(crate) fn delete<T: PageAlloc + ?Sized>(txn: &mut T, key: &[u8]) -> Result<bool> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Ok(false);
    }
    if get(txn, key)?.is_none() {
        return Ok(false);
    }
    let Some(root) = txn.meta().root() else {
        return Ok(false);
    };

    let (leaf, mut path) = touch_path(txn, root, key)?;
    let entries = leaf_entries(txn, leaf)?;
    let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
        return Err(Error::CorruptPage { pgno: leaf });
    };
    let removed = entries.remove(i);
    release_value(txn, removed.value);
    let meta = txn.meta_mut();
    meta.entries = meta.entries.saturating_sub(1);

    // unlink nodes left empty
    let mut current = leaf;
    while txn.dirty(current)?.is_empty() {
        let is_leaf = txn.dirty(current)?.is_leaf();
        txn.release(current, 1);
        count_page(txn.meta_mut(), is_leaf, -1);
        match path.pop() {
            Some((parent, idx)) => {
                if let Node::Branch(entries) = txn.dirty(parent)? {
                    entries.remove(idx);
                    if idx == 0 {
                        if let Some(first) = entries.first_mut() {
                            first.key.clear();
                        }
                    }
                }
                current = parent;
            }
            None => {
                let meta = txn.meta_mut();
                meta.root = P_INVALID;
                meta.depth = 0;
                return Ok(true);
            }
        }
    }

    // collapse single-child roots
    while let Some(root) = txn.meta().root() {
        let node = txn.node(root)?;
        if node.is_leaf() || node.len() != 1 {
            break;
        }
        let child = node.child(0);
        txn.release(root, 1);
        let meta = txn.meta_mut();
        meta.root = child;
        meta.depth -= 1;
        meta.branch_pages = meta.branch_pages.saturating_sub(1);
        log::trace!("collapsed root {} into {}", root, child);
    }
    Ok(true)
}
