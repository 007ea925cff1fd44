//! B+tree nodes.
//!
//! Committed nodes are read in place through [`PageView`]. A write
//! transaction copies every node it touches into an owned [`Node`] that is
//! serialized back into a page at commit. [`NodeRef`] lets the search and
//! cursor code treat both the same way.

use std::cmp::Ordering;
use std::mem;

use crate::constants::{
    NodeFlags, PageFlags, Pgno, BRANCH_ENTRY_HEADER, LEAF_ENTRY_HEADER, NODE_MAX,
    OVERFLOW_DATA_OFFSET, PAGE_HEADER_SIZE, PAGE_SIZE, SLOT_SIZE,
};
use crate::page::{seal, write_u16, write_u32, write_u64, PageHeader, PageView, ValueRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) child: Pgno,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Inline(Vec<u8>),
    Overflow { pgno: Pgno, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) value: LeafValue,
}

impl BranchEntry {
    fn size(&self) -> usize {
        SLOT_SIZE + BRANCH_ENTRY_HEADER + self.key.len()
    }
}

impl LeafEntry {
    fn size(&self) -> usize {
        let stored = match &self.value {
            LeafValue::Inline(data) => data.len(),
            LeafValue::Overflow { .. } => 8,
        };
        SLOT_SIZE + LEAF_ENTRY_HEADER + self.key.len() + stored
    }
}

/// Whether a key/value pair must spill its value to overflow pages
pub(crate) fn needs_overflow(key: &[u8], data: &[u8]) -> bool {
    SLOT_SIZE + LEAF_ENTRY_HEADER + key.len() + data.len() > NODE_MAX
}

/// Number of contiguous pages holding an overflow value
pub(crate) fn overflow_pages(len: usize) -> usize {
    (OVERFLOW_DATA_OFFSET + len).div_ceil(PAGE_SIZE)
}

/// An owned, mutable node of a write transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch(Vec<BranchEntry>),
    Leaf(Vec<LeafEntry>),
}

impl Node {
    pub(crate) fn from_view(view: &PageView<'_>) -> Self {
        if view.is_leaf() {
            let entries = (0..view.len())
                .map(|i| LeafEntry {
                    key: view.key(i).to_vec(),
                    value: match view.value(i) {
                        ValueRef::Inline(data) => LeafValue::Inline(data.to_vec()),
                        ValueRef::Overflow { pgno, len } => LeafValue::Overflow { pgno, len },
                    },
                })
                .collect();
            Node::Leaf(entries)
        } else {
            let entries = (0..view.len())
                .map(|i| BranchEntry {
                    key: view.key(i).to_vec(),
                    child: view.child(i),
                })
                .collect();
            Node::Branch(entries)
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Branch(entries) => entries.len(),
            Node::Leaf(entries) => entries.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized size in bytes
    pub(crate) fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + match self {
                Node::Branch(entries) => entries.iter().map(BranchEntry::size).sum::<usize>(),
                Node::Leaf(entries) => entries.iter().map(LeafEntry::size).sum::<usize>(),
            }
    }

    pub(crate) fn fits(&self) -> bool {
        self.size() <= PAGE_SIZE
    }

    /// Index at which to cut the node so both halves carry about the same
    /// number of bytes. Never returns 0 or `len`.
    fn split_index(&self) -> usize {
        let sizes: Vec<usize> = match self {
            Node::Branch(entries) => entries.iter().map(BranchEntry::size).collect(),
            Node::Leaf(entries) => entries.iter().map(LeafEntry::size).collect(),
        };
        let half = sizes.iter().sum::<usize>() / 2;
        let mut acc = 0;
        let mut idx = 0;
        while idx < sizes.len() && acc + sizes[idx] <= half {
            acc += sizes[idx];
            idx += 1;
        }
        idx.clamp(1, sizes.len() - 1)
    }

    /// Move the upper half into a new node. Returns the separator key that
    /// the parent stores in front of the new node.
    pub(crate) fn split_off(&mut self) -> (Vec<u8>, Node) {
        let at = self.split_index();
        match self {
            Node::Leaf(entries) => {
                let right = entries.split_off(at);
                (right[0].key.clone(), Node::Leaf(right))
            }
            Node::Branch(entries) => {
                let mut right = entries.split_off(at);
                // the leftmost separator of a branch is always empty
                let sep = mem::take(&mut right[0].key);
                (sep, Node::Branch(right))
            }
        }
    }

    /// Serialize into a page buffer and seal it
    pub(crate) fn write_to(&self, pgno: Pgno, buf: &mut [u8]) {
        debug_assert!(self.fits());
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        buf.fill(0);
        let flags = if self.is_leaf() {
            PageFlags::LEAF
        } else {
            PageFlags::BRANCH
        };
        PageHeader::new(pgno, flags, self.len() as u16).write(buf);

        let mut upper = PAGE_SIZE;
        match self {
            Node::Leaf(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    upper -= entry.size() - SLOT_SIZE;
                    write_u16(buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, upper as u16);
                    let key_start = upper + LEAF_ENTRY_HEADER;
                    let data_start = key_start + entry.key.len();
                    write_u16(buf, upper + 2, entry.key.len() as u16);
                    buf[key_start..data_start].copy_from_slice(&entry.key);
                    match &entry.value {
                        LeafValue::Inline(data) => {
                            buf[upper] = NodeFlags::empty().bits();
                            write_u32(buf, upper + 4, data.len() as u32);
                            buf[data_start..data_start + data.len()].copy_from_slice(data);
                        }
                        LeafValue::Overflow { pgno, len } => {
                            buf[upper] = NodeFlags::BIGDATA.bits();
                            write_u32(buf, upper + 4, *len as u32);
                            write_u64(buf, data_start, *pgno);
                        }
                    }
                }
            }
            Node::Branch(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    upper -= entry.size() - SLOT_SIZE;
                    write_u16(buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, upper as u16);
                    write_u16(buf, upper, entry.key.len() as u16);
                    write_u64(buf, upper + 2, entry.child);
                    let key_start = upper + BRANCH_ENTRY_HEADER;
                    buf[key_start..key_start + entry.key.len()].copy_from_slice(&entry.key);
                }
            }
        }
        seal(buf);
    }
}

/// A node as seen by a transaction: in the map or in the dirty set
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Page(PageView<'a>),
    Dirty(&'a Node),
}

impl<'a> NodeRef<'a> {
    pub(crate) fn is_leaf(&self) -> bool {
        match self {
            NodeRef::Page(view) => view.is_leaf(),
            NodeRef::Dirty(node) => node.is_leaf(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            NodeRef::Page(view) => view.len(),
            NodeRef::Dirty(node) => node.len(),
        }
    }

    pub(crate) fn key(&self, i: usize) -> &'a [u8] {
        match *self {
            NodeRef::Page(view) => view.key(i),
            NodeRef::Dirty(Node::Leaf(entries)) => &entries[i].key,
            NodeRef::Dirty(Node::Branch(entries)) => &entries[i].key,
        }
    }

    pub(crate) fn child(&self, i: usize) -> Pgno {
        match *self {
            NodeRef::Page(view) => view.child(i),
            NodeRef::Dirty(Node::Branch(entries)) => entries[i].child,
            NodeRef::Dirty(Node::Leaf(_)) => unreachable!("child of a leaf"),
        }
    }

    pub(crate) fn value(&self, i: usize) -> ValueRef<'a> {
        match *self {
            NodeRef::Page(view) => view.value(i),
            NodeRef::Dirty(Node::Leaf(entries)) => match &entries[i].value {
                LeafValue::Inline(data) => ValueRef::Inline(data),
                LeafValue::Overflow { pgno, len } => ValueRef::Overflow {
                    pgno: *pgno,
                    len: *len,
                },
            },
            NodeRef::Dirty(Node::Branch(_)) => unreachable!("value of a branch"),
        }
    }

    /// Binary search a leaf: `Ok(i)` on a match, `Err(i)` for the insertion
    /// point.
    pub(crate) fn search(&self, key: &[u8]) -> Result<usize, usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Index of the branch entry whose subtree may contain `key`
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        // entry 0 has an empty separator and covers everything below entry 1
        let (mut lo, mut hi) = (1, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo - 1
    }
}
