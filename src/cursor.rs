use bitflags::bitflags;

use crate::btree::Snapshot;
use crate::error::{Error, Result};
use crate::node::NodeRef;
use crate::types::CursorOp;

bitflags! {
    /// Cursor state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct CursorFlags: u8 {
        /// Positioned on an entry, or just past either end
        const INITIALIZED = 0x01;
        /// Moved past the last entry
        const EOF = 0x02;
        /// Moved before the first entry
        const BOF = 0x04;
    }
}

/// A key/value pair borrowed from the transaction
pub type Entry<'txn> = (&'txn [u8], &'txn [u8]);

/// Ordered traversal over one transaction's snapshot.
///
/// The cursor keeps the path from the root to its current leaf, so
/// stepping to a neighbour only re-reads the pages that change. It borrows
/// its transaction and cannot outlive it.
pub struct Cursor<'txn> {
    /// The transaction this cursor belongs to
    txn: &'txn dyn Snapshot,
    /// Nodes from the root to the current leaf, with the index taken at each
    stack: Vec<(NodeRef<'txn>, usize)>,
    /// Cursor state flags
    flags: CursorFlags,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("depth", &self.stack.len())
            .field("flags", &self.flags)
            .finish()
    }
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(txn: &'txn dyn Snapshot) -> Result<Self> {
        txn.ensure_active()?;
        Ok(Cursor {
            txn,
            stack: Vec::with_capacity(txn.meta().depth as usize),
            flags: CursorFlags::empty(),
        })
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.flags = CursorFlags::empty();
    }

    /// Descend from `pgno`, taking the first (or last) entry at each level
    fn descend_edge(&mut self, mut pgno: u64, last: bool) -> Result<()> {
        let txn = self.txn;
        loop {
            let node = txn.node(pgno)?;
            let idx = if last { node.len().saturating_sub(1) } else { 0 };
            self.stack.push((node, idx));
            if node.is_leaf() {
                return Ok(());
            }
            if node.len() == 0 || self.stack.len() > txn.meta().depth as usize {
                return Err(Error::CorruptPage { pgno });
            }
            pgno = node.child(idx);
        }
    }

    fn edge(&mut self, last: bool) -> Result<Option<Entry<'txn>>> {
        self.txn.ensure_active()?;
        self.reset();
        let Some(root) = self.txn.meta().root() else {
            return Ok(None);
        };
        self.descend_edge(root, last)?;
        self.flags = CursorFlags::INITIALIZED;
        self.current()
    }

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<Entry<'txn>>> {
        self.edge(false)
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<Option<Entry<'txn>>> {
        self.edge(true)
    }

    /// Step forward. An unpositioned cursor moves to the first entry.
    pub fn next(&mut self) -> Result<Option<Entry<'txn>>> {
        self.txn.ensure_active()?;
        if !self.flags.contains(CursorFlags::INITIALIZED) || self.flags.contains(CursorFlags::BOF) {
            return self.first();
        }
        if self.flags.contains(CursorFlags::EOF) {
            return Ok(None);
        }
        if self.step(true)? {
            self.current()
        } else {
            self.flags.insert(CursorFlags::EOF);
            Ok(None)
        }
    }

    /// Step backward. An unpositioned cursor moves to the last entry.
    pub fn prev(&mut self) -> Result<Option<Entry<'txn>>> {
        self.txn.ensure_active()?;
        if !self.flags.contains(CursorFlags::INITIALIZED) || self.flags.contains(CursorFlags::EOF) {
            return self.last();
        }
        if self.flags.contains(CursorFlags::BOF) {
            return Ok(None);
        }
        if self.step(false)? {
            self.current()
        } else {
            self.flags.insert(CursorFlags::BOF);
            Ok(None)
        }
    }

    /// Move one entry along the leaf level. Returns false, leaving the
    /// position unchanged, at either end.
    fn step(&mut self, forward: bool) -> Result<bool> {
        let Some(mut level) = self.stack.len().checked_sub(1) else {
            return Ok(false);
        };
        loop {
            let (node, idx) = self.stack[level];
            let moved = if forward {
                (idx + 1 < node.len()).then(|| idx + 1)
            } else {
                idx.checked_sub(1).filter(|i| *i < node.len())
            };
            if let Some(idx) = moved {
                self.stack[level].1 = idx;
                break;
            }
            if level == 0 {
                return Ok(false);
            }
            level -= 1;
        }

        // rebuild the levels below the one that moved
        let txn = self.txn;
        for below in level + 1..self.stack.len() {
            let (parent, idx) = self.stack[below - 1];
            let node = txn.node(parent.child(idx))?;
            let idx = if forward { 0 } else { node.len().saturating_sub(1) };
            self.stack[below] = (node, idx);
        }
        Ok(true)
    }

    /// Position at the first entry whose key is `>= key`
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        self.txn.ensure_active()?;
        self.reset();
        let txn = self.txn;
        let Some(mut pgno) = txn.meta().root() else {
            return Ok(None);
        };
        loop {
            let node = txn.node(pgno)?;
            if node.is_leaf() {
                let idx = node.search(key).unwrap_or_else(|i| i);
                self.stack.push((node, idx));
                break;
            }
            if self.stack.len() >= txn.meta().depth as usize {
                return Err(Error::CorruptPage { pgno });
            }
            let idx = node.child_index(key);
            self.stack.push((node, idx));
            pgno = node.child(idx);
        }
        self.flags = CursorFlags::INITIALIZED;

        let (leaf, idx) = self.stack[self.stack.len() - 1];
        if idx < leaf.len() {
            return self.current();
        }
        // past the end of this leaf: the answer is the next leaf's first key
        if self.step(true)? {
            self.current()
        } else {
            self.flags.insert(CursorFlags::EOF);
            Ok(None)
        }
    }

    /// Position at exactly `key`
    pub fn set(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        match self.seek(key)? {
            Some(entry) if entry.0 == key => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Entry at the current position, if any
    pub fn get_current(&self) -> Result<Option<Entry<'txn>>> {
        self.txn.ensure_active()?;
        self.current()
    }

    /// Run a positioning operation. `key` is required by `Set` and
    /// `SetRange` and ignored otherwise.
    pub fn get(&mut self, key: Option<&[u8]>, op: CursorOp) -> Result<Option<Entry<'txn>>> {
        match op {
            CursorOp::First => self.first(),
            CursorOp::Last => self.last(),
            CursorOp::Next => self.next(),
            CursorOp::Prev => self.prev(),
            CursorOp::GetCurrent => self.get_current(),
            CursorOp::Set => self.set(key.ok_or(Error::BadValSize(0))?),
            CursorOp::SetRange => self.seek(key.ok_or(Error::BadValSize(0))?),
        }
    }

    fn current(&self) -> Result<Option<Entry<'txn>>> {
        if !self.flags.contains(CursorFlags::INITIALIZED)
            || self.flags.intersects(CursorFlags::EOF | CursorFlags::BOF)
        {
            return Ok(None);
        }
        let Some(&(leaf, idx)) = self.stack.last() else {
            return Ok(None);
        };
        if idx >= leaf.len() {
            return Ok(None);
        }
        let txn = self.txn;
        Ok(Some((leaf.key(idx), txn.resolve(leaf.value(idx))?)))
    }

    /// Iterate forward from the first entry
    pub fn iter(self) -> Iter<'txn> {
        Iter {
            cursor: self,
            start: Start::First,
        }
    }

    /// Iterate forward from the first key `>= key`
    pub fn iter_from(self, key: &[u8]) -> Iter<'txn> {
        Iter {
            cursor: self,
            start: Start::Seek(key.to_vec()),
        }
    }
}

enum Start {
    First,
    Seek(Vec<u8>),
    Started,
}

/// Forward iterator over a cursor's entries
pub struct Iter<'txn> {
    cursor: Cursor<'txn>,
    start: Start,
}

impl<'txn> Iterator for Iter<'txn> {
    type Item = Result<Entry<'txn>>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = match std::mem::replace(&mut self.start, Start::Started) {
            Start::First => self.cursor.first(),
            Start::Seek(key) => self.cursor.seek(&key),
            Start::Started => self.cursor.next(),
        };
        let item = step.transpose();
        if matches!(item, Some(Err(_))) {
            // stop after the first error
            self.cursor.flags = CursorFlags::INITIALIZED | CursorFlags::EOF;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use crate::constants::PAGE_SIZE;
    use crate::env::Environment;
    use crate::transaction::Transaction;
    use crate::types::CursorOp;
    use tempfile::TempDir;

    fn key(i: u32) -> Vec<u8> {
        format!("{:08}", i).into_bytes()
    }

    fn filled(dir: &TempDir, n: u32) -> Environment {
        let env = Environment::open(dir.path().join("data.edb"), 1 << 24, false).unwrap();
        let mut txn = env.begin_write().unwrap();
        for i in 0..n {
            txn.put(&key(i * 2), &i.to_le_bytes()).unwrap();
        }
        txn.commit().unwrap();
        env
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let env = filled(&dir, 0);
        let txn = env.begin_read().unwrap();
        let mut cursor = txn.cursor().unwrap();
        assert_eq!(cursor.first().unwrap(), None);
        assert_eq!(cursor.last().unwrap(), None);
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.seek(b"a").unwrap(), None);
    }

    #[test]
    fn test_walk_both_directions_across_leaves() {
        let dir = TempDir::new().unwrap();
        let env = filled(&dir, 3000);
        let txn = env.begin_read().unwrap();
        assert!(txn.stat().depth >= 2);

        let mut cursor = txn.cursor().unwrap();
        let mut count = 0;
        let mut entry = cursor.first().unwrap();
        while let Some((k, v)) = entry {
            assert_eq!(k, key(count * 2).as_slice());
            assert_eq!(v, count.to_le_bytes());
            count += 1;
            entry = cursor.next().unwrap();
        }
        assert_eq!(count, 3000);
        assert_eq!(cursor.next().unwrap(), None);

        // stepping back from the end lands on the last entry
        let (k, _) = cursor.prev().unwrap().unwrap();
        assert_eq!(k, key(2999 * 2).as_slice());
        let mut back = 1;
        while cursor.prev().unwrap().is_some() {
            back += 1;
        }
        assert_eq!(back, 3000);
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, key(0).as_slice());
    }

    #[test]
    fn test_seek_and_set() {
        let dir = TempDir::new().unwrap();
        let env = filled(&dir, 1000);
        let txn = env.begin_read().unwrap();
        let mut cursor = txn.cursor().unwrap();

        let (k, _) = cursor.seek(&key(101)).unwrap().unwrap();
        assert_eq!(k, key(102).as_slice());
        assert_eq!(cursor.set(&key(101)).unwrap(), None);
        let (k, _) = cursor.set(&key(500)).unwrap().unwrap();
        assert_eq!(k, key(500).as_slice());
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, key(502).as_slice());
        assert_eq!(cursor.seek(&key(5000)).unwrap(), None);

        let (k, _) = cursor.get(Some(key(0).as_slice()), CursorOp::SetRange).unwrap().unwrap();
        assert_eq!(k, key(0).as_slice());
        assert_eq!(cursor.get_current().unwrap().unwrap().0, key(0).as_slice());
        assert!(cursor.get(None, CursorOp::Set).is_err());
    }

    #[test]
    fn test_iter_sorted_and_sees_uncommitted_writes() {
        let dir = TempDir::new().unwrap();
        let env = filled(&dir, 100);
        let mut txn = env.begin_write().unwrap();
        txn.put(&key(1), b"new").unwrap();
        txn.put(b"big", &vec![3u8; 3 * PAGE_SIZE]).unwrap();
        assert!(txn.delete(&key(0)).unwrap());

        let keys: Vec<Vec<u8>> = txn
            .cursor()
            .unwrap()
            .iter()
            .map(|entry| entry.unwrap().0.to_vec())
            .collect();
        assert_eq!(keys.len(), 101);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys[0], key(1));

        let from: Vec<_> = txn.cursor().unwrap().iter_from(&key(190)).collect();
        assert_eq!(from.len(), 6);
    }
}
