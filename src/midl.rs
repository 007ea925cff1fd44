use crate::constants::Pgno;

/// ID List - a sorted set of page numbers in ascending order.
///
/// Used as the pool of reusable pages inside a write transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct IdList {
    ids: Vec<Pgno>,
}

impl IdList {
    pub(crate) fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Get number of elements in the list
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn contains(&self, id: Pgno) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Append a list of IDs
    pub(crate) fn extend<I: IntoIterator<Item = Pgno>>(&mut self, ids: I) {
        self.ids.extend(ids);
        self.ids.sort_unstable();
        self.ids.dedup();
    }

    /// Take the lowest ID
    pub(crate) fn pop_first(&mut self) -> Option<Pgno> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.ids.remove(0))
        }
    }

    /// Take a run of `n` consecutive IDs, returning the first one
    pub(crate) fn take_run(&mut self, n: usize) -> Option<Pgno> {
        if n == 0 || self.ids.len() < n {
            return None;
        }
        if n == 1 {
            return self.pop_first();
        }
        let start = (0..=self.ids.len() - n)
            .find(|&i| self.ids[i + n - 1] - self.ids[i] == (n - 1) as Pgno)?;
        let first = self.ids[start];
        self.ids.drain(start..start + n);
        Some(first)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Pgno> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<Pgno> for IdList {
    fn from_iter<I: IntoIterator<Item = Pgno>>(iter: I) -> Self {
        let mut list = IdList::new();
        list.extend(iter);
        list
    }
}
