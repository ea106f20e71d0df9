//! Round-robin collection of live values.
//!
//! The server keeps its accepted connections here so it can tear all of them
//! down on close.

/// Mutable round-robin pool.
///
/// `next()` walks the entries in insertion order and wraps around;
/// removing an entry at or before the cursor keeps the walk stable.
#[derive(Debug)]
pub struct RingPool<T> {
    pool: Vec<T>,
    /// Index of the entry last returned by `next()`, `None` before the first call.
    pos: Option<usize>,
}

impl<T> RingPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            pool: Vec::new(),
            pos: None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// True if the pool holds nothing.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Append an entry, returning the new length.
    pub fn add(&mut self, value: T) -> usize {
        self.pool.push(value);
        self.pool.len()
    }

    /// Advance the cursor and return the entry under it.
    pub fn next(&mut self) -> Option<&T> {
        if self.pool.is_empty() {
            self.pos = None;
            return None;
        }
        let pos = match self.pos {
            Some(p) if p + 1 < self.pool.len() => p + 1,
            _ => 0,
        };
        self.pos = Some(pos);
        self.pool.get(pos)
    }

    /// Remove the first entry matching `pred`, returning the new length.
    pub fn remove_by(&mut self, pred: impl Fn(&T) -> bool) -> usize {
        if let Some(index) = self.pool.iter().position(pred) {
            self.pool.remove(index);
            self.pos = match self.pos {
                Some(p) if index <= p => p.checked_sub(1),
                other => other,
            };
        }
        self.pool.len()
    }

    /// Drop every entry and rewind the cursor.
    pub fn reset(&mut self) {
        self.pool.clear();
        self.pos = None;
    }

    /// Take every entry out, leaving the pool empty.
    pub fn drain(&mut self) -> Vec<T> {
        self.pos = None;
        std::mem::take(&mut self.pool)
    }

    /// Iterate entries in insertion order without moving the cursor.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.pool.iter()
    }
}

impl<T: PartialEq> RingPool<T> {
    /// Remove `value` if present, returning the new length.
    pub fn remove(&mut self, value: &T) -> usize {
        self.remove_by(|v| v == value)
    }
}

impl<T> Default for RingPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> IntoIterator for &'a RingPool<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wraps_around() {
        let mut pool = RingPool::new();
        assert_eq!(pool.next(), None);

        assert_eq!(pool.add(1), 1);
        assert_eq!(pool.add(2), 2);
        assert_eq!(pool.add(3), 3);

        let seen: Vec<i32> = (0..5).filter_map(|_| pool.next().copied()).collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_remove_before_cursor_keeps_order() {
        let mut pool = RingPool::new();
        for v in [1, 2, 3, 4] {
            pool.add(v);
        }
        assert_eq!(pool.next(), Some(&1));
        assert_eq!(pool.next(), Some(&2));

        assert_eq!(pool.remove(&1), 3);
        assert_eq!(pool.next(), Some(&3));

        // Removing the current entry hands its successor out next.
        assert_eq!(pool.remove(&3), 2);
        assert_eq!(pool.next(), Some(&4));
        assert_eq!(pool.next(), Some(&2));
    }

    #[test]
    fn test_remove_missing_and_first() {
        let mut pool = RingPool::new();
        pool.add("a");
        pool.add("b");
        assert_eq!(pool.remove(&"zzz"), 2);

        assert_eq!(pool.next(), Some(&"a"));
        assert_eq!(pool.remove(&"a"), 1);
        assert_eq!(pool.next(), Some(&"b"));
    }

    #[test]
    fn test_reset_and_drain() {
        let mut pool = RingPool::new();
        pool.add(1);
        pool.add(2);
        pool.next();

        let all: Vec<_> = pool.iter().copied().collect();
        assert_eq!(all, vec![1, 2]);

        assert_eq!(pool.drain(), vec![1, 2]);
        assert!(pool.is_empty());

        pool.add(7);
        pool.reset();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.next(), None);
    }
}
