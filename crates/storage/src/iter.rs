//! Lazy, batched, closeable iterators
//!
//! Long scans (history, keyspace modifications, commit scans, entry dumps)
//! never hold a shard lock across `next()` calls. They pull fixed-size
//! batches through a fetch closure that takes the read lock, copies one
//! batch out and remembers where to resume.
//!
//! Every scan handed to callers is a [`CloseableIter`]. Callers are expected
//! to call [`CloseableIter::close`]; dropping an open iterator is tolerated
//! but logged at debug level. Open cursors are counted by a shared
//! [`CursorTracker`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Number of items fetched per lock acquisition
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Counts cursors that have been opened but not yet released
#[derive(Debug, Default)]
pub struct CursorTracker {
    open: AtomicUsize,
}

impl CursorTracker {
    /// Create a tracker with no open cursors
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open cursors
    pub fn open_cursors(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    fn opened(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    fn released(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An iterator that must be closed explicitly
pub struct CloseableIter<T> {
    inner: Option<Box<dyn Iterator<Item = T> + Send>>,
    tracker: Option<Arc<CursorTracker>>,
    label: &'static str,
}

impl<T> CloseableIter<T> {
    /// Wrap an iterator, registering it with `tracker`
    pub fn new(
        inner: impl Iterator<Item = T> + Send + 'static,
        tracker: Option<Arc<CursorTracker>>,
        label: &'static str,
    ) -> Self {
        if let Some(tracker) = &tracker {
            tracker.opened();
        }
        CloseableIter {
            inner: Some(Box::new(inner)),
            tracker,
            label,
        }
    }

    /// An iterator over an already materialized vector
    pub fn from_vec(items: Vec<T>, tracker: Option<Arc<CursorTracker>>, label: &'static str) -> Self
    where
        T: Send + 'static,
    {
        Self::new(items.into_iter(), tracker, label)
    }

    /// Run every `next()` while holding the value `acquire` returns
    ///
    /// The engine uses this to take the database lock around each batch
    /// fetch without holding it between calls.
    pub fn gated<G, A>(mut self, acquire: A) -> Self
    where
        T: 'static,
        A: FnMut() -> G + Send + 'static,
    {
        if let Some(inner) = self.inner.take() {
            self.inner = Some(Box::new(Gated { inner, acquire }));
        }
        self
    }

    /// Release the cursor; further `next()` calls return `None`
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            if let Some(tracker) = &self.tracker {
                tracker.released();
            }
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Drain the remaining items and close
    pub fn collect_and_close(mut self) -> Vec<T> {
        let items: Vec<T> = self.by_ref().collect();
        self.close();
        items
    }
}

impl<T> Iterator for CloseableIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.inner.as_mut()?.next()
    }
}

impl<T> Drop for CloseableIter<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            debug!(target: "tempo::storage", cursor = self.label, "iterator dropped without close()");
            self.close();
        }
    }
}

impl<T> std::fmt::Debug for CloseableIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseableIter")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Gated<T, A> {
    inner: Box<dyn Iterator<Item = T> + Send>,
    acquire: A,
}

impl<T, G, A> Iterator for Gated<T, A>
where
    A: FnMut() -> G,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let _held = (self.acquire)();
        self.inner.next()
    }
}

/// Iterator pulling items through a batch fetch closure
///
/// The closure receives the batch size and returns the next batch. A batch
/// shorter than requested ends the iteration.
pub struct Batched<T, F> {
    fetch: F,
    buffer: VecDeque<T>,
    batch_size: usize,
    exhausted: bool,
}

impl<T, F> Batched<T, F>
where
    F: FnMut(usize) -> Vec<T>,
{
    /// Create a batched iterator
    pub fn new(batch_size: usize, fetch: F) -> Self {
        Batched {
            fetch,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            exhausted: false,
        }
    }
}

impl<T, F> Iterator for Batched<T, F>
where
    F: FnMut(usize) -> Vec<T>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            let batch = (self.fetch)(self.batch_size);
            if batch.len() < self.batch_size {
                self.exhausted = true;
            }
            self.buffer.extend(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batched_fetches_lazily() {
        let mut calls = 0;
        let mut position = 0u32;
        let iter = Batched::new(3, |size| {
            calls += 1;
            let batch: Vec<u32> = (position..(position + size as u32).min(7)).collect();
            position += batch.len() as u32;
            batch
        });
        let items: Vec<u32> = iter.collect();
        assert_eq!(items, (0..7).collect::<Vec<_>>());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_close_releases_cursor() {
        let tracker = Arc::new(CursorTracker::new());
        let mut iter = CloseableIter::from_vec(vec![1, 2, 3], Some(Arc::clone(&tracker)), "test");
        assert_eq!(tracker.open_cursors(), 1);
        assert_eq!(iter.next(), Some(1));
        iter.close();
        assert_eq!(tracker.open_cursors(), 0);
        assert_eq!(iter.next(), None);
        iter.close();
        assert_eq!(tracker.open_cursors(), 0);
    }

    #[test]
    fn test_drop_without_close_releases_cursor() {
        let tracker = Arc::new(CursorTracker::new());
        {
            let _iter = CloseableIter::from_vec(vec![1], Some(Arc::clone(&tracker)), "test");
            assert_eq!(tracker.open_cursors(), 1);
        }
        assert_eq!(tracker.open_cursors(), 0);
    }

    #[test]
    fn test_gated_holds_guard_per_item() {
        use std::sync::atomic::AtomicUsize;

        struct Held(Arc<AtomicUsize>);
        impl Drop for Held {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let tracker = Arc::new(CursorTracker::new());
        let holds = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));
        let (h, a) = (Arc::clone(&holds), Arc::clone(&acquired));
        let mut iter = CloseableIter::from_vec(vec![1, 2], Some(Arc::clone(&tracker)), "test").gated(move || {
            h.fetch_add(1, Ordering::AcqRel);
            a.fetch_add(1, Ordering::AcqRel);
            Held(Arc::clone(&h))
        });
        assert_eq!(tracker.open_cursors(), 1);
        assert_eq!(iter.next(), Some(1));
        assert_eq!(holds.load(Ordering::Acquire), 0);
        assert_eq!(iter.collect_and_close(), vec![2]);
        assert_eq!(acquired.load(Ordering::Acquire), 3);
        assert_eq!(tracker.open_cursors(), 0);
    }

    #[test]
    fn test_collect_and_close() {
        let tracker = Arc::new(CursorTracker::new());
        let iter = CloseableIter::from_vec(vec!["a", "b"], Some(Arc::clone(&tracker)), "test");
        assert_eq!(iter.collect_and_close(), vec!["a", "b"]);
        assert_eq!(tracker.open_cursors(), 0);
    }
}
