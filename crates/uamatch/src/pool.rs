//! Reader pool
//!
//! Lends exclusive [`Reader`]s over a shared [`Source`] to matcher threads
//! and recycles them on release. Creation is elastic by default: a reader
//! is built whenever the queue is empty. With a hard cap configured the
//! pool refuses to grow past it and `acquire` fails with `PoolExhausted`.

use crate::error::{Result, UamatchError};
use crate::source::{Reader, Source};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Pool of readers over one source
pub struct ReaderPool {
    source: Arc<Source>,
    queue: Mutex<Vec<Reader>>,
    /// Total readers ever created; introspection counter
    readers_created: AtomicU64,
    /// Readers currently alive (queued or lent out)
    live: AtomicUsize,
    max_readers: Option<usize>,
}

impl ReaderPool {
    /// Create a pool; `max_readers` of `None` grows elastically
    pub fn new(source: Arc<Source>, max_readers: Option<usize>) -> Self {
        Self {
            source,
            queue: Mutex::new(Vec::new()),
            readers_created: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            max_readers,
        }
    }

    /// Borrow a reader, creating one if none is queued
    ///
    /// The returned guard releases the reader back to the queue on drop.
    pub fn acquire(&self) -> Result<PooledReader<'_>> {
        let queued = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let reader = match queued {
            Some(reader) => reader,
            None => {
                // Reserve the slot atomically so two racing threads cannot
                // both observe cap - 1 and grow the pool past the cap.
                if let Some(cap) = self.max_readers {
                    if self
                        .live
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                            (live < cap).then_some(live + 1)
                        })
                        .is_err()
                    {
                        return Err(UamatchError::PoolExhausted { cap });
                    }
                } else {
                    self.live.fetch_add(1, Ordering::AcqRel);
                }
                match self.source.new_reader() {
                    Ok(reader) => {
                        self.readers_created.fetch_add(1, Ordering::Relaxed);
                        reader
                    }
                    Err(error) => {
                        self.live.fetch_sub(1, Ordering::AcqRel);
                        return Err(error);
                    }
                }
            }
        };
        Ok(PooledReader {
            pool: self,
            reader: Some(reader),
        })
    }

    fn release(&self, reader: Reader) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reader);
    }

    /// Total readers created over the pool's lifetime
    pub fn readers_created(&self) -> u64 {
        self.readers_created.load(Ordering::Relaxed)
    }

    /// Readers currently queued for reuse
    pub fn readers_queued(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close every queued reader; part of dataset teardown
    pub fn drain(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        self.live.fetch_sub(queue.len(), Ordering::AcqRel);
        queue.clear();
    }
}

/// Exclusive reader borrowed from a [`ReaderPool`]
pub struct PooledReader<'p> {
    pool: &'p ReaderPool,
    reader: Option<Reader>,
}

impl Deref for PooledReader<'_> {
    type Target = Reader;

    fn deref(&self) -> &Reader {
        self.reader.as_ref().expect("reader present until drop")
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut Reader {
        self.reader.as_mut().expect("reader present until drop")
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.release(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: Option<usize>) -> ReaderPool {
        let source = Arc::new(Source::from_bytes(vec![0u8; 64]));
        ReaderPool::new(source, max)
    }

    #[test]
    fn recycles_released_readers() {
        let pool = pool(None);
        {
            let _one = pool.acquire().unwrap();
            let _two = pool.acquire().unwrap();
        }
        assert_eq!(pool.readers_created(), 2);
        assert_eq!(pool.readers_queued(), 2);

        let _again = pool.acquire().unwrap();
        assert_eq!(pool.readers_created(), 2, "queued reader reused");
        assert_eq!(pool.readers_queued(), 1);
    }

    #[test]
    fn hard_cap_fails_with_pool_exhausted() {
        let pool = pool(Some(2));
        let one = pool.acquire().unwrap();
        let _two = pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(UamatchError::PoolExhausted { cap: 2 })
        ));
        drop(one);
        assert!(pool.acquire().is_ok(), "released reader is reusable");
    }

    #[test]
    fn hard_cap_holds_under_contention() {
        use std::sync::atomic::AtomicU64;

        let pool = Arc::new(ReaderPool::new(
            Arc::new(Source::from_bytes(vec![0u8; 64])),
            Some(2),
        ));
        let exhausted = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let exhausted = Arc::clone(&exhausted);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        match pool.acquire() {
                            Ok(reader) => drop(reader),
                            Err(UamatchError::PoolExhausted { cap }) => {
                                assert_eq!(cap, 2);
                                exhausted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Racing acquires may be refused, but the pool never grows past
        // its cap.
        assert!(pool.readers_created() <= 2);
        assert!(pool.readers_queued() <= 2);
    }

    #[test]
    fn drain_closes_queued_readers() {
        let pool = pool(None);
        {
            let _one = pool.acquire().unwrap();
        }
        assert_eq!(pool.readers_queued(), 1);
        pool.drain();
        assert_eq!(pool.readers_queued(), 0);
    }
}
