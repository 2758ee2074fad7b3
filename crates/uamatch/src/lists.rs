//! Record lists over the reader pool
//!
//! Fixed lists index records by position (one record per constant stride);
//! variable lists key records by byte offset within their region, with a
//! companion index table translating logical index to offset when present.
//! Both read through the pool so any matcher thread can fetch records
//! concurrently, and both have cached variants wrapping the get path in a
//! two-generation cache.

use crate::cache::{CacheStats, TwoGenerationCache};
use crate::error::Result;
use crate::pool::ReaderPool;
use crate::source::Reader;
use std::marker::PhantomData;
use std::sync::Arc;
use uamatch_format::FormatError;

/// A record with a constant stride, readable from a positioned reader
pub(crate) trait FixedRecord: Sized {
    /// Stride between consecutive records
    const STRIDE: u64;

    /// Parse one record at the reader's cursor
    fn read(reader: &mut Reader) -> Result<Self>;
}

/// A record of varying size; `read` consumes exactly the record's bytes
pub(crate) trait VariableRecord: Sized {
    fn read(reader: &mut Reader) -> Result<Self>;
}

/// List of fixed-stride records; get-by-index is one seek and one read
pub(crate) struct FixedList<T> {
    region_offset: u64,
    count: u32,
    pool: Arc<ReaderPool>,
    _record: PhantomData<T>,
}

impl<T: FixedRecord> FixedList<T> {
    pub(crate) fn new(region_offset: u64, count: u32, pool: Arc<ReaderPool>) -> Self {
        Self {
            region_offset,
            count,
            pool,
            _record: PhantomData,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn get(&self, index: u32) -> Result<T> {
        if index >= self.count {
            return Err(FormatError::DanglingReference(format!(
                "record index {index} out of {}",
                self.count
            ))
            .into());
        }
        let mut reader = self.pool.acquire()?;
        reader.seek(self.region_offset + index as u64 * T::STRIDE);
        T::read(&mut reader)
    }
}

/// List of variable-size records keyed by region-relative byte offset
pub(crate) struct VariableList<T> {
    region_offset: u64,
    byte_len: u32,
    count: u32,
    /// Absolute offset of the logical-index -> byte-offset table
    index_offset: Option<u64>,
    pool: Arc<ReaderPool>,
    _record: PhantomData<T>,
}

impl<T: VariableRecord> VariableList<T> {
    pub(crate) fn new(
        region_offset: u64,
        byte_len: u32,
        count: u32,
        index_offset: Option<u64>,
        pool: Arc<ReaderPool>,
    ) -> Self {
        Self {
            region_offset,
            byte_len,
            count,
            index_offset,
            pool,
            _record: PhantomData,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// Read the record starting at a region-relative offset
    pub(crate) fn get_at(&self, offset: u32) -> Result<T> {
        if offset >= self.byte_len {
            return Err(FormatError::DanglingReference(format!(
                "record offset {offset} outside {}-byte region",
                self.byte_len
            ))
            .into());
        }
        let mut reader = self.pool.acquire()?;
        reader.seek(self.region_offset + offset as u64);
        T::read(&mut reader)
    }

    /// Translate a logical index to its byte offset via the index table
    pub(crate) fn offset_of(&self, index: u32) -> Result<u32> {
        let table = self.index_offset.ok_or_else(|| {
            FormatError::DanglingReference("list has no index table".to_string())
        })?;
        if index >= self.count {
            return Err(FormatError::DanglingReference(format!(
                "record index {index} out of {}",
                self.count
            ))
            .into());
        }
        let mut reader = self.pool.acquire()?;
        reader.seek(table + index as u64 * 4);
        Ok(reader.read_u32()?)
    }

    /// Enumerate every record in file order
    ///
    /// The callback receives each record's region-relative offset. Reading
    /// a record leaves the cursor at the next one, so enumeration is a
    /// single sequential pass.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u32, T) -> Result<()>) -> Result<()> {
        let mut reader = self.pool.acquire()?;
        let mut at = 0u64;
        let mut seen = 0u32;
        while at < self.byte_len as u64 && seen < self.count {
            reader.seek(self.region_offset + at);
            let record = T::read(&mut reader)?;
            let next = reader.position() - self.region_offset;
            f(at as u32, record)?;
            at = next;
            seen += 1;
        }
        Ok(())
    }
}

/// Fixed list with a two-generation cache over get-by-index
pub(crate) struct CachedFixedList<T> {
    list: FixedList<T>,
    cache: TwoGenerationCache<u32, T>,
}

impl<T: FixedRecord> CachedFixedList<T> {
    pub(crate) fn new(list: FixedList<T>, capacity: usize) -> Self {
        Self {
            list,
            cache: TwoGenerationCache::new(capacity),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.list.count()
    }

    pub(crate) fn get(&self, index: u32) -> Result<Arc<T>> {
        self.cache
            .get_or_try_insert_with(index, || self.list.get(index))
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Variable list with a two-generation cache keyed by byte offset
pub(crate) struct CachedVariableList<T> {
    list: VariableList<T>,
    cache: TwoGenerationCache<u32, T>,
}

impl<T: VariableRecord> CachedVariableList<T> {
    pub(crate) fn new(list: VariableList<T>, capacity: usize) -> Self {
        Self {
            list,
            cache: TwoGenerationCache::new(capacity),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.list.count()
    }

    pub(crate) fn get_at(&self, offset: u32) -> Result<Arc<T>> {
        self.cache
            .get_or_try_insert_with(offset, || self.list.get_at(offset))
    }

    pub(crate) fn get_by_index(&self, index: u32) -> Result<Arc<T>> {
        let offset = self.list.offset_of(index)?;
        self.get_at(offset)
    }

    pub(crate) fn for_each(&self, f: impl FnMut(u32, T) -> Result<()>) -> Result<()> {
        self.list.for_each(f)
    }

    pub(crate) fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn clear_cache(&self) {
        self.cache.clear();
    }
}
