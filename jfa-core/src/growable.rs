//! Amortized-doubling byte buffers for device-resident records.
//!
//! A [`GrowableBuffer`] owns one allocation from a [`DeviceAllocator`]. When
//! an append would overflow it, a larger allocation is made, the written
//! bytes are copied across and the old allocation is freed. The region in
//! front of `base_capacity` is a fixed prefix that never takes part in the
//! doubling, so capacity grows as `2 * capacity - base_capacity`.

use std::marker::PhantomData;

use bytemuck::Pod;
use log::debug;

use crate::{JfaError, Result};

/// Allocation and copy primitives of some device memory.
pub trait DeviceAllocator {
    type Buffer;

    fn allocate(&mut self, size: u64) -> Result<Self::Buffer>;

    /// Copy the first `len` bytes of `src` to the start of `dst`
    fn copy(&mut self, src: &Self::Buffer, dst: &mut Self::Buffer, len: u64) -> Result<()>;

    fn write(&mut self, dst: &mut Self::Buffer, offset: u64, bytes: &[u8]) -> Result<()>;

    fn read(&mut self, src: &Self::Buffer, offset: u64, len: u64) -> Result<Vec<u8>>;

    fn free(&mut self, buffer: Self::Buffer) {
        drop(buffer);
    }
}

/// Host memory allocator, optionally capped to emulate a device budget.
#[derive(Debug, Default, Clone)]
pub struct HostAllocator {
    limit: Option<u64>,
    /// Total bytes moved by growth copies
    pub bytes_copied: u64,
    pub allocations: u32,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl DeviceAllocator for HostAllocator {
    type Buffer = Vec<u8>;

    fn allocate(&mut self, size: u64) -> Result<Vec<u8>> {
        let exhausted = JfaError::ResourceExhaustion { requested: size };
        if self.limit.is_some_and(|limit| size > limit) {
            return Err(exhausted);
        }
        let len = usize::try_from(size).map_err(|_| JfaError::ResourceExhaustion { requested: size })?;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).map_err(|_| exhausted)?;
        buffer.resize(len, 0);
        self.allocations += 1;
        Ok(buffer)
    }

    fn copy(&mut self, src: &Vec<u8>, dst: &mut Vec<u8>, len: u64) -> Result<()> {
        let len = len as usize;
        if len > src.len() || len > dst.len() {
            return Err(JfaError::InvalidInput(format!(
                "copy of {} bytes exceeds buffers of {} and {} bytes",
                len,
                src.len(),
                dst.len(),
            )));
        }
        dst[..len].copy_from_slice(&src[..len]);
        self.bytes_copied += len as u64;
        Ok(())
    }

    fn write(&mut self, dst: &mut Vec<u8>, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > dst.len() {
            return Err(JfaError::InvalidInput(format!(
                "write of {} bytes at {} exceeds buffer of {} bytes",
                bytes.len(),
                offset,
                dst.len(),
            )));
        }
        dst[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, src: &Vec<u8>, offset: u64, len: u64) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + len as usize;
        src.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            JfaError::InvalidInput(format!(
                "read of {} bytes at {} exceeds buffer of {} bytes",
                len,
                offset,
                src.len(),
            ))
        })
    }
}

/// Append-mostly byte buffer with content-preserving doubling growth.
///
/// Invariant: `base_capacity <= write_offset <= capacity`.
pub struct GrowableBuffer<A: DeviceAllocator> {
    allocator: A,
    buffer: A::Buffer,
    base_capacity: u64,
    capacity: u64,
    write_offset: u64,
    growth_count: u32,
}

impl<A: DeviceAllocator> GrowableBuffer<A> {
    /// Buffer without a fixed prefix
    pub fn new(allocator: A, capacity: u64) -> Result<Self> {
        Self::with_prefix(allocator, &[], capacity)
    }

    /// Buffer whose first `prefix.len()` bytes are static (e.g. shared vertex
    /// data in front of per-instance attributes). `record_capacity` is the
    /// initial room for appended bytes and must be non-zero.
    pub fn with_prefix(mut allocator: A, prefix: &[u8], record_capacity: u64) -> Result<Self> {
        if record_capacity == 0 {
            return Err(JfaError::InvalidInput(
                "growable buffer needs a non-zero initial record capacity".into(),
            ));
        }
        let base_capacity = prefix.len() as u64;
        let capacity = base_capacity
            .checked_add(record_capacity)
            .ok_or(JfaError::ResourceExhaustion { requested: u64::MAX })?;
        let mut buffer = allocator.allocate(capacity)?;
        if !prefix.is_empty() {
            allocator.write(&mut buffer, 0, prefix)?;
        }
        Ok(Self {
            allocator,
            buffer,
            base_capacity,
            capacity,
            write_offset: base_capacity,
            growth_count: 0,
        })
    }

    pub fn base_capacity(&self) -> u64 {
        self.base_capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Bytes written after the prefix
    pub fn content_len(&self) -> u64 {
        self.write_offset - self.base_capacity
    }

    /// Number of reallocations so far
    pub fn growth_count(&self) -> u32 {
        self.growth_count
    }

    pub fn buffer(&self) -> &A::Buffer {
        &self.buffer
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Grow until `write_offset + additional` bytes fit.
    pub fn ensure_capacity(&mut self, additional: u64) -> Result<()> {
        let needed = self
            .write_offset
            .checked_add(additional)
            .ok_or(JfaError::ResourceExhaustion { requested: u64::MAX })?;
        if needed <= self.capacity {
            return Ok(());
        }

        let mut new_capacity = self.capacity;
        while needed > new_capacity {
            new_capacity = new_capacity
                .checked_mul(2)
                .map(|doubled| doubled - self.base_capacity)
                .ok_or(JfaError::ResourceExhaustion { requested: u64::MAX })?;
        }

        let mut grown = self.allocator.allocate(new_capacity)?;
        self.allocator.copy(&self.buffer, &mut grown, self.write_offset)?;
        let old = std::mem::replace(&mut self.buffer, grown);
        self.allocator.free(old);

        debug!(
            "growable buffer: {} -> {} bytes ({} in use)",
            self.capacity, new_capacity, self.write_offset
        );
        self.capacity = new_capacity;
        self.growth_count += 1;
        Ok(())
    }

    /// Append bytes at `write_offset`, returning the offset they landed at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let len = bytes.len() as u64;
        self.ensure_capacity(len)?;
        let offset = self.write_offset;
        self.allocator.write(&mut self.buffer, offset, bytes)?;
        self.write_offset += len;
        Ok(offset)
    }

    /// Overwrite bytes that were already appended.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len() as u64);
        if offset < self.base_capacity || end.map_or(true, |end| end > self.write_offset) {
            return Err(JfaError::InvalidInput(format!(
                "write of {} bytes at {} is outside the written region [{}, {})",
                bytes.len(),
                offset,
                self.base_capacity,
                self.write_offset,
            )));
        }
        self.allocator.write(&mut self.buffer, offset, bytes)
    }

    /// Drop the most recently appended record of `record_size` bytes.
    ///
    /// Records must be released in LIFO order; the buffer only tracks the
    /// write offset, so releasing an older record would silently drop the
    /// newest one instead. [`RecordBuffer`] checks the order for you.
    pub fn release(&mut self, record_size: u64) -> Result<()> {
        if record_size > self.content_len() {
            return Err(JfaError::InvalidInput(format!(
                "cannot release {} bytes, only {} appended",
                record_size,
                self.content_len(),
            )));
        }
        self.write_offset -= record_size;
        Ok(())
    }

    /// Move `write_offset` back to `offset`; capacity is kept.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        if offset < self.base_capacity || offset > self.write_offset {
            return Err(JfaError::InvalidInput(format!(
                "truncate to {} outside [{}, {}]",
                offset, self.base_capacity, self.write_offset,
            )));
        }
        self.write_offset = offset;
        Ok(())
    }

    /// Copy the written region (prefix included) back to the host.
    pub fn read_back(&mut self) -> Result<Vec<u8>> {
        self.allocator.read(&self.buffer, 0, self.write_offset)
    }
}

/// Proof that a record was pushed; hand it back to release the record.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordHandle {
    offset: u64,
}

impl RecordHandle {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Fixed-size `Pod` records streamed into a [`GrowableBuffer`].
pub struct RecordBuffer<T, A: DeviceAllocator> {
    inner: GrowableBuffer<A>,
    _record: PhantomData<T>,
}

impl<T: Pod, A: DeviceAllocator> RecordBuffer<T, A> {
    const RECORD_SIZE: u64 = std::mem::size_of::<T>() as u64;

    pub fn new(allocator: A, initial_records: u64) -> Result<Self> {
        Self::with_prefix(allocator, &[], initial_records)
    }

    pub fn with_prefix(allocator: A, prefix: &[u8], initial_records: u64) -> Result<Self> {
        let record_capacity = initial_records
            .max(1)
            .checked_mul(Self::RECORD_SIZE)
            .ok_or(JfaError::ResourceExhaustion { requested: u64::MAX })?;
        Ok(Self {
            inner: GrowableBuffer::with_prefix(allocator, prefix, record_capacity)?,
            _record: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        (self.inner.content_len() / Self::RECORD_SIZE) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &GrowableBuffer<A> {
        &self.inner
    }

    pub fn push(&mut self, record: &T) -> Result<RecordHandle> {
        let offset = self.inner.append(bytemuck::bytes_of(record))?;
        Ok(RecordHandle { offset })
    }

    /// Overwrite record `index` in place.
    pub fn set(&mut self, index: usize, record: &T) -> Result<()> {
        let offset = self.offset_of(index);
        self.inner.write_at(offset, bytemuck::bytes_of(record))
    }

    /// Write a run of records starting at `index`, appending past the end.
    pub fn write_from(&mut self, index: usize, records: &[T]) -> Result<()> {
        if index > self.len() {
            return Err(JfaError::InvalidInput(format!(
                "write at record {} leaves a gap after {} records",
                index,
                self.len(),
            )));
        }
        let overlap = (self.len() - index).min(records.len());
        let (in_place, appended) = records.split_at(overlap);
        if !in_place.is_empty() {
            self.inner
                .write_at(self.offset_of(index), bytemuck::cast_slice(in_place))?;
        }
        if !appended.is_empty() {
            self.inner.append(bytemuck::cast_slice(appended))?;
        }
        Ok(())
    }

    /// Release the most recently pushed record.
    pub fn release(&mut self, handle: RecordHandle) -> Result<()> {
        let expected = self.inner.write_offset().saturating_sub(Self::RECORD_SIZE);
        if self.is_empty() || handle.offset != expected {
            return Err(JfaError::OutOfOrderRelease {
                expected,
                got: handle.offset,
            });
        }
        self.inner.release(Self::RECORD_SIZE)
    }

    /// Keep the first `len` records.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        if len > self.len() {
            return Ok(());
        }
        self.inner.truncate(self.offset_of(len))
    }

    pub fn records(&mut self) -> Result<Vec<T>> {
        let bytes = self.inner.read_back()?;
        let records = &bytes[self.inner.base_capacity() as usize..];
        Ok(records
            .chunks_exact(Self::RECORD_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn offset_of(&self, index: usize) -> u64 {
        self.inner.base_capacity() + index as u64 * Self::RECORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_preserves_content() {
        let record_size = 12u64;
        let mut buffer = GrowableBuffer::new(HostAllocator::new(), 16).unwrap();
        let mut expected = Vec::new();

        for i in 0..200u8 {
            let record = [i; 12];
            let before = buffer.growth_count();
            buffer.append(&record).unwrap();
            expected.extend_from_slice(&record);
            if buffer.growth_count() != before {
                // every growth event keeps everything written so far
                assert_eq!(buffer.read_back().unwrap(), expected);
            }
        }

        assert_eq!(buffer.write_offset(), 200 * record_size);
        assert!(buffer.growth_count() >= 3);
        assert_eq!(buffer.read_back().unwrap(), expected);
    }

    #[test]
    fn test_doubling_relative_to_base() {
        let prefix = [7u8; 100];
        let mut buffer = GrowableBuffer::with_prefix(HostAllocator::new(), &prefix, 20).unwrap();
        assert_eq!(buffer.capacity(), 120);
        assert_eq!(buffer.write_offset(), 100);

        buffer.append(&[1u8; 21]).unwrap();
        // 2 * 120 - 100
        assert_eq!(buffer.capacity(), 140);

        buffer.append(&[2u8; 80]).unwrap();
        // 140 -> 180 -> 260
        assert_eq!(buffer.capacity(), 260);

        let bytes = buffer.read_back().unwrap();
        assert_eq!(&bytes[..100], &prefix[..]);
        assert_eq!(&bytes[100..121], &[1u8; 21][..]);
    }

    #[test]
    fn test_amortized_copy_cost() {
        let mut buffer = GrowableBuffer::new(HostAllocator::new(), 8).unwrap();
        let n = 10_000u64;
        for _ in 0..n {
            buffer.append(&[0u8; 8]).unwrap();
        }
        // geometric growth: total copy work stays linear in the content
        assert!(buffer.allocator().bytes_copied < 2 * n * 8);
        assert_eq!(buffer.write_offset(), n * 8);
    }

    #[test]
    fn test_release_underflow() {
        let mut buffer = GrowableBuffer::with_prefix(HostAllocator::new(), &[0u8; 4], 8).unwrap();
        buffer.append(&[1u8; 8]).unwrap();
        buffer.release(8).unwrap();
        assert_eq!(buffer.write_offset(), 4);
        assert!(buffer.release(8).is_err());
    }

    #[test]
    fn test_allocation_failure_reported() {
        let mut buffer = GrowableBuffer::new(HostAllocator::with_limit(64), 32).unwrap();
        buffer.append(&[0u8; 60]).unwrap();
        let err = buffer.append(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, JfaError::ResourceExhaustion { requested: 128 }));
        // failed growth leaves the buffer untouched
        assert_eq!(buffer.write_offset(), 60);
        assert_eq!(buffer.capacity(), 64);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(GrowableBuffer::new(HostAllocator::new(), 0).is_err());
    }

    #[test]
    fn test_record_release_order() {
        let mut records: RecordBuffer<[f32; 4], _> = RecordBuffer::new(HostAllocator::new(), 1).unwrap();
        let first = records.push(&[1.0; 4]).unwrap();
        let second = records.push(&[2.0; 4]).unwrap();
        assert_eq!(records.len(), 2);

        let err = records.release(first).unwrap_err();
        assert!(matches!(err, JfaError::OutOfOrderRelease { expected: 16, got: 0 }));
        assert_eq!(records.len(), 2);

        records.release(second).unwrap();
        assert_eq!(records.records().unwrap(), vec![[1.0; 4]]);
    }

    #[test]
    fn test_write_from_overlaps_and_appends() {
        let mut records: RecordBuffer<u32, _> = RecordBuffer::new(HostAllocator::new(), 2).unwrap();
        records.write_from(0, &[1, 2, 3]).unwrap();
        records.write_from(2, &[30, 40, 50]).unwrap();
        assert_eq!(records.records().unwrap(), vec![1, 2, 30, 40, 50]);
        assert!(records.write_from(7, &[0]).is_err());

        records.truncate(2).unwrap();
        assert_eq!(records.records().unwrap(), vec![1, 2]);
    }
}
