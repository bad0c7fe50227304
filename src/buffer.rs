use core::borrow::BorrowMut;
use core::ops::Range;

/// Byte-addressable staging region
///
/// Every accessor is bounds-checked against the underlying storage. Out-of-bounds
/// writes are truncated and reported through the returned count, reads return `None`.
pub struct Buffer<T: BorrowMut<[u8]>> {
    inner: T,
}

impl<T: BorrowMut<[u8]>> Buffer<T> {
    pub fn new(inner: T) -> Buffer<T> {
        Buffer { inner }
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().len()
    }

    /// Copies `data` at `offset` returning number of bytes actually written
    pub fn put(&mut self, offset: usize, data: &[u8]) -> usize {
        let inner = self.inner.borrow_mut();
        if offset >= inner.len() {
            return 0;
        }
        let count = data.len().min(inner.len() - offset);
        inner[offset..offset + count].copy_from_slice(&data[..count]);
        count
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> usize {
        self.put(offset, &[value])
    }

    pub fn put_be32(&mut self, offset: usize, value: u32) -> usize {
        self.put(offset, value.to_be_bytes().as_slice())
    }

    /// Fills `range` with `value`, clamping it to the capacity
    pub fn fill(&mut self, range: Range<usize>, value: u8) {
        let inner = self.inner.borrow_mut();
        let end = range.end.min(inner.len());
        if range.start < end {
            inner[range.start..end].fill(value);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.inner.borrow()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.inner.borrow_mut()
    }

    pub fn slice(&self, range: Range<usize>) -> Option<&[u8]> {
        self.inner.borrow().get(range)
    }

    pub fn slice_mut(&mut self, range: Range<usize>) -> Option<&mut [u8]> {
        self.inner.borrow_mut().get_mut(range)
    }
}
