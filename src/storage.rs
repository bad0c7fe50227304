//! Backing store

use core::borrow::BorrowMut;

/// Logical block size in bytes
pub const BLOCK_SIZE: usize = 512;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockDeviceError {
    /// Addressed past the last block
    OutOfRange,
    /// Buffer length is not a multiple of [BLOCK_SIZE]
    Misaligned,
    /// Media failure
    Io,
}

/// Fixed-capacity block range addressed by LBA
///
/// Buffers passed to [read_blocks] and [write_blocks] always span whole blocks.
///
/// [read_blocks]: BlockDevice::read_blocks
/// [write_blocks]: BlockDevice::write_blocks
pub trait BlockDevice {
    /// Total number of blocks
    fn block_count(&self) -> u32;

    fn read_blocks(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockDeviceError>;

    fn write_blocks(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockDeviceError>;
}

/// RAM-backed block device
pub struct RamDisk<T: BorrowMut<[u8]>> {
    inner: T,
}

impl<T: BorrowMut<[u8]>> RamDisk<T> {
    /// Any trailing partial block of `inner` is not addressable
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.borrow()
    }

    fn range(&self, lba: u32, len: usize) -> Result<core::ops::Range<usize>, BlockDeviceError> {
        if len % BLOCK_SIZE != 0 {
            return Err(BlockDeviceError::Misaligned);
        }
        // a 32 bit LBA times the block size does not fit a 32 bit usize
        let start = (lba as usize)
            .checked_mul(BLOCK_SIZE)
            .ok_or(BlockDeviceError::OutOfRange)?;
        let end = start
            .checked_add(len)
            .ok_or(BlockDeviceError::OutOfRange)?;
        if end > self.block_count() as usize * BLOCK_SIZE {
            return Err(BlockDeviceError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl<T: BorrowMut<[u8]>> BlockDevice for RamDisk<T> {
    fn block_count(&self) -> u32 {
        (self.inner.borrow().len() / BLOCK_SIZE) as u32
    }

    fn read_blocks(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(lba, dst.len())?;
        dst.copy_from_slice(&self.inner.borrow()[range]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockDeviceError> {
        let range = self.range(lba, src.len())?;
        self.inner.borrow_mut()[range].copy_from_slice(src);
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn block_count(&self) -> u32 {
        (**self).block_count()
    }

    fn read_blocks(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockDeviceError> {
        (**self).read_blocks(lba, dst)
    }

    fn write_blocks(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockDeviceError> {
        (**self).write_blocks(lba, src)
    }
}
