//! USB Mass Storage transports

use crate::storage::BLOCK_SIZE;

pub mod bbb;
pub mod dma;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

/// Transfer cancellation reason
///
/// A cancelled transfer leaves the data phase incomplete, the transport has to be reset
/// before the next command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// Physical link lost while waiting
    Detached,
    /// The session ended (bus reset) while waiting
    SessionEnded,
}

/// Invalid transport configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The staging buffer cannot fit a single block
    BufferTooSmall,
    /// Packet size is not allowed for the bus speed
    InvalidPacketSize,
    /// DMA length is zero or not a multiple of both packet sizes
    InvalidDmaLength,
    /// Endpoint number outside 1..=15
    InvalidEndpoint,
}

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Transport configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Bulk-IN endpoint number
    pub bulk_in_ep: u8,
    /// Bulk-OUT endpoint number
    pub bulk_out_ep: u8,
    pub high_speed_packet_size: u16,
    pub full_speed_packet_size: u16,
    /// Largest length the DMA channel accepts in one go
    pub max_dma_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bulk_in_ep: 1,
            bulk_out_ep: 2,
            high_speed_packet_size: 512,
            full_speed_packet_size: 64,
            max_dma_len: 0x1000,
        }
    }
}

impl Config {
    pub fn packet_size(&self, high_speed: bool) -> u16 {
        if high_speed {
            self.high_speed_packet_size
        } else {
            self.full_speed_packet_size
        }
    }

    /// Checks the configuration against a staging buffer of `buf_len` bytes
    pub fn validate(&self, buf_len: usize) -> Result<(), ConfigError> {
        if !(1..=15).contains(&self.bulk_in_ep) || !(1..=15).contains(&self.bulk_out_ep) {
            return Err(ConfigError::InvalidEndpoint);
        }
        if !matches!(self.full_speed_packet_size, 8 | 16 | 32 | 64)
            || !self.high_speed_packet_size.is_power_of_two()
            || !(8..=512).contains(&self.high_speed_packet_size)
        {
            return Err(ConfigError::InvalidPacketSize);
        }
        let hs = self.high_speed_packet_size as usize;
        let fs = self.full_speed_packet_size as usize;
        if self.max_dma_len == 0 || self.max_dma_len % hs != 0 || self.max_dma_len % fs != 0 {
            return Err(ConfigError::InvalidDmaLength);
        }
        if buf_len < BLOCK_SIZE {
            return Err(ConfigError::BufferTooSmall);
        }
        Ok(())
    }
}
