//! SCSI command layer: status codes, CDB decoding, sense data and the block
//! device abstraction tasks execute against.

pub mod cdb;
pub mod commands;
pub mod response_data;
pub mod sense;

pub use cdb::{Cdb, CdbOpcode};
pub use response_data::ScsiResponseDataSegment;
pub use sense::{SenseData, SenseKey};

use std::sync::RwLock;

use crate::error::{IscsiError, Result};

/// SCSI status codes (SAM-2)
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// A block-addressable backing store for one logical unit.
///
/// Implementations must be safe to call from several task threads at once;
/// overlapping-range coherence is the initiator's problem, as it is for a
/// real disk.
pub trait BlockDevice: Send + Sync {
    /// Block size in bytes. Constant for the device's lifetime.
    fn block_size(&self) -> u32;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Reads `count` blocks starting at `lba`.
    fn read_blocks(&self, lba: u64, count: u32) -> Result<Vec<u8>>;

    /// Writes whole blocks starting at `lba`; `data` length is a multiple of
    /// the block size.
    fn write_blocks(&self, lba: u64, data: &[u8]) -> Result<()>;

    /// Flushes any volatile write cache. Default is a no-op.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory [`BlockDevice`], used by tests and loopback tooling.
pub struct MemoryBlockDevice {
    block_size: u32,
    data: RwLock<Vec<u8>>,
}

impl MemoryBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        MemoryBlockDevice {
            block_size,
            data: RwLock::new(vec![0u8; (block_size as u64 * block_count) as usize]),
        }
    }

    fn range(&self, lba: u64, byte_len: usize) -> Result<std::ops::Range<usize>> {
        let start = lba
            .checked_mul(self.block_size as u64)
            .ok_or_else(|| IscsiError::violation("LBA overflow"))? as usize;
        let end = start + byte_len;
        if end > self.data.read().unwrap().len() {
            return Err(IscsiError::violation(format!(
                "read/write beyond device end: lba {}, {} bytes",
                lba, byte_len
            )));
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.data.read().unwrap().len() as u64 / self.block_size as u64
    }

    fn read_blocks(&self, lba: u64, count: u32) -> Result<Vec<u8>> {
        let range = self.range(lba, (count * self.block_size) as usize)?;
        Ok(self.data.read().unwrap()[range].to_vec())
    }

    fn write_blocks(&self, lba: u64, data: &[u8]) -> Result<()> {
        let range = self.range(lba, data.len())?;
        self.data.write().unwrap()[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_roundtrip() {
        let device = MemoryBlockDevice::new(512, 16);
        assert_eq!(device.block_count(), 16);

        let block = vec![0xA5u8; 512];
        device.write_blocks(3, &block).unwrap();
        assert_eq!(device.read_blocks(3, 1).unwrap(), block);
        assert_eq!(device.read_blocks(4, 1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_memory_device_bounds() {
        let device = MemoryBlockDevice::new(512, 4);
        assert!(device.read_blocks(4, 1).is_err());
        assert!(device.write_blocks(3, &vec![0u8; 1024]).is_err());
    }
}
