//! Command Descriptor Block decoding (SBC-2 / SPC-3)
//!
//! The second dispatch layer: once a SCSI Command PDU is accepted, the CDB's
//! own operation code selects the task to run. Decoding failures are SCSI
//! errors, not protocol errors: an unknown operation code or a bad field
//! yields sense data for a CHECK CONDITION response, and the connection
//! stays healthy.

use byteorder::{BigEndian, ByteOrder};

use crate::scsi::sense::SenseData;

/// SCSI operation codes understood by this target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CdbOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    Read6 = 0x08,
    Write6 = 0x0A,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    SendDiagnostic = 0x1D,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ReportLuns = 0xA0,
}

/// A decoded CDB. The 6- and 10-byte read/write forms collapse into shared
/// variants once LBA and length are extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cdb {
    TestUnitReady,
    RequestSense {
        allocation_length: usize,
    },
    FormatUnit,
    SendDiagnostic {
        self_test: bool,
    },
    Inquiry {
        evpd: bool,
        page_code: u8,
        allocation_length: usize,
    },
    ModeSense6 {
        allocation_length: usize,
    },
    ReadCapacity10,
    Read {
        lba: u64,
        transfer_blocks: u32,
    },
    Write {
        lba: u64,
        transfer_blocks: u32,
    },
    Verify {
        lba: u64,
        transfer_blocks: u32,
    },
    SynchronizeCache,
    ReportLuns {
        allocation_length: usize,
    },
}

impl Cdb {
    /// Decodes a 16-byte CDB field. An operation code this target does not
    /// implement yields INVALID COMMAND OPERATION CODE sense data.
    pub fn decode(cdb: &[u8; 16]) -> Result<Cdb, SenseData> {
        match cdb[0] {
            0x00 => Ok(Cdb::TestUnitReady),
            0x03 => Ok(Cdb::RequestSense {
                allocation_length: cdb[4] as usize,
            }),
            0x04 => Ok(Cdb::FormatUnit),
            0x1D => {
                // Only the default self-test (no parameter list) is offered.
                if cdb[1] & 0x10 != 0 || cdb[3] != 0 || cdb[4] != 0 {
                    return Err(SenseData::invalid_field_in_cdb());
                }
                Ok(Cdb::SendDiagnostic {
                    self_test: cdb[1] & 0x04 != 0,
                })
            }
            0x08 => Ok(Cdb::Read {
                lba: lba6(cdb),
                transfer_blocks: length6(cdb),
            }),
            0x0A => Ok(Cdb::Write {
                lba: lba6(cdb),
                transfer_blocks: length6(cdb),
            }),
            0x12 => {
                let evpd = cdb[1] & 0x01 != 0;
                let page_code = cdb[2];
                // Page code without EVPD is an illegal combination.
                if !evpd && page_code != 0 {
                    return Err(SenseData::invalid_field_in_cdb());
                }
                Ok(Cdb::Inquiry {
                    evpd,
                    page_code,
                    allocation_length: BigEndian::read_u16(&cdb[3..5]) as usize,
                })
            }
            0x1A => Ok(Cdb::ModeSense6 {
                allocation_length: cdb[4] as usize,
            }),
            0x25 => Ok(Cdb::ReadCapacity10),
            0x28 => Ok(Cdb::Read {
                lba: BigEndian::read_u32(&cdb[2..6]) as u64,
                transfer_blocks: BigEndian::read_u16(&cdb[7..9]) as u32,
            }),
            0x2A => Ok(Cdb::Write {
                lba: BigEndian::read_u32(&cdb[2..6]) as u64,
                transfer_blocks: BigEndian::read_u16(&cdb[7..9]) as u32,
            }),
            0x2F => Ok(Cdb::Verify {
                lba: BigEndian::read_u32(&cdb[2..6]) as u64,
                transfer_blocks: BigEndian::read_u16(&cdb[7..9]) as u32,
            }),
            0x35 => Ok(Cdb::SynchronizeCache),
            0xA0 => Ok(Cdb::ReportLuns {
                allocation_length: BigEndian::read_u32(&cdb[6..10]) as usize,
            }),
            other => {
                log::debug!("unimplemented SCSI operation code 0x{:02x}", other);
                Err(SenseData::invalid_command_operation_code())
            }
        }
    }

    /// True for the commands that move user data from the initiator.
    pub fn is_write(&self) -> bool {
        matches!(self, Cdb::Write { .. })
    }
}

/// The 6-byte CDB packs the LBA into 21 bits spanning bytes 1-3.
fn lba6(cdb: &[u8; 16]) -> u64 {
    (((cdb[1] & 0x1F) as u64) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64
}

/// In the 6-byte form a transfer length of 0 means 256 blocks.
fn length6(cdb: &[u8; 16]) -> u32 {
    if cdb[4] == 0 {
        256
    } else {
        cdb[4] as u32
    }
}
