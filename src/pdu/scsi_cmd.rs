//! SCSI Command / SCSI Response parsing (RFC 3720 Sections 10.3, 10.4)

use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE};

/// SCSI task attributes (SAM-2), carried in the low three bits of byte 1 of
/// a SCSI Command PDU. The attribute decides queueing behavior in the task
/// set: SIMPLE tasks may run concurrently, an ORDERED task is a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskAttribute {
    Untagged = 0,
    Simple = 1,
    Ordered = 2,
    HeadOfQueue = 3,
    Aca = 4,
}

impl TaskAttribute {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TaskAttribute::Untagged),
            1 => Ok(TaskAttribute::Simple),
            2 => Ok(TaskAttribute::Ordered),
            3 => Ok(TaskAttribute::HeadOfQueue),
            4 => Ok(TaskAttribute::Aca),
            other => Err(IscsiError::violation(format!(
                "invalid task attribute {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommandParser {
    /// Final flag; clear only when unsolicited Data-Out PDUs follow.
    pub final_flag: bool,
    pub read: bool,
    pub write: bool,
    pub attribute: TaskAttribute,
    pub expected_data_transfer_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    /// The Command Descriptor Block, zero-padded to 16 bytes. CDBs longer
    /// than 16 bytes continue in an Extended CDB AHS.
    pub cdb: [u8; 16],
}

impl ScsiCommandParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x18 != 0 {
            return Err(IscsiError::violation(
                "ScsiCommand.Flags reserved bits 3-4 must be zero",
            ));
        }
        reserved_range("ScsiCommand.Reserved", &buf[2..4])?;

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&buf[32..48]);

        Ok(ScsiCommandParser {
            final_flag: flags & 0x80 != 0,
            read: flags & 0x40 != 0,
            write: flags & 0x20 != 0,
            attribute: TaskAttribute::from_u8(flags & 0x07)?,
            expected_data_transfer_length: read_word(buf, 20),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
            cdb,
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = self.attribute as u8;
        if self.final_flag {
            flags |= 0x80;
        }
        if self.read {
            flags |= 0x40;
        }
        if self.write {
            flags |= 0x20;
        }
        out[1] = flags;
        write_word(out, 20, self.expected_data_transfer_length);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
        out[32..48].copy_from_slice(&self.cdb);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if !self.final_flag && !self.write {
            return Err(IscsiError::violation(
                "ScsiCommand F bit may only be clear for write commands",
            ));
        }
        if (self.read || self.write) && self.expected_data_transfer_length == 0 {
            return Err(IscsiError::violation(
                "ScsiCommand R/W set but ExpectedDataTransferLength is zero",
            ));
        }
        if !self.read && !self.write && self.expected_data_transfer_length != 0 {
            return Err(IscsiError::violation(
                "ScsiCommand ExpectedDataTransferLength set without R or W",
            ));
        }
        Ok(())
    }
}

/// The iSCSI service response field (byte 2 of a SCSI Response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceResponse {
    CommandCompletedAtTarget = 0x00,
    TargetFailure = 0x01,
}

impl ServiceResponse {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ServiceResponse::CommandCompletedAtTarget),
            0x01 => Ok(ServiceResponse::TargetFailure),
            other => Err(IscsiError::violation(format!(
                "invalid SCSI service response 0x{:02x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiResponseParser {
    pub bidi_read_residual_overflow: bool,
    pub bidi_read_residual_underflow: bool,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    pub response: ServiceResponse,
    /// SCSI status byte (SAM-2); meaningful only when the response is
    /// `CommandCompletedAtTarget`.
    pub status: u8,
    pub snack_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub bidi_read_residual_count: u32,
    pub residual_count: u32,
}

impl ScsiResponseParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x80 == 0 {
            return Err(IscsiError::violation(
                "ScsiResponse.Flags bit 7 must be one",
            ));
        }
        if flags & 0x61 != 0 {
            return Err(IscsiError::violation(
                "ScsiResponse.Flags reserved bits must be zero",
            ));
        }

        Ok(ScsiResponseParser {
            bidi_read_residual_overflow: flags & 0x10 != 0,
            bidi_read_residual_underflow: flags & 0x08 != 0,
            residual_overflow: flags & 0x04 != 0,
            residual_underflow: flags & 0x02 != 0,
            response: ServiceResponse::from_u8(buf[2])?,
            status: buf[3],
            snack_tag: read_word(buf, 20),
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            exp_data_sn: read_word(buf, 36),
            bidi_read_residual_count: read_word(buf, 40),
            residual_count: read_word(buf, 44),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = 0x80u8;
        if self.bidi_read_residual_overflow {
            flags |= 0x10;
        }
        if self.bidi_read_residual_underflow {
            flags |= 0x08;
        }
        if self.residual_overflow {
            flags |= 0x04;
        }
        if self.residual_underflow {
            flags |= 0x02;
        }
        out[1] = flags;
        out[2] = self.response as u8;
        out[3] = self.status;
        write_word(out, 20, self.snack_tag);
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        write_word(out, 36, self.exp_data_sn);
        write_word(out, 40, self.bidi_read_residual_count);
        write_word(out, 44, self.residual_count);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.residual_overflow && self.residual_underflow {
            return Err(IscsiError::violation(
                "ScsiResponse residual overflow and underflow are mutually exclusive",
            ));
        }
        if self.bidi_read_residual_overflow && self.bidi_read_residual_underflow {
            return Err(IscsiError::violation(
                "ScsiResponse bidi residual overflow and underflow are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PduParser, PduSettings, ProtocolDataUnit};

    fn read10_command() -> ProtocolDataUnit {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x28; // READ (10)
        cdb[5] = 0x10; // LBA 16
        cdb[8] = 0x08; // 8 blocks
        ProtocolDataUnit::new(PduParser::ScsiCommand(ScsiCommandParser {
            final_flag: true,
            read: true,
            write: false,
            attribute: TaskAttribute::Simple,
            expected_data_transfer_length: 4096,
            cmd_sn: 7,
            exp_stat_sn: 3,
            cdb,
        }))
        .with_itt(0x0000_0007)
    }

    #[test]
    fn test_command_roundtrip() {
        let settings = PduSettings::default();
        let pdu = read10_command();
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_nonfinal_read_rejected() {
        let settings = PduSettings::default();
        let mut bytes = read10_command().serialize(&settings);
        bytes[1] &= !0x80; // clear F on a read command
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_read_without_edtl_rejected() {
        let settings = PduSettings::default();
        let mut bytes = read10_command().serialize(&settings);
        bytes[20..24].fill(0); // ExpectedDataTransferLength = 0
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_response_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::ScsiResponse(ScsiResponseParser {
            bidi_read_residual_overflow: false,
            bidi_read_residual_underflow: false,
            residual_overflow: false,
            residual_underflow: true,
            response: ServiceResponse::CommandCompletedAtTarget,
            status: 0x02, // CHECK CONDITION
            snack_tag: 0,
            stat_sn: 3,
            exp_cmd_sn: 8,
            max_cmd_sn: 40,
            exp_data_sn: 0,
            bidi_read_residual_count: 0,
            residual_count: 512,
        }))
        .with_itt(0x0000_0007);
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_residual_flags_mutually_exclusive() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x21;
        bytes[1] = 0x80 | 0x04 | 0x02; // both O and U
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }
}
