//! SCSI Data-Out / Data-In / Ready To Transfer parsing (RFC 3720 Sections
//! 10.7, 10.8, 10.9)
//!
//! These three PDU kinds carry the data phase of a SCSI command. The target
//! solicits write data with R2T PDUs naming a Target Transfer Tag; the
//! initiator answers with Data-Out PDUs carrying that tag and a buffer
//! offset; read data flows back in Data-In PDUs, optionally collapsing the
//! final status into the last one (phase collapse, the S bit).

use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE, RESERVED_TAG};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataOutParser {
    /// Set on the last Data-Out of a sequence.
    pub final_flag: bool,
    /// Tag from the soliciting R2T, or `RESERVED_TAG` for unsolicited data.
    pub target_transfer_tag: u32,
    pub exp_stat_sn: u32,
    /// Sequence number within this data sequence, starting at 0.
    pub data_sn: u32,
    /// Offset of this PDU's payload within the command's write buffer.
    pub buffer_offset: u32,
}

impl DataOutParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x7F != 0 {
            return Err(IscsiError::violation(
                "DataOut.Flags reserved bits must be zero",
            ));
        }
        reserved_range("DataOut.Reserved1", &buf[2..4])?;
        reserved_range("DataOut.Reserved2", &buf[24..28])?;
        reserved_range("DataOut.Reserved3", &buf[32..36])?;
        reserved_range("DataOut.Reserved4", &buf[44..48])?;

        Ok(DataOutParser {
            final_flag: flags & 0x80 != 0,
            target_transfer_tag: read_word(buf, 20),
            exp_stat_sn: read_word(buf, 28),
            data_sn: read_word(buf, 36),
            buffer_offset: read_word(buf, 40),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = if self.final_flag { 0x80 } else { 0 };
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 28, self.exp_stat_sn);
        write_word(out, 36, self.data_sn);
        write_word(out, 40, self.buffer_offset);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInParser {
    pub final_flag: bool,
    /// Requests a data acknowledgement from the initiator.
    pub acknowledge: bool,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    /// Phase collapse: final status piggybacked on the last Data-In.
    pub status_flag: bool,
    pub status: u8,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
}

impl DataInParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x38 != 0 {
            return Err(IscsiError::violation(
                "DataIn.Flags reserved bits 3-5 must be zero",
            ));
        }
        if buf[2] != 0 {
            return Err(IscsiError::violation("DataIn.Reserved byte 2 must be zero"));
        }

        Ok(DataInParser {
            final_flag: flags & 0x80 != 0,
            acknowledge: flags & 0x40 != 0,
            residual_overflow: flags & 0x04 != 0,
            residual_underflow: flags & 0x02 != 0,
            status_flag: flags & 0x01 != 0,
            status: buf[3],
            target_transfer_tag: read_word(buf, 20),
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            data_sn: read_word(buf, 36),
            buffer_offset: read_word(buf, 40),
            residual_count: read_word(buf, 44),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = 0u8;
        if self.final_flag {
            flags |= 0x80;
        }
        if self.acknowledge {
            flags |= 0x40;
        }
        if self.residual_overflow {
            flags |= 0x04;
        }
        if self.residual_underflow {
            flags |= 0x02;
        }
        if self.status_flag {
            flags |= 0x01;
        }
        out[1] = flags;
        out[3] = self.status;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        write_word(out, 36, self.data_sn);
        write_word(out, 40, self.buffer_offset);
        write_word(out, 44, self.residual_count);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.status_flag && !self.final_flag {
            return Err(IscsiError::violation(
                "DataIn S bit requires the F bit to be set",
            ));
        }
        if (self.residual_overflow || self.residual_underflow) && !self.status_flag {
            return Err(IscsiError::violation(
                "DataIn residual flags are only valid with the S bit",
            ));
        }
        if self.residual_overflow && self.residual_underflow {
            return Err(IscsiError::violation(
                "DataIn residual overflow and underflow are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready2TransferParser {
    /// Tag the initiator must echo in the solicited Data-Out PDUs. Never the
    /// reserved value.
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    /// Sequence number of this R2T within the command, starting at 0.
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_data_transfer_length: u32,
}

impl Ready2TransferParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation(
                "R2T.Flags must be exactly 0x80",
            ));
        }
        reserved_range("R2T.Reserved", &buf[2..4])?;

        Ok(Ready2TransferParser {
            target_transfer_tag: read_word(buf, 20),
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            r2t_sn: read_word(buf, 36),
            buffer_offset: read_word(buf, 40),
            desired_data_transfer_length: read_word(buf, 44),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        write_word(out, 36, self.r2t_sn);
        write_word(out, 40, self.buffer_offset);
        write_word(out, 44, self.desired_data_transfer_length);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.target_transfer_tag == RESERVED_TAG {
            return Err(IscsiError::violation(
                "R2T TargetTransferTag must not be the reserved value",
            ));
        }
        if self.desired_data_transfer_length == 0 {
            return Err(IscsiError::violation(
                "R2T DesiredDataTransferLength must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{DataSegment, PduParser, PduSettings, ProtocolDataUnit};

    #[test]
    fn test_data_out_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::ScsiDataOut(DataOutParser {
            final_flag: true,
            target_transfer_tag: 0x0001_0000,
            exp_stat_sn: 9,
            data_sn: 2,
            buffer_offset: 16384,
        }))
        .with_itt(0x42)
        .with_data(DataSegment::binary(vec![0x5A; 512]));
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_data_in_phase_collapse_requires_final() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x25;
        bytes[1] = 0x01; // S without F
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_data_in_with_status_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::ScsiDataIn(DataInParser {
            final_flag: true,
            acknowledge: false,
            residual_overflow: false,
            residual_underflow: false,
            status_flag: true,
            status: 0x00, // GOOD
            target_transfer_tag: RESERVED_TAG,
            stat_sn: 12,
            exp_cmd_sn: 5,
            max_cmd_sn: 37,
            data_sn: 0,
            buffer_offset: 0,
            residual_count: 0,
        }))
        .with_itt(0x11)
        .with_data(DataSegment::binary(vec![0u8; 512]));
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_r2t_reserved_tag_rejected() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x31;
        bytes[1] = 0x80;
        bytes[20..24].fill(0xFF); // TTT = reserved
        bytes[44..48].copy_from_slice(&1024u32.to_be_bytes());
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_r2t_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::Ready2Transfer(Ready2TransferParser {
            target_transfer_tag: 0x0001_0002,
            stat_sn: 4,
            exp_cmd_sn: 6,
            max_cmd_sn: 38,
            r2t_sn: 0,
            buffer_offset: 0,
            desired_data_transfer_length: 65536,
        }))
        .with_itt(0x21);
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }
}
