//! NOP-Out / NOP-In parsing (RFC 3720 Sections 10.18, 10.19)
//!
//! NOPs are the keep-alive and ping mechanism. A NOP-Out with a reserved
//! Target Transfer Tag is an initiator ping; the target echoes any ping data
//! back in a NOP-In whose Target Transfer Tag is reserved.

use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopOutParser {
    /// `RESERVED_TAG` for a ping; otherwise echoes a target NOP-In ping.
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl NopOutParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation("NopOut.Flags must be exactly 0x80"));
        }
        reserved_range("NopOut.Reserved1", &buf[2..4])?;
        reserved_range("NopOut.Reserved2", &buf[32..48])?;

        Ok(NopOutParser {
            target_transfer_tag: read_word(buf, 20),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopInParser {
    /// `RESERVED_TAG` when answering a ping; otherwise this is a target ping
    /// the initiator must echo.
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl NopInParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation("NopIn.Flags must be exactly 0x80"));
        }
        reserved_range("NopIn.Reserved1", &buf[2..4])?;
        reserved_range("NopIn.Reserved2", &buf[36..48])?;

        Ok(NopInParser {
            target_transfer_tag: read_word(buf, 20),
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{DataSegment, PduParser, PduSettings, ProtocolDataUnit, RESERVED_TAG};

    #[test]
    fn test_ping_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::NopOut(NopOutParser {
            target_transfer_tag: RESERVED_TAG,
            cmd_sn: 5,
            exp_stat_sn: 2,
        }))
        .with_itt(0x1234)
        .with_data(DataSegment::binary(b"ping payload".to_vec()));
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_flags_byte_strict() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x00;
        bytes[1] = 0xC0; // stray bit 6
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_reserved_tail_rejected() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x00;
        bytes[1] = 0x80;
        bytes[20..24].fill(0xFF);
        bytes[40] = 1; // reserved tail
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }
}
