//! Text Request / Text Response parsing and the text key negotiation format
//! (RFC 3720 Sections 10.10, 10.11 and 5.1)
//!
//! Text and Login data segments carry NUL-delimited `key=value` pairs. A
//! negotiation too large for one PDU spans several with the Continue bit
//! set; [`TextReassembler`] stitches the pieces back together before the
//! keys are parsed.

use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE};

/// Parses a text data segment into ordered `key=value` pairs.
///
/// Pairs are separated by NUL bytes; a trailing NUL is allowed. A pair
/// without `=` or one that is not UTF-8 is a protocol violation.
pub fn parse_text_parameters(bytes: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| IscsiError::violation("text segment is not valid UTF-8"))?;

    let mut pairs = Vec::new();
    for pair in text.split('\0') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                pairs.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(IscsiError::violation(format!(
                    "malformed text parameter {:?}",
                    pair
                )));
            }
        }
    }
    Ok(pairs)
}

/// Serializes `key=value` pairs into a text data segment, each pair
/// NUL-terminated.
pub fn serialize_text_parameters(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

/// Accumulates the data segments of a multi-PDU text negotiation.
///
/// Keys are only parsed once the final piece arrives; until then the raw
/// bytes are buffered because a `key=value` pair may be split across PDU
/// boundaries at any byte.
#[derive(Debug)]
pub struct TextReassembler {
    buffer: Vec<u8>,
    max_length: usize,
}

impl Default for TextReassembler {
    fn default() -> Self {
        TextReassembler::new()
    }
}

impl TextReassembler {
    pub fn new() -> Self {
        TextReassembler {
            buffer: Vec::new(),
            // Matches the MaxRecvDataSegmentLength ceiling we offer, so a
            // peer cannot grow the buffer without bound.
            max_length: 1 << 20,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Feeds one data segment. Returns the parsed pairs when `continue_flag`
    /// is clear (the sequence is complete), `None` while more PDUs are
    /// expected.
    pub fn push(
        &mut self,
        bytes: &[u8],
        continue_flag: bool,
    ) -> Result<Option<Vec<(String, String)>>> {
        if self.buffer.len() + bytes.len() > self.max_length {
            self.buffer.clear();
            return Err(IscsiError::violation(
                "text negotiation exceeds the reassembly limit",
            ));
        }
        self.buffer.extend_from_slice(bytes);
        if continue_flag {
            return Ok(None);
        }
        let pairs = parse_text_parameters(&self.buffer);
        self.buffer.clear();
        pairs.map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRequestParser {
    pub final_flag: bool,
    pub continue_flag: bool,
    /// `RESERVED_TAG` opens a new negotiation; otherwise continues the one
    /// the target tagged.
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl TextRequestParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x3F != 0 {
            return Err(IscsiError::violation(
                "TextRequest.Flags reserved bits must be zero",
            ));
        }
        reserved_range("TextRequest.Reserved1", &buf[2..4])?;
        reserved_range("TextRequest.Reserved2", &buf[32..48])?;

        Ok(TextRequestParser {
            final_flag: flags & 0x80 != 0,
            continue_flag: flags & 0x40 != 0,
            target_transfer_tag: read_word(buf, 20),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = 0u8;
        if self.final_flag {
            flags |= 0x80;
        }
        if self.continue_flag {
            flags |= 0x40;
        }
        out[1] = flags;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.final_flag && self.continue_flag {
            return Err(IscsiError::violation(
                "TextRequest Final and Continue flags are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponseParser {
    pub final_flag: bool,
    pub continue_flag: bool,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl TextResponseParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x3F != 0 {
            return Err(IscsiError::violation(
                "TextResponse.Flags reserved bits must be zero",
            ));
        }
        reserved_range("TextResponse.Reserved1", &buf[2..4])?;
        reserved_range("TextResponse.Reserved2", &buf[36..48])?;

        Ok(TextResponseParser {
            final_flag: flags & 0x80 != 0,
            continue_flag: flags & 0x40 != 0,
            target_transfer_tag: read_word(buf, 20),
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = 0u8;
        if self.final_flag {
            flags |= 0x80;
        }
        if self.continue_flag {
            flags |= 0x40;
        }
        out[1] = flags;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.final_flag && self.continue_flag {
            return Err(IscsiError::violation(
                "TextResponse Final and Continue flags are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{PduParser, PduSettings, ProtocolDataUnit, RESERVED_TAG};

    #[test]
    fn test_parse_text_parameters() {
        let pairs =
            parse_text_parameters(b"HeaderDigest=CRC32C\0MaxConnections=1\0").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("HeaderDigest".to_string(), "CRC32C".to_string()),
                ("MaxConnections".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_empty_value_allowed() {
        let pairs = parse_text_parameters(b"SendTargets=\0").unwrap();
        assert_eq!(pairs, vec![("SendTargets".to_string(), String::new())]);
    }

    #[test]
    fn test_parse_malformed_pair() {
        assert!(parse_text_parameters(b"NoEqualsSign\0").is_err());
        assert!(parse_text_parameters(b"=value\0").is_err());
        assert!(parse_text_parameters(&[0x80, 0xFF]).is_err());
    }

    #[test]
    fn test_serialize_matches_parse() {
        let pairs = vec![("TargetName".to_string(), "iqn.example:disk0".to_string())];
        let bytes = serialize_text_parameters(&pairs);
        assert_eq!(bytes, b"TargetName=iqn.example:disk0\0");
        assert_eq!(parse_text_parameters(&bytes).unwrap(), pairs);
    }

    #[test]
    fn test_reassembler_splits_pair_across_pdus() {
        let mut reassembler = TextReassembler::new();
        // The pair is cut in the middle of the value.
        assert!(reassembler.push(b"HeaderDigest=CR", true).unwrap().is_none());
        let pairs = reassembler.push(b"C32C\0", false).unwrap().unwrap();
        assert_eq!(
            pairs,
            vec![("HeaderDigest".to_string(), "CRC32C".to_string())]
        );
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_final_and_continue_mutually_exclusive() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x04;
        bytes[1] = 0xC0;
        bytes[20..24].fill(0xFF);
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_request_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::TextRequest(TextRequestParser {
            final_flag: true,
            continue_flag: false,
            target_transfer_tag: RESERVED_TAG,
            cmd_sn: 3,
            exp_stat_sn: 3,
        }))
        .with_itt(0x77);
        let pdu = pdu.with_data(crate::pdu::DataSegment::text_pairs(&[(
            "SendTargets".to_string(),
            "All".to_string(),
        )]));
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);
        assert_eq!(
            parsed.data.text().unwrap(),
            vec![("SendTargets".to_string(), "All".to_string())]
        );
    }
}
