//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs based on
//! RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! A PDU is a fixed 48-byte Basic Header Segment, zero or more Additional
//! Header Segments (TLV, padded to 4-byte words), an optional header digest,
//! a data segment padded to a 4-byte boundary, and an optional data digest.
//! The opcode in byte 0 selects a parser variant that owns bytes 1-3 and
//! 20-47; everything else is common to all PDU kinds.

pub mod control;
pub mod data;
pub mod login;
pub mod nop;
pub mod scsi_cmd;
pub mod text;

use byteorder::{BigEndian, ByteOrder};

use crate::codec;
use crate::digest::DigestType;
use crate::error::{IscsiError, Result};

pub use control::{
    AsyncMessageParser, LogoutReason, LogoutRequestParser, LogoutResponseParser, RejectParser,
    RejectReason, SnackRequestParser, SnackType, TaskManagementFunction,
    TaskManagementRequestParser, TaskManagementResponseParser, TmfResponse,
};
pub use data::{DataInParser, DataOutParser, Ready2TransferParser};
pub use login::{
    Isid, LoginRequestParser, LoginResponseParser, LoginStage, LoginStatusClass, VERSION,
};
pub use nop::{NopInParser, NopOutParser};
pub use scsi_cmd::{ScsiCommandParser, ScsiResponseParser, ServiceResponse, TaskAttribute};
pub use text::{
    parse_text_parameters, serialize_text_parameters, TextReassembler, TextRequestParser,
    TextResponseParser,
};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Reserved Target Transfer Tag value (`0xFFFFFFFF`)
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU opcodes (RFC 3720 Section 10), lower 6 bits of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Initiator opcodes (initiator → target)
    NopOut = 0x00,
    ScsiCommand = 0x01,
    TaskManagementRequest = 0x02,
    LoginRequest = 0x03,
    TextRequest = 0x04,
    ScsiDataOut = 0x05,
    LogoutRequest = 0x06,
    SnackRequest = 0x10,

    // Target opcodes (target → initiator)
    NopIn = 0x20,
    ScsiResponse = 0x21,
    TaskManagementResponse = 0x22,
    LoginResponse = 0x23,
    TextResponse = 0x24,
    ScsiDataIn = 0x25,
    LogoutResponse = 0x26,
    Ready2Transfer = 0x31,
    AsyncMessage = 0x32,
    Reject = 0x3F,
}

/// Who sends a given PDU kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InitiatorToTarget,
    TargetToInitiator,
}

impl Opcode {
    /// Decodes the opcode field; unknown values fail with
    /// [`IscsiError::UnsupportedOpcode`] so the caller can emit a Reject PDU
    /// instead of dropping the connection.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Opcode::NopOut),
            0x01 => Ok(Opcode::ScsiCommand),
            0x02 => Ok(Opcode::TaskManagementRequest),
            0x03 => Ok(Opcode::LoginRequest),
            0x04 => Ok(Opcode::TextRequest),
            0x05 => Ok(Opcode::ScsiDataOut),
            0x06 => Ok(Opcode::LogoutRequest),
            0x10 => Ok(Opcode::SnackRequest),
            0x20 => Ok(Opcode::NopIn),
            0x21 => Ok(Opcode::ScsiResponse),
            0x22 => Ok(Opcode::TaskManagementResponse),
            0x23 => Ok(Opcode::LoginResponse),
            0x24 => Ok(Opcode::TextResponse),
            0x25 => Ok(Opcode::ScsiDataIn),
            0x26 => Ok(Opcode::LogoutResponse),
            0x31 => Ok(Opcode::Ready2Transfer),
            0x32 => Ok(Opcode::AsyncMessage),
            0x3F => Ok(Opcode::Reject),
            other => Err(IscsiError::UnsupportedOpcode(other)),
        }
    }

    /// The direction this opcode travels in.
    pub fn direction(self) -> Direction {
        if (self as u8) < 0x20 {
            Direction::InitiatorToTarget
        } else {
            Direction::TargetToInitiator
        }
    }

    /// Human-readable opcode name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::NopOut => "NOP-Out",
            Opcode::ScsiCommand => "SCSI Command",
            Opcode::TaskManagementRequest => "Task Management Request",
            Opcode::LoginRequest => "Login Request",
            Opcode::TextRequest => "Text Request",
            Opcode::ScsiDataOut => "SCSI Data-Out",
            Opcode::LogoutRequest => "Logout Request",
            Opcode::SnackRequest => "SNACK Request",
            Opcode::NopIn => "NOP-In",
            Opcode::ScsiResponse => "SCSI Response",
            Opcode::TaskManagementResponse => "Task Management Response",
            Opcode::LoginResponse => "Login Response",
            Opcode::TextResponse => "Text Response",
            Opcode::ScsiDataIn => "SCSI Data-In",
            Opcode::LogoutResponse => "Logout Response",
            Opcode::Ready2Transfer => "Ready To Transfer",
            Opcode::AsyncMessage => "Async Message",
            Opcode::Reject => "Reject",
        }
    }

    /// The logical format of this PDU kind's data segment.
    pub fn segment_format(self) -> SegmentFormat {
        match self {
            Opcode::LoginRequest
            | Opcode::LoginResponse
            | Opcode::TextRequest
            | Opcode::TextResponse => SegmentFormat::Text,
            _ => SegmentFormat::Binary,
        }
    }
}

/// Logical format of a data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    /// No data segment present.
    None,
    /// Raw bytes (SCSI data, sense data, ping data).
    Binary,
    /// NUL-delimited `key=value` pairs (Login and Text negotiation).
    Text,
}

/// A PDU's data segment: raw bytes plus their logical format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub format: SegmentFormat,
    pub bytes: Vec<u8>,
}

impl Default for SegmentFormat {
    fn default() -> Self {
        SegmentFormat::None
    }
}

impl DataSegment {
    pub fn none() -> Self {
        DataSegment {
            format: SegmentFormat::None,
            bytes: Vec::new(),
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return DataSegment::none();
        }
        DataSegment {
            format: SegmentFormat::Binary,
            bytes,
        }
    }

    /// Builds a text segment from `key=value` pairs.
    pub fn text_pairs(pairs: &[(String, String)]) -> Self {
        let bytes = text::serialize_text_parameters(pairs);
        if bytes.is_empty() {
            return DataSegment::none();
        }
        DataSegment {
            format: SegmentFormat::Text,
            bytes,
        }
    }

    /// Parses the segment as NUL-delimited `key=value` pairs.
    pub fn text(&self) -> Result<Vec<(String, String)>> {
        text::parse_text_parameters(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One Additional Header Segment: a TLV of 2-byte length, 1-byte type, one
/// type-specific byte and a payload padded to 4-byte words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalHeaderSegment {
    pub ahs_type: u8,
    pub type_specific: u8,
    pub payload: Vec<u8>,
}

/// AHS type codes (RFC 3720 Section 10.2.2.1)
pub mod ahs_type {
    pub const EXTENDED_CDB: u8 = 0x01;
    pub const EXPECTED_BIDIRECTIONAL_READ_LENGTH: u8 = 0x02;
}

impl AdditionalHeaderSegment {
    /// Parses one AHS from the front of `buf`, returning it and the number
    /// of (padded) bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(IscsiError::violation(format!(
                "AHS truncated: {} bytes, need at least 4",
                buf.len()
            )));
        }
        let length = BigEndian::read_u16(&buf[0..2]) as usize;
        let ahs_type = buf[2];
        let type_specific = buf[3];

        // AHSLength counts the bytes after the type-specific byte.
        let consumed = pad4(4 + length.saturating_sub(1));
        if buf.len() < consumed {
            return Err(IscsiError::violation(format!(
                "AHS payload truncated: {} bytes, need {}",
                buf.len(),
                consumed
            )));
        }
        let payload = buf[4..4 + length.saturating_sub(1)].to_vec();
        Ok((
            AdditionalHeaderSegment {
                ahs_type,
                type_specific,
                payload,
            },
            consumed,
        ))
    }

    /// Serializes this AHS including padding to a 4-byte word.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let length = self.payload.len() + 1;
        let mut buf = Vec::with_capacity(pad4(4 + self.payload.len()));
        buf.extend_from_slice(&(length as u16).to_be_bytes());
        buf.push(self.ahs_type);
        buf.push(self.type_specific);
        buf.extend_from_slice(&self.payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        out.extend_from_slice(&buf);
    }

    /// Padded wire size of this AHS.
    pub fn wire_size(&self) -> usize {
        pad4(4 + self.payload.len())
    }
}

/// Rounds `len` up to the next 4-byte boundary.
#[inline]
pub fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Opcode-specific parser variants.
///
/// One concrete type per PDU kind; the opcode uniquely determines which
/// variant validates and consumes bytes 1-3 and 20-47 of the BHS. Variants
/// are constructed fresh for every PDU - there is no clear()-and-reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduParser {
    NopOut(NopOutParser),
    NopIn(NopInParser),
    ScsiCommand(ScsiCommandParser),
    ScsiResponse(ScsiResponseParser),
    TaskManagementRequest(TaskManagementRequestParser),
    TaskManagementResponse(TaskManagementResponseParser),
    LoginRequest(LoginRequestParser),
    LoginResponse(LoginResponseParser),
    TextRequest(TextRequestParser),
    TextResponse(TextResponseParser),
    ScsiDataOut(DataOutParser),
    ScsiDataIn(DataInParser),
    LogoutRequest(LogoutRequestParser),
    LogoutResponse(LogoutResponseParser),
    Ready2Transfer(Ready2TransferParser),
    SnackRequest(SnackRequestParser),
    AsyncMessage(AsyncMessageParser),
    Reject(RejectParser),
}

impl PduParser {
    /// The parser registry: selects and runs the variant for `opcode` over
    /// the 48 BHS bytes.
    fn deserialize(opcode: Opcode, bhs: &[u8; BHS_SIZE]) -> Result<Self> {
        Ok(match opcode {
            Opcode::NopOut => PduParser::NopOut(NopOutParser::deserialize(bhs)?),
            Opcode::NopIn => PduParser::NopIn(NopInParser::deserialize(bhs)?),
            Opcode::ScsiCommand => PduParser::ScsiCommand(ScsiCommandParser::deserialize(bhs)?),
            Opcode::ScsiResponse => PduParser::ScsiResponse(ScsiResponseParser::deserialize(bhs)?),
            Opcode::TaskManagementRequest => {
                PduParser::TaskManagementRequest(TaskManagementRequestParser::deserialize(bhs)?)
            }
            Opcode::TaskManagementResponse => {
                PduParser::TaskManagementResponse(TaskManagementResponseParser::deserialize(bhs)?)
            }
            Opcode::LoginRequest => PduParser::LoginRequest(LoginRequestParser::deserialize(bhs)?),
            Opcode::LoginResponse => {
                PduParser::LoginResponse(LoginResponseParser::deserialize(bhs)?)
            }
            Opcode::TextRequest => PduParser::TextRequest(TextRequestParser::deserialize(bhs)?),
            Opcode::TextResponse => PduParser::TextResponse(TextResponseParser::deserialize(bhs)?),
            Opcode::ScsiDataOut => PduParser::ScsiDataOut(DataOutParser::deserialize(bhs)?),
            Opcode::ScsiDataIn => PduParser::ScsiDataIn(DataInParser::deserialize(bhs)?),
            Opcode::LogoutRequest => {
                PduParser::LogoutRequest(LogoutRequestParser::deserialize(bhs)?)
            }
            Opcode::LogoutResponse => {
                PduParser::LogoutResponse(LogoutResponseParser::deserialize(bhs)?)
            }
            Opcode::Ready2Transfer => {
                PduParser::Ready2Transfer(Ready2TransferParser::deserialize(bhs)?)
            }
            Opcode::SnackRequest => PduParser::SnackRequest(SnackRequestParser::deserialize(bhs)?),
            Opcode::AsyncMessage => PduParser::AsyncMessage(AsyncMessageParser::deserialize(bhs)?),
            Opcode::Reject => PduParser::Reject(RejectParser::deserialize(bhs)?),
        })
    }

    /// Writes the variant's byte ranges (1-3 and 20-47) into `out`.
    fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        match self {
            PduParser::NopOut(p) => p.serialize(out),
            PduParser::NopIn(p) => p.serialize(out),
            PduParser::ScsiCommand(p) => p.serialize(out),
            PduParser::ScsiResponse(p) => p.serialize(out),
            PduParser::TaskManagementRequest(p) => p.serialize(out),
            PduParser::TaskManagementResponse(p) => p.serialize(out),
            PduParser::LoginRequest(p) => p.serialize(out),
            PduParser::LoginResponse(p) => p.serialize(out),
            PduParser::TextRequest(p) => p.serialize(out),
            PduParser::TextResponse(p) => p.serialize(out),
            PduParser::ScsiDataOut(p) => p.serialize(out),
            PduParser::ScsiDataIn(p) => p.serialize(out),
            PduParser::LogoutRequest(p) => p.serialize(out),
            PduParser::LogoutResponse(p) => p.serialize(out),
            PduParser::Ready2Transfer(p) => p.serialize(out),
            PduParser::SnackRequest(p) => p.serialize(out),
            PduParser::AsyncMessage(p) => p.serialize(out),
            PduParser::Reject(p) => p.serialize(out),
        }
    }

    /// Cross-field validity rules for the variant.
    fn check_integrity(&self) -> Result<()> {
        match self {
            PduParser::NopOut(p) => p.check_integrity(),
            PduParser::NopIn(p) => p.check_integrity(),
            PduParser::ScsiCommand(p) => p.check_integrity(),
            PduParser::ScsiResponse(p) => p.check_integrity(),
            PduParser::TaskManagementRequest(p) => p.check_integrity(),
            PduParser::TaskManagementResponse(p) => p.check_integrity(),
            PduParser::LoginRequest(p) => p.check_integrity(),
            PduParser::LoginResponse(p) => p.check_integrity(),
            PduParser::TextRequest(p) => p.check_integrity(),
            PduParser::TextResponse(p) => p.check_integrity(),
            PduParser::ScsiDataOut(p) => p.check_integrity(),
            PduParser::ScsiDataIn(p) => p.check_integrity(),
            PduParser::LogoutRequest(p) => p.check_integrity(),
            PduParser::LogoutResponse(p) => p.check_integrity(),
            PduParser::Ready2Transfer(p) => p.check_integrity(),
            PduParser::SnackRequest(p) => p.check_integrity(),
            PduParser::AsyncMessage(p) => p.check_integrity(),
            PduParser::Reject(p) => p.check_integrity(),
        }
    }

    /// The opcode this variant serializes as.
    pub fn opcode(&self) -> Opcode {
        match self {
            PduParser::NopOut(_) => Opcode::NopOut,
            PduParser::NopIn(_) => Opcode::NopIn,
            PduParser::ScsiCommand(_) => Opcode::ScsiCommand,
            PduParser::ScsiResponse(_) => Opcode::ScsiResponse,
            PduParser::TaskManagementRequest(_) => Opcode::TaskManagementRequest,
            PduParser::TaskManagementResponse(_) => Opcode::TaskManagementResponse,
            PduParser::LoginRequest(_) => Opcode::LoginRequest,
            PduParser::LoginResponse(_) => Opcode::LoginResponse,
            PduParser::TextRequest(_) => Opcode::TextRequest,
            PduParser::TextResponse(_) => Opcode::TextResponse,
            PduParser::ScsiDataOut(_) => Opcode::ScsiDataOut,
            PduParser::ScsiDataIn(_) => Opcode::ScsiDataIn,
            PduParser::LogoutRequest(_) => Opcode::LogoutRequest,
            PduParser::LogoutResponse(_) => Opcode::LogoutResponse,
            PduParser::Ready2Transfer(_) => Opcode::Ready2Transfer,
            PduParser::SnackRequest(_) => Opcode::SnackRequest,
            PduParser::AsyncMessage(_) => Opcode::AsyncMessage,
            PduParser::Reject(_) => Opcode::Reject,
        }
    }
}

/// Basic Header Segment - the fixed 48-byte PDU header
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicHeaderSegment {
    /// Immediate delivery flag (bit 6 of byte 0); initiator PDUs only.
    pub immediate: bool,
    /// Total AHS length in 4-byte words, as received.
    pub total_ahs_length: u8,
    /// Data segment length in bytes, as received.
    pub data_segment_length: u32,
    /// Bytes 8-15. For Login PDUs this field carries ISID + TSIH instead of
    /// a LUN; decode with [`Isid::from_lun_field`].
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19).
    pub initiator_task_tag: u32,
    /// The opcode-specific parser variant for bytes 1-3 and 20-47.
    pub parser: PduParser,
}

impl BasicHeaderSegment {
    pub fn new(parser: PduParser) -> Self {
        BasicHeaderSegment {
            immediate: false,
            total_ahs_length: 0,
            data_segment_length: 0,
            lun: 0,
            initiator_task_tag: 0,
            parser,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.parser.opcode()
    }

    fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        // Byte 0: reserved bit 7, immediate bit 6, opcode bits 0-5.
        codec::is_reserved("Byte0.Reserved", (buf[0] >> 7) as u32)?;
        let immediate = buf[0] & 0x40 != 0;
        let opcode = Opcode::from_u8(buf[0] & 0x3F)?;

        if opcode.direction() == Direction::TargetToInitiator && immediate {
            return Err(IscsiError::violation(
                "I bit set on a target-to-initiator PDU",
            ));
        }

        let total_ahs_length = buf[4];
        let data_segment_length = BigEndian::read_u32(&buf[4..8]) & codec::LAST_THREE_BYTES_MASK;
        let lun = BigEndian::read_u64(&buf[8..16]);
        let initiator_task_tag = BigEndian::read_u32(&buf[16..20]);

        let parser = PduParser::deserialize(opcode, buf)?;
        parser.check_integrity()?;

        Ok(BasicHeaderSegment {
            immediate,
            total_ahs_length,
            data_segment_length,
            lun,
            initiator_task_tag,
            parser,
        })
    }

    fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode() as u8);
        out[4] = self.total_ahs_length;
        out[5] = ((self.data_segment_length >> 16) & 0xFF) as u8;
        BigEndian::write_u16(&mut out[6..8], (self.data_segment_length & 0xFFFF) as u16);
        BigEndian::write_u64(&mut out[8..16], self.lun);
        BigEndian::write_u32(&mut out[16..20], self.initiator_task_tag);
        self.parser.serialize(out);
    }
}

/// Per-connection settings the codec needs: negotiated digests, the local
/// receive limit, and (optionally) the direction PDUs are expected to travel
/// so a target can refuse target-only opcodes and vice versa.
#[derive(Debug, Clone)]
pub struct PduSettings {
    pub header_digest: DigestType,
    pub data_digest: DigestType,
    pub max_recv_data_segment_length: u32,
    pub expected_direction: Option<Direction>,
}

impl Default for PduSettings {
    fn default() -> Self {
        PduSettings {
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            max_recv_data_segment_length: 8192,
            expected_direction: None,
        }
    }
}

impl PduSettings {
    /// Settings for a target-side connection: incoming PDUs must be
    /// initiator-sent.
    pub fn target() -> Self {
        PduSettings {
            expected_direction: Some(Direction::InitiatorToTarget),
            ..Default::default()
        }
    }
}

/// One complete iSCSI message: header, additional header segments, data
/// segment. Digests are not stored - they are validated on parse and
/// recomputed on serialize from the negotiated [`PduSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolDataUnit {
    pub bhs: BasicHeaderSegment,
    pub ahs: Vec<AdditionalHeaderSegment>,
    pub data: DataSegment,
}

impl ProtocolDataUnit {
    /// Builds a PDU around a parser variant with no AHS and no data.
    pub fn new(parser: PduParser) -> Self {
        ProtocolDataUnit {
            bhs: BasicHeaderSegment::new(parser),
            ahs: Vec::new(),
            data: DataSegment::none(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.bhs.opcode()
    }

    /// Total wire length of the buffer `parse` needs, computed from the
    /// first 48 bytes. Lets the transport read exactly one PDU.
    pub fn required_length(bhs: &[u8], settings: &PduSettings) -> Result<usize> {
        if bhs.len() < BHS_SIZE {
            return Err(IscsiError::violation(format!(
                "PDU too short: {} bytes, need at least {}",
                bhs.len(),
                BHS_SIZE
            )));
        }
        let ahs_bytes = bhs[4] as usize * 4;
        let dsl = (BigEndian::read_u32(&bhs[4..8]) & codec::LAST_THREE_BYTES_MASK) as usize;
        let mut total = BHS_SIZE + ahs_bytes + settings.header_digest.size() + pad4(dsl);
        if dsl > 0 {
            total += settings.data_digest.size();
        }
        Ok(total)
    }

    /// Parses one PDU from `buf`.
    ///
    /// Lifecycle: BHS first (opcode selects the parser variant, which then
    /// checks its cross-field rules), then AHS, then header digest, then the
    /// data segment, then the data digest. Malformed headers fail with
    /// [`IscsiError::ProtocolViolation`]; checksum failures with
    /// [`IscsiError::DigestMismatch`]; a data segment beyond the negotiated
    /// `MaxRecvDataSegmentLength` is a protocol violation.
    pub fn parse(buf: &[u8], settings: &PduSettings) -> Result<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::violation(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut bhs_bytes = [0u8; BHS_SIZE];
        bhs_bytes.copy_from_slice(&buf[..BHS_SIZE]);
        let bhs = BasicHeaderSegment::deserialize(&bhs_bytes)?;
        let opcode = bhs.opcode();

        if let Some(expected) = settings.expected_direction {
            if opcode.direction() != expected {
                return Err(IscsiError::violation(format!(
                    "{} PDU arrived against the expected direction",
                    opcode.name()
                )));
            }
        }

        if bhs.data_segment_length > settings.max_recv_data_segment_length {
            return Err(IscsiError::violation(format!(
                "DataSegmentLength {} exceeds negotiated MaxRecvDataSegmentLength {}",
                bhs.data_segment_length, settings.max_recv_data_segment_length
            )));
        }

        // Additional header segments.
        let ahs_bytes = bhs.total_ahs_length as usize * 4;
        let mut offset = BHS_SIZE;
        if buf.len() < offset + ahs_bytes {
            return Err(IscsiError::violation(format!(
                "PDU truncated in AHS: {} bytes, need {}",
                buf.len(),
                offset + ahs_bytes
            )));
        }
        let mut ahs = Vec::new();
        let mut remaining = &buf[offset..offset + ahs_bytes];
        while !remaining.is_empty() {
            let (segment, consumed) = AdditionalHeaderSegment::parse(remaining)?;
            ahs.push(segment);
            remaining = &remaining[consumed..];
        }
        offset += ahs_bytes;

        // Header digest covers BHS + AHS.
        let header_digest_size = settings.header_digest.size();
        if header_digest_size > 0 {
            if buf.len() < offset + header_digest_size {
                return Err(IscsiError::violation(
                    "PDU truncated before header digest",
                ));
            }
            let transmitted = u32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            let mut engine = settings.header_digest.create();
            engine.update(&buf[..offset]);
            engine.validate(transmitted)?;
            offset += header_digest_size;
        }

        // Data segment, padded to a 4-byte boundary on the wire.
        let dsl = bhs.data_segment_length as usize;
        let padded = pad4(dsl);
        if buf.len() < offset + padded {
            return Err(IscsiError::violation(format!(
                "PDU truncated in data segment: {} bytes, need {}",
                buf.len(),
                offset + padded
            )));
        }
        let data = if dsl == 0 {
            DataSegment::none()
        } else {
            DataSegment {
                format: opcode.segment_format(),
                bytes: buf[offset..offset + dsl].to_vec(),
            }
        };

        // Data digest covers the padded data segment and is only present
        // when a data segment is.
        let data_digest_size = settings.data_digest.size();
        if dsl > 0 && data_digest_size > 0 {
            let digest_offset = offset + padded;
            if buf.len() < digest_offset + data_digest_size {
                return Err(IscsiError::violation("PDU truncated before data digest"));
            }
            let transmitted = u32::from_le_bytes([
                buf[digest_offset],
                buf[digest_offset + 1],
                buf[digest_offset + 2],
                buf[digest_offset + 3],
            ]);
            let mut engine = settings.data_digest.create();
            engine.update(&buf[offset..offset + padded]);
            engine.validate(transmitted)?;
        }

        log::trace!(
            "parsed {} PDU, itt=0x{:08x}, dsl={}",
            opcode.name(),
            bhs.initiator_task_tag,
            dsl
        );

        Ok(ProtocolDataUnit { bhs, ahs, data })
    }

    /// Serializes this PDU, appending digests per `settings`.
    ///
    /// Each parser variant emits only the words its opcode defines; unused
    /// words stay zero. `TotalAHSLength` and `DataSegmentLength` are derived
    /// from the actual segments, not the stored header fields.
    pub fn serialize(&self, settings: &PduSettings) -> Vec<u8> {
        let ahs_bytes: usize = self.ahs.iter().map(|a| a.wire_size()).sum();
        let dsl = self.data.len();
        let padded = pad4(dsl);

        let mut buf = Vec::with_capacity(
            BHS_SIZE
                + ahs_bytes
                + settings.header_digest.size()
                + padded
                + settings.data_digest.size(),
        );

        let mut bhs_bytes = [0u8; BHS_SIZE];
        let mut bhs = self.bhs.clone();
        bhs.total_ahs_length = (ahs_bytes / 4) as u8;
        bhs.data_segment_length = dsl as u32;
        bhs.serialize(&mut bhs_bytes);
        buf.extend_from_slice(&bhs_bytes);

        for segment in &self.ahs {
            segment.serialize(&mut buf);
        }

        if settings.header_digest.size() > 0 {
            let mut engine = settings.header_digest.create();
            engine.update(&buf);
            buf.extend_from_slice(&engine.value().to_le_bytes());
        }

        let data_start = buf.len();
        buf.extend_from_slice(&self.data.bytes);
        buf.resize(data_start + padded, 0);

        if dsl > 0 && settings.data_digest.size() > 0 {
            let mut engine = settings.data_digest.create();
            engine.update(&buf[data_start..]);
            buf.extend_from_slice(&engine.value().to_le_bytes());
        }

        buf
    }

    /// Wire length of this PDU under the given settings.
    pub fn total_length(&self, settings: &PduSettings) -> usize {
        let ahs_bytes: usize = self.ahs.iter().map(|a| a.wire_size()).sum();
        let mut total =
            BHS_SIZE + ahs_bytes + settings.header_digest.size() + pad4(self.data.len());
        if !self.data.is_empty() {
            total += settings.data_digest.size();
        }
        total
    }

    /// Sets the data segment and keeps the header length field in sync.
    pub fn with_data(mut self, data: DataSegment) -> Self {
        self.bhs.data_segment_length = data.len() as u32;
        self.data = data;
        self
    }

    pub fn with_lun(mut self, lun: u64) -> Self {
        self.bhs.lun = lun;
        self
    }

    pub fn with_itt(mut self, itt: u32) -> Self {
        self.bhs.initiator_task_tag = itt;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.bhs.immediate = true;
        self
    }
}

// Shared helpers for the parser submodules.

/// Reads the big-endian 32-bit word starting at byte `offset`.
#[inline]
pub(crate) fn read_word(buf: &[u8; BHS_SIZE], offset: usize) -> u32 {
    BigEndian::read_u32(&buf[offset..offset + 4])
}

/// Writes the big-endian 32-bit word starting at byte `offset`.
#[inline]
pub(crate) fn write_word(buf: &mut [u8; BHS_SIZE], offset: usize, value: u32) {
    BigEndian::write_u32(&mut buf[offset..offset + 4], value);
}

/// Fails with a protocol violation naming `field` unless the byte range is
/// all zero.
pub(crate) fn reserved_range(field: &str, bytes: &[u8]) -> Result<()> {
    if bytes.iter().any(|&b| b != 0) {
        return Err(IscsiError::violation(format!(
            "reserved field {} must be zero",
            field
        )));
    }
    Ok(())
}
