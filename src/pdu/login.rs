//! Login Request / Login Response parsing (RFC 3720 Sections 10.12, 10.13)
//!
//! Login PDUs reuse bytes 8-15 of the header for the ISID and TSIH instead
//! of a LUN, and carry their negotiation keys as a text data segment.

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE};

/// Login stage codes carried in the CSG/NSG fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoginStage {
    SecurityNegotiation = 0,
    OperationalNegotiation = 1,
    FullFeaturePhase = 3,
}

impl LoginStage {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LoginStage::SecurityNegotiation),
            1 => Ok(LoginStage::OperationalNegotiation),
            3 => Ok(LoginStage::FullFeaturePhase),
            other => Err(IscsiError::violation(format!(
                "invalid login stage code {}",
                other
            ))),
        }
    }
}

/// Initiator Session ID, the initiator half of the session identifier.
/// Together with the target-assigned TSIH it names an iSCSI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Isid(pub [u8; 6]);

impl Isid {
    /// A random ISID, used by initiator-side tests and tools.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill(&mut bytes);
        // Type field 0b01 = IEEE OUI format with the random bit set.
        bytes[0] = (bytes[0] & 0x3F) | 0x40;
        Isid(bytes)
    }

    /// Splits the 64-bit LUN header field of a Login PDU into ISID and TSIH.
    pub fn from_lun_field(lun: u64) -> (Isid, u16) {
        let bytes = lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&bytes[..6]);
        let tsih = u16::from_be_bytes([bytes[6], bytes[7]]);
        (Isid(isid), tsih)
    }

    /// Packs ISID and TSIH back into the 64-bit header field.
    pub fn to_lun_field(self, tsih: u16) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.0);
        bytes[6..].copy_from_slice(&tsih.to_be_bytes());
        u64::from_be_bytes(bytes)
    }
}

/// Login status classes (byte 36 of a Login Response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginStatusClass {
    Success = 0,
    Redirection = 1,
    InitiatorError = 2,
    TargetError = 3,
}

impl LoginStatusClass {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LoginStatusClass::Success),
            1 => Ok(LoginStatusClass::Redirection),
            2 => Ok(LoginStatusClass::InitiatorError),
            3 => Ok(LoginStatusClass::TargetError),
            other => Err(IscsiError::violation(format!(
                "invalid login status class {}",
                other
            ))),
        }
    }
}

/// Login status detail codes (byte 37), per status class.
pub mod login_status_detail {
    pub const SUCCESS: u8 = 0x00;
    pub const INITIATOR_ERROR: u8 = 0x00;
    pub const AUTHENTICATION_FAILURE: u8 = 0x01;
    pub const AUTHORIZATION_FAILURE: u8 = 0x02;
    pub const NOT_FOUND: u8 = 0x03;
    pub const UNSUPPORTED_VERSION: u8 = 0x05;
    pub const MISSING_PARAMETER: u8 = 0x07;
    pub const TARGET_ERROR: u8 = 0x00;
    pub const SERVICE_UNAVAILABLE: u8 = 0x01;
}

/// Supported protocol version (RFC 3720 defines exactly one).
pub const VERSION: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequestParser {
    pub transit: bool,
    pub continue_flag: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub version_max: u8,
    pub version_min: u8,
    /// Connection ID within the session (bytes 20-21).
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl LoginRequestParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x30 != 0 {
            return Err(IscsiError::violation(
                "LoginRequest.Flags reserved bits 4-5 must be zero",
            ));
        }
        let transit = flags & 0x80 != 0;
        let continue_flag = flags & 0x40 != 0;
        let current_stage = LoginStage::from_u8((flags >> 2) & 0x03)?;
        // NSG is only meaningful with the Transit bit set; some initiators
        // leave stale bits in it otherwise, so decode leniently to the
        // current stage when T=0.
        let next_stage = if transit {
            LoginStage::from_u8(flags & 0x03)?
        } else {
            current_stage
        };

        reserved_range("LoginRequest.Reserved1", &buf[22..24])?;
        reserved_range("LoginRequest.Reserved2", &buf[32..48])?;

        Ok(LoginRequestParser {
            transit,
            continue_flag,
            current_stage,
            next_stage,
            version_max: buf[2],
            version_min: buf[3],
            cid: BigEndian::read_u16(&buf[20..22]),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = self.flags_byte();
        out[2] = self.version_max;
        out[3] = self.version_min;
        BigEndian::write_u16(&mut out[20..22], self.cid);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
    }

    fn flags_byte(&self) -> u8 {
        let mut flags = ((self.current_stage as u8) << 2) | (self.next_stage as u8 & 0x03);
        if self.transit {
            flags |= 0x80;
        }
        if self.continue_flag {
            flags |= 0x40;
        }
        flags
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.transit && self.continue_flag {
            return Err(IscsiError::violation(
                "LoginRequest Transit and Continue flags are mutually exclusive",
            ));
        }
        if self.current_stage == LoginStage::FullFeaturePhase {
            return Err(IscsiError::violation(
                "LoginRequest CSG cannot be FullFeaturePhase",
            ));
        }
        if self.transit && self.next_stage <= self.current_stage {
            return Err(IscsiError::violation(
                "LoginRequest NSG must name a later stage than CSG",
            ));
        }
        if self.version_max < self.version_min {
            return Err(IscsiError::violation(
                "LoginRequest VersionMax below VersionMin",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponseParser {
    pub transit: bool,
    pub continue_flag: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub version_max: u8,
    pub version_active: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: LoginStatusClass,
    pub status_detail: u8,
}

impl LoginResponseParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        let flags = buf[1];
        if flags & 0x30 != 0 {
            return Err(IscsiError::violation(
                "LoginResponse.Flags reserved bits 4-5 must be zero",
            ));
        }
        let transit = flags & 0x80 != 0;
        let current_stage = LoginStage::from_u8((flags >> 2) & 0x03)?;
        let next_stage = if transit {
            LoginStage::from_u8(flags & 0x03)?
        } else {
            current_stage
        };

        reserved_range("LoginResponse.Reserved1", &buf[20..24])?;
        reserved_range("LoginResponse.Reserved2", &buf[38..48])?;

        Ok(LoginResponseParser {
            transit,
            continue_flag: flags & 0x40 != 0,
            current_stage,
            next_stage,
            version_max: buf[2],
            version_active: buf[3],
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            status_class: LoginStatusClass::from_u8(buf[36])?,
            status_detail: buf[37],
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        let mut flags = ((self.current_stage as u8) << 2) | (self.next_stage as u8 & 0x03);
        if self.transit {
            flags |= 0x80;
        }
        if self.continue_flag {
            flags |= 0x40;
        }
        out[1] = flags;
        out[2] = self.version_max;
        out[3] = self.version_active;
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        out[36] = self.status_class as u8;
        out[37] = self.status_detail;
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.transit && self.continue_flag {
            return Err(IscsiError::violation(
                "LoginResponse Transit and Continue flags are mutually exclusive",
            ));
        }
        if self.transit
            && self.status_class == LoginStatusClass::Success
            && self.next_stage <= self.current_stage
        {
            return Err(IscsiError::violation(
                "LoginResponse NSG must name a later stage than CSG",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{DataSegment, PduParser, PduSettings, ProtocolDataUnit};

    fn login_request() -> ProtocolDataUnit {
        let isid = Isid([0x40, 0x00, 0x01, 0x23, 0x45, 0x67]);
        ProtocolDataUnit::new(PduParser::LoginRequest(LoginRequestParser {
            transit: true,
            continue_flag: false,
            current_stage: LoginStage::OperationalNegotiation,
            next_stage: LoginStage::FullFeaturePhase,
            version_max: VERSION,
            version_min: VERSION,
            cid: 1,
            cmd_sn: 0,
            exp_stat_sn: 0,
        }))
        .immediate()
        .with_lun(isid.to_lun_field(0))
        .with_itt(0xABCD_0001)
        .with_data(DataSegment::text_pairs(&[(
            "InitiatorName".to_string(),
            "iqn.2005-03.org.example:host1".to_string(),
        )]))
    }

    #[test]
    fn test_roundtrip() {
        let settings = PduSettings::default();
        let pdu = login_request();
        let bytes = pdu.serialize(&settings);
        let parsed = ProtocolDataUnit::parse(&bytes, &settings).unwrap();
        assert_eq!(parsed, pdu);

        let (isid, tsih) = Isid::from_lun_field(parsed.bhs.lun);
        assert_eq!(isid.0, [0x40, 0x00, 0x01, 0x23, 0x45, 0x67]);
        assert_eq!(tsih, 0);
    }

    #[test]
    fn test_transit_continue_mutually_exclusive() {
        let settings = PduSettings::default();
        let mut bytes = login_request().serialize(&settings);
        bytes[1] |= 0x40; // set Continue alongside Transit
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_csg_full_feature_rejected() {
        let settings = PduSettings::default();
        let mut bytes = login_request().serialize(&settings);
        bytes[1] = 0x8F; // T=1, CSG=3, NSG=3
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_reserved_field_rejected() {
        let settings = PduSettings::default();
        let mut bytes = login_request().serialize(&settings);
        bytes[40] = 0x01; // reserved range of the login request
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_isid_lun_field_roundtrip() {
        let isid = Isid::random();
        let (decoded, tsih) = Isid::from_lun_field(isid.to_lun_field(0x1234));
        assert_eq!(decoded, isid);
        assert_eq!(tsih, 0x1234);
    }
}
