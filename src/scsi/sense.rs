//! Fixed-format sense data (SPC-3 Section 4.5)
//!
//! When a command fails with CHECK CONDITION, the target describes the
//! failure with a sense key plus the additional sense code / qualifier pair.
//! Only the 18-byte fixed format (response code 0x70, current errors) is
//! generated.

/// Sense keys (SPC-3 Table 27)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    AbortedCommand = 0xB,
}

/// Additional sense code / qualifier pairs used by this target
pub mod additional_sense {
    /// (ASC, ASCQ)
    pub const NO_ADDITIONAL_SENSE: (u8, u8) = (0x00, 0x00);
    pub const INVALID_COMMAND_OPERATION_CODE: (u8, u8) = (0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: (u8, u8) = (0x24, 0x00);
    pub const LOGICAL_UNIT_NOT_SUPPORTED: (u8, u8) = (0x25, 0x00);
    pub const INVALID_FIELD_IN_PARAMETER_LIST: (u8, u8) = (0x26, 0x00);
    pub const INTERNAL_TARGET_FAILURE: (u8, u8) = (0x44, 0x00);
}

/// Fixed sense data size on the wire.
pub const SENSE_DATA_SIZE: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn new(key: SenseKey, (asc, ascq): (u8, u8)) -> Self {
        SenseData { key, asc, ascq }
    }

    pub fn invalid_command_operation_code() -> Self {
        SenseData::new(
            SenseKey::IllegalRequest,
            additional_sense::INVALID_COMMAND_OPERATION_CODE,
        )
    }

    pub fn invalid_field_in_cdb() -> Self {
        SenseData::new(SenseKey::IllegalRequest, additional_sense::INVALID_FIELD_IN_CDB)
    }

    pub fn lba_out_of_range() -> Self {
        SenseData::new(SenseKey::IllegalRequest, additional_sense::LBA_OUT_OF_RANGE)
    }

    pub fn logical_unit_not_supported() -> Self {
        SenseData::new(
            SenseKey::IllegalRequest,
            additional_sense::LOGICAL_UNIT_NOT_SUPPORTED,
        )
    }

    pub fn internal_target_failure() -> Self {
        SenseData::new(
            SenseKey::HardwareError,
            additional_sense::INTERNAL_TARGET_FAILURE,
        )
    }

    /// Serializes to the 18-byte fixed format, response code 0x70.
    pub fn to_bytes(&self) -> [u8; SENSE_DATA_SIZE] {
        let mut bytes = [0u8; SENSE_DATA_SIZE];
        bytes[0] = 0x70; // current errors, fixed format
        bytes[2] = self.key as u8;
        bytes[7] = (SENSE_DATA_SIZE - 8) as u8; // additional sense length
        bytes[12] = self.asc;
        bytes[13] = self.ascq;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_format_layout() {
        let bytes = SenseData::lba_out_of_range().to_bytes();
        assert_eq!(bytes.len(), SENSE_DATA_SIZE);
        assert_eq!(bytes[0], 0x70);
        assert_eq!(bytes[2], SenseKey::IllegalRequest as u8);
        assert_eq!(bytes[7], 10);
        assert_eq!(bytes[12], 0x21);
        assert_eq!(bytes[13], 0x00);
        // Everything else stays zero.
        assert!(bytes[14..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_constructors() {
        let sense = SenseData::logical_unit_not_supported();
        assert_eq!(sense.key, SenseKey::IllegalRequest);
        assert_eq!((sense.asc, sense.ascq), (0x25, 0x00));

        let sense = SenseData::internal_target_failure();
        assert_eq!(sense.key, SenseKey::HardwareError);
    }
}
