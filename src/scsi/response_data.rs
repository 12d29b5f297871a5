//! The data segment of a SCSI Response PDU
//!
//! A failed command's response carries sense data, prefixed with a 2-byte
//! big-endian length, optionally followed by command response data. The
//! initiator bounds what it will accept with the CDB's allocation length;
//! anything beyond it is silently cropped and reported through the residual
//! fields rather than treated as an error.

use byteorder::{BigEndian, ByteOrder};

use crate::scsi::sense::{SenseData, SENSE_DATA_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScsiResponseDataSegment {
    sense: Option<SenseData>,
    response_data: Vec<u8>,
    allocation_length: usize,
    /// Size before cropping, cached because residual accessors and
    /// serialization both need it.
    uncropped_size: usize,
}

impl ScsiResponseDataSegment {
    pub fn sense_only(sense: SenseData, allocation_length: usize) -> Self {
        ScsiResponseDataSegment {
            sense: Some(sense),
            response_data: Vec::new(),
            allocation_length,
            uncropped_size: 2 + SENSE_DATA_SIZE,
        }
    }

    pub fn data_only(response_data: Vec<u8>, allocation_length: usize) -> Self {
        let uncropped_size = response_data.len();
        ScsiResponseDataSegment {
            sense: None,
            response_data,
            allocation_length,
            uncropped_size,
        }
    }

    pub fn sense(&self) -> Option<&SenseData> {
        self.sense.as_ref()
    }

    /// Size of the segment before allocation-length cropping.
    pub fn uncropped_size(&self) -> usize {
        self.uncropped_size
    }

    /// Size the segment actually occupies on the wire.
    pub fn cropped_size(&self) -> usize {
        self.uncropped_size.min(self.allocation_length)
    }

    /// True if the segment did not fit the initiator's buffer.
    pub fn residual_overflow(&self) -> bool {
        self.uncropped_size > self.allocation_length
    }

    /// True if the segment left part of the buffer unused.
    pub fn residual_underflow(&self) -> bool {
        self.uncropped_size < self.allocation_length
    }

    /// Number of bytes cropped (overflow) or left unused (underflow).
    pub fn residual_count(&self) -> u32 {
        self.allocation_length.abs_diff(self.uncropped_size) as u32
    }

    /// Serializes the segment, cropped to the allocation length.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.cropped_size());
        if let Some(sense) = &self.sense {
            let sense_bytes = sense.to_bytes();
            let mut prefix = [0u8; 2];
            BigEndian::write_u16(&mut prefix, sense_bytes.len() as u16);
            out.extend_from_slice(&prefix);
            out.extend_from_slice(&sense_bytes);
        }
        out.extend_from_slice(&self.response_data);
        out.truncate(self.allocation_length);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sense_segment_layout() {
        let segment =
            ScsiResponseDataSegment::sense_only(SenseData::invalid_field_in_cdb(), 255);
        let bytes = segment.serialize();
        assert_eq!(bytes.len(), 2 + SENSE_DATA_SIZE);
        assert_eq!(BigEndian::read_u16(&bytes[0..2]) as usize, SENSE_DATA_SIZE);
        assert_eq!(bytes[2], 0x70);
        assert!(segment.residual_underflow());
        assert_eq!(segment.residual_count(), 255 - 20);
    }

    #[test]
    fn test_cropping_is_silent() {
        let segment = ScsiResponseDataSegment::data_only(vec![0xAB; 100], 64);
        let bytes = segment.serialize();
        assert_eq!(bytes.len(), 64);
        assert!(segment.residual_overflow());
        assert_eq!(segment.residual_count(), 36);
        assert_eq!(segment.uncropped_size(), 100);
        assert_eq!(segment.cropped_size(), 64);
    }

    #[test]
    fn test_exact_fit_has_no_residual() {
        let segment = ScsiResponseDataSegment::data_only(vec![0u8; 64], 64);
        assert!(!segment.residual_overflow());
        assert!(!segment.residual_underflow());
        assert_eq!(segment.residual_count(), 0);
    }

    #[test]
    fn test_empty_segment() {
        let segment = ScsiResponseDataSegment::default();
        assert!(segment.serialize().is_empty());
        assert_eq!(segment.uncropped_size(), 0);
    }
}
