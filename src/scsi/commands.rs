//! Execution of decoded CDBs against a block device

use byteorder::{BigEndian, ByteOrder};

use crate::scsi::cdb::Cdb;
use crate::scsi::sense::{SenseData, SenseKey, additional_sense};
use crate::scsi::BlockDevice;

/// Standard INQUIRY data length we report.
const INQUIRY_DATA_LEN: usize = 36;

/// What running a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// GOOD status. `data` flows back to the initiator, cropped to
    /// `allocation_length` when the CDB carried one.
    Good {
        data: Vec<u8>,
        allocation_length: Option<usize>,
    },
    /// CHECK CONDITION with the given sense data.
    CheckCondition(SenseData),
}

impl CommandOutcome {
    fn good() -> Self {
        CommandOutcome::Good {
            data: Vec::new(),
            allocation_length: None,
        }
    }
}

/// Runs one decoded command against `device`. `write_data` is the assembled
/// Data-Out payload and is only consulted by write commands.
pub fn execute(device: &dyn BlockDevice, cdb: &Cdb, write_data: &[u8]) -> CommandOutcome {
    match cdb {
        Cdb::TestUnitReady => CommandOutcome::good(),

        Cdb::RequestSense { allocation_length } => {
            // Sense is autosensed through the response PDU, so there is
            // never a pending unit condition to report here.
            let sense = SenseData::new(SenseKey::NoSense, additional_sense::NO_ADDITIONAL_SENSE);
            CommandOutcome::Good {
                data: sense.to_bytes().to_vec(),
                allocation_length: Some(*allocation_length),
            }
        }

        Cdb::FormatUnit => CommandOutcome::good(),

        Cdb::SendDiagnostic { self_test: _ } => CommandOutcome::good(),

        Cdb::Inquiry {
            evpd,
            page_code,
            allocation_length,
        } => {
            let data = if *evpd {
                match vital_product_page(*page_code) {
                    Some(page) => page,
                    None => return CommandOutcome::CheckCondition(SenseData::invalid_field_in_cdb()),
                }
            } else {
                standard_inquiry_data()
            };
            CommandOutcome::Good {
                data,
                allocation_length: Some(*allocation_length),
            }
        }

        Cdb::ModeSense6 { allocation_length } => CommandOutcome::Good {
            // Minimal header: no block descriptors, no pages.
            data: vec![3, 0, 0, 0],
            allocation_length: Some(*allocation_length),
        },

        Cdb::ReadCapacity10 => {
            let last_lba = device.block_count().saturating_sub(1).min(u32::MAX as u64) as u32;
            let mut data = vec![0u8; 8];
            BigEndian::write_u32(&mut data[0..4], last_lba);
            BigEndian::write_u32(&mut data[4..8], device.block_size());
            CommandOutcome::Good {
                data,
                allocation_length: None,
            }
        }

        Cdb::Read {
            lba,
            transfer_blocks,
        } => {
            if let Err(sense) = check_bounds(device, *lba, *transfer_blocks) {
                return CommandOutcome::CheckCondition(sense);
            }
            match device.read_blocks(*lba, *transfer_blocks) {
                Ok(data) => CommandOutcome::Good {
                    data,
                    allocation_length: None,
                },
                Err(err) => {
                    log::error!("device read failed at lba {}: {}", lba, err);
                    CommandOutcome::CheckCondition(SenseData::internal_target_failure())
                }
            }
        }

        Cdb::Write {
            lba,
            transfer_blocks,
        } => {
            if let Err(sense) = check_bounds(device, *lba, *transfer_blocks) {
                return CommandOutcome::CheckCondition(sense);
            }
            let expected = *transfer_blocks as usize * device.block_size() as usize;
            if write_data.len() != expected {
                log::warn!(
                    "write payload {} bytes, CDB names {} bytes",
                    write_data.len(),
                    expected
                );
                return CommandOutcome::CheckCondition(SenseData::new(
                    SenseKey::IllegalRequest,
                    additional_sense::INVALID_FIELD_IN_PARAMETER_LIST,
                ));
            }
            match device.write_blocks(*lba, write_data) {
                Ok(()) => CommandOutcome::good(),
                Err(err) => {
                    log::error!("device write failed at lba {}: {}", lba, err);
                    CommandOutcome::CheckCondition(SenseData::internal_target_failure())
                }
            }
        }

        Cdb::Verify {
            lba,
            transfer_blocks,
        } => {
            if let Err(sense) = check_bounds(device, *lba, *transfer_blocks) {
                return CommandOutcome::CheckCondition(sense);
            }
            CommandOutcome::good()
        }

        Cdb::SynchronizeCache => match device.sync() {
            Ok(()) => CommandOutcome::good(),
            Err(err) => {
                log::error!("device sync failed: {}", err);
                CommandOutcome::CheckCondition(SenseData::internal_target_failure())
            }
        },

        Cdb::ReportLuns { allocation_length } => {
            // A logical unit only knows itself; the router substitutes the
            // full list before execution, so reaching this arm means a
            // single-LU answer is wanted.
            CommandOutcome::Good {
                data: report_luns_data(&[0]),
                allocation_length: Some(*allocation_length),
            }
        }
    }
}

fn check_bounds(device: &dyn BlockDevice, lba: u64, blocks: u32) -> Result<(), SenseData> {
    let end = lba.checked_add(blocks as u64);
    match end {
        Some(end) if end <= device.block_count() => Ok(()),
        _ => Err(SenseData::lba_out_of_range()),
    }
}

fn standard_inquiry_data() -> Vec<u8> {
    let mut data = vec![0u8; INQUIRY_DATA_LEN];
    data[0] = 0x00; // direct-access block device
    data[2] = 0x05; // SPC-3
    data[3] = 0x02; // response data format
    data[4] = (INQUIRY_DATA_LEN - 5) as u8;
    data[8..16].copy_from_slice(b"ISCSIRS "); // T10 vendor id
    data[16..32].copy_from_slice(b"VIRTUAL BLOCK   ");
    data[32..36].copy_from_slice(b"0001");
    data
}

fn vital_product_page(page_code: u8) -> Option<Vec<u8>> {
    match page_code {
        // Supported VPD pages: just this one.
        0x00 => Some(vec![0x00, 0x00, 0x00, 0x01, 0x00]),
        _ => None,
    }
}

/// REPORT LUNS parameter data: 4-byte list length, 4 reserved bytes, one
/// 8-byte entry per LUN.
pub fn report_luns_data(luns: &[u64]) -> Vec<u8> {
    let mut data = vec![0u8; 8 + luns.len() * 8];
    BigEndian::write_u32(&mut data[0..4], (luns.len() * 8) as u32);
    for (i, lun) in luns.iter().enumerate() {
        BigEndian::write_u64(&mut data[8 + i * 8..16 + i * 8], *lun);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::MemoryBlockDevice;

    fn device() -> MemoryBlockDevice {
        MemoryBlockDevice::new(512, 64)
    }

    #[test]
    fn test_test_unit_ready() {
        let outcome = execute(&device(), &Cdb::TestUnitReady, &[]);
        assert_eq!(outcome, CommandOutcome::good());
    }

    #[test]
    fn test_read_capacity() {
        let outcome = execute(&device(), &Cdb::ReadCapacity10, &[]);
        match outcome {
            CommandOutcome::Good { data, .. } => {
                assert_eq!(BigEndian::read_u32(&data[0..4]), 63); // last LBA
                assert_eq!(BigEndian::read_u32(&data[4..8]), 512);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dev = device();
        let payload = vec![0x42u8; 1024];
        let outcome = execute(
            &dev,
            &Cdb::Write {
                lba: 4,
                transfer_blocks: 2,
            },
            &payload,
        );
        assert_eq!(outcome, CommandOutcome::good());

        let outcome = execute(
            &dev,
            &Cdb::Read {
                lba: 4,
                transfer_blocks: 2,
            },
            &[],
        );
        match outcome {
            CommandOutcome::Good { data, .. } => assert_eq!(data, payload),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_read_out_of_range() {
        let outcome = execute(
            &device(),
            &Cdb::Read {
                lba: 63,
                transfer_blocks: 2,
            },
            &[],
        );
        assert_eq!(
            outcome,
            CommandOutcome::CheckCondition(SenseData::lba_out_of_range())
        );
    }

    #[test]
    fn test_write_payload_length_mismatch() {
        let outcome = execute(
            &device(),
            &Cdb::Write {
                lba: 0,
                transfer_blocks: 2,
            },
            &[0u8; 512], // CDB names 1024
        );
        assert!(matches!(outcome, CommandOutcome::CheckCondition(_)));
    }

    #[test]
    fn test_inquiry_sizes() {
        let outcome = execute(
            &device(),
            &Cdb::Inquiry {
                evpd: false,
                page_code: 0,
                allocation_length: 36,
            },
            &[],
        );
        match outcome {
            CommandOutcome::Good {
                data,
                allocation_length,
            } => {
                assert_eq!(data.len(), INQUIRY_DATA_LEN);
                assert_eq!(allocation_length, Some(36));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_report_luns_layout() {
        let data = report_luns_data(&[0, 1 << 48]);
        assert_eq!(data.len(), 24);
        assert_eq!(BigEndian::read_u32(&data[0..4]), 16);
        assert_eq!(BigEndian::read_u64(&data[8..16]), 0);
        assert_eq!(BigEndian::read_u64(&data[16..24]), 1 << 48);
    }
}
