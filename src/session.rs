//! Session state and text key negotiation
//!
//! A session is identified by the initiator's ISID plus the target-assigned
//! TSIH and spans one or more connections. It owns the command numbering
//! window (ExpCmdSN/MaxCmdSN) and the operational parameters agreed during
//! login.
//!
//! Each negotiable key has a fixed result function from RFC 3720 Section 12:
//! numeric keys resolve to the minimum or maximum of both offers, boolean
//! keys to AND or OR, and list-valued keys (the digests) to the first offered
//! alternative the target supports.

use std::cmp::Ordering;

use crate::digest::DigestType;
use crate::error::{IscsiError, Result};
use crate::pdu::Isid;
use crate::serial::SerialNumber;

/// Commands the initiator may have in flight beyond ExpCmdSN.
pub const DEFAULT_COMMAND_WINDOW: u32 = 32;

/// Operational parameters for one session, initialized to the RFC 3720
/// defaults and updated by [`SessionParams::negotiate`].
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub initiator_name: Option<String>,
    pub target_name: Option<String>,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
    /// The peer's receive limit; caps our outgoing data segments.
    pub peer_max_recv_data_segment_length: u32,
    /// Our receive limit; we announce it and enforce it on parse.
    pub max_recv_data_segment_length: u32,
    pub max_connections: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time_2_wait: u32,
    pub default_time_2_retain: u32,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            initiator_name: None,
            target_name: None,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            peer_max_recv_data_segment_length: 8192,
            max_recv_data_segment_length: 8192,
            max_connections: 1,
            initial_r2t: true,
            immediate_data: true,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
            default_time_2_wait: 2,
            default_time_2_retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        IscsiError::violation(format!("key {} expects a number, got {:?}", key, value))
    })
}

fn parse_boolean(key: &str, value: &str) -> Result<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(IscsiError::violation(format!(
            "key {} expects Yes or No, got {:?}",
            key, other
        ))),
    }
}

fn boolean_text(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

impl SessionParams {
    /// Applies one offered `key=value` and returns the value to answer with.
    ///
    /// Unknown keys are not an error; RFC 3720 requires answering them with
    /// `NotUnderstood` so the rest of the negotiation can proceed.
    pub fn negotiate(&mut self, key: &str, offered: &str) -> Result<String> {
        match key {
            "InitiatorName" => {
                self.initiator_name = Some(offered.to_string());
                // Declarative, echoed without a value change.
                Ok(offered.to_string())
            }
            "TargetName" => {
                self.target_name = Some(offered.to_string());
                Ok(offered.to_string())
            }
            "SessionType" => match offered {
                "Normal" | "Discovery" => Ok(offered.to_string()),
                other => Err(IscsiError::violation(format!(
                    "invalid SessionType {:?}",
                    other
                ))),
            },
            // List-valued: take the first offered alternative we support.
            "HeaderDigest" => {
                self.header_digest = DigestType::from_text(offered);
                Ok(self.header_digest.as_text().to_string())
            }
            "DataDigest" => {
                self.data_digest = DigestType::from_text(offered);
                Ok(self.data_digest.as_text().to_string())
            }
            // Declarative per direction: the peer announces its own limit.
            "MaxRecvDataSegmentLength" => {
                self.peer_max_recv_data_segment_length = parse_number(key, offered)?;
                Ok(self.max_recv_data_segment_length.to_string())
            }
            // Min result function.
            "MaxConnections" => {
                self.max_connections = self.max_connections.min(parse_number(key, offered)?);
                Ok(self.max_connections.to_string())
            }
            "MaxBurstLength" => {
                self.max_burst_length = self.max_burst_length.min(parse_number(key, offered)?);
                Ok(self.max_burst_length.to_string())
            }
            "FirstBurstLength" => {
                self.first_burst_length =
                    self.first_burst_length.min(parse_number(key, offered)?);
                Ok(self.first_burst_length.to_string())
            }
            "MaxOutstandingR2T" => {
                self.max_outstanding_r2t =
                    self.max_outstanding_r2t.min(parse_number(key, offered)?);
                Ok(self.max_outstanding_r2t.to_string())
            }
            "DefaultTime2Retain" => {
                self.default_time_2_retain =
                    self.default_time_2_retain.min(parse_number(key, offered)?);
                Ok(self.default_time_2_retain.to_string())
            }
            "ErrorRecoveryLevel" => {
                self.error_recovery_level =
                    self.error_recovery_level.min(parse_number(key, offered)?);
                Ok(self.error_recovery_level.to_string())
            }
            // Max result function.
            "DefaultTime2Wait" => {
                self.default_time_2_wait =
                    self.default_time_2_wait.max(parse_number(key, offered)?);
                Ok(self.default_time_2_wait.to_string())
            }
            // OR result function.
            "InitialR2T" => {
                self.initial_r2t = self.initial_r2t || parse_boolean(key, offered)?;
                Ok(boolean_text(self.initial_r2t))
            }
            // AND result function.
            "ImmediateData" => {
                self.immediate_data = self.immediate_data && parse_boolean(key, offered)?;
                Ok(boolean_text(self.immediate_data))
            }
            "DataPDUInOrder" => {
                self.data_pdu_in_order = self.data_pdu_in_order || parse_boolean(key, offered)?;
                Ok(boolean_text(self.data_pdu_in_order))
            }
            "DataSequenceInOrder" => {
                self.data_sequence_in_order =
                    self.data_sequence_in_order || parse_boolean(key, offered)?;
                Ok(boolean_text(self.data_sequence_in_order))
            }
            _ => {
                log::debug!("negotiation key {} not understood", key);
                Ok("NotUnderstood".to_string())
            }
        }
    }
}

/// How an incoming command's CmdSN relates to the session window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnDisposition {
    /// Immediate delivery; does not consume a window slot.
    Immediate,
    /// The expected next command; the window advanced.
    Expected,
    /// In-window but ahead of ExpCmdSN; deliverable once the gap fills.
    Queued,
}

/// One iSCSI session: the ISID/TSIH pair, negotiated parameters and the
/// command numbering window shared by all its connections.
#[derive(Debug)]
pub struct Session {
    pub isid: Isid,
    pub tsih: u16,
    pub params: SessionParams,
    exp_cmd_sn: SerialNumber,
    command_window: u32,
}

impl Session {
    pub fn new(isid: Isid, tsih: u16) -> Self {
        Session {
            isid,
            tsih,
            params: SessionParams::default(),
            exp_cmd_sn: SerialNumber(0),
            command_window: DEFAULT_COMMAND_WINDOW,
        }
    }

    /// Seeds ExpCmdSN from the first login request's CmdSN.
    pub fn seed_cmd_sn(&mut self, cmd_sn: u32) {
        self.exp_cmd_sn = SerialNumber(cmd_sn);
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn.value()
    }

    /// Upper edge of the command window, advertised as MaxCmdSN.
    pub fn max_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn
            .value()
            .wrapping_add(self.command_window)
            .wrapping_sub(1)
    }

    /// Validates an arriving command's CmdSN against the window.
    ///
    /// Immediate commands carry the current CmdSN without consuming it. A
    /// non-immediate command outside `[ExpCmdSN, MaxCmdSN]` is a protocol
    /// violation.
    pub fn accept_cmd_sn(&mut self, cmd_sn: u32, immediate: bool) -> Result<CmdSnDisposition> {
        let sn = SerialNumber(cmd_sn);
        if immediate {
            // Stale or future CmdSN on an immediate command is still checked
            // against the window so a broken initiator is caught early.
            if !sn.in_window(self.exp_cmd_sn.value(), self.max_cmd_sn()) {
                return Err(IscsiError::violation(format!(
                    "immediate command CmdSN {} outside window [{}, {}]",
                    cmd_sn,
                    self.exp_cmd_sn.value(),
                    self.max_cmd_sn()
                )));
            }
            return Ok(CmdSnDisposition::Immediate);
        }
        if !sn.in_window(self.exp_cmd_sn.value(), self.max_cmd_sn()) {
            return Err(IscsiError::violation(format!(
                "CmdSN {} outside window [{}, {}]",
                cmd_sn,
                self.exp_cmd_sn.value(),
                self.max_cmd_sn()
            )));
        }
        if sn.compare(self.exp_cmd_sn.value()) == Ordering::Equal {
            self.exp_cmd_sn.increment();
            Ok(CmdSnDisposition::Expected)
        } else {
            Ok(CmdSnDisposition::Queued)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_result_function() {
        let mut params = SessionParams::default();
        let answer = params.negotiate("MaxBurstLength", "1048576").unwrap();
        assert_eq!(answer, "262144"); // our default is smaller
        let answer = params.negotiate("MaxBurstLength", "65536").unwrap();
        assert_eq!(answer, "65536");
        assert_eq!(params.max_burst_length, 65536);
    }

    #[test]
    fn test_max_result_function() {
        let mut params = SessionParams::default();
        let answer = params.negotiate("DefaultTime2Wait", "5").unwrap();
        assert_eq!(answer, "5");
        assert_eq!(params.default_time_2_wait, 5);
    }

    #[test]
    fn test_boolean_result_functions() {
        let mut params = SessionParams::default();
        // InitialR2T uses OR: our default Yes wins.
        assert_eq!(params.negotiate("InitialR2T", "No").unwrap(), "Yes");
        // ImmediateData uses AND: a No from either side sticks.
        assert_eq!(params.negotiate("ImmediateData", "No").unwrap(), "No");
        assert!(!params.immediate_data);
    }

    #[test]
    fn test_digest_list_selection() {
        let mut params = SessionParams::default();
        let answer = params.negotiate("HeaderDigest", "CRC32C,None").unwrap();
        assert_eq!(answer, "CRC32C");
        assert_eq!(params.header_digest, DigestType::Crc32c);
    }

    #[test]
    fn test_unknown_key_not_understood() {
        let mut params = SessionParams::default();
        let answer = params.negotiate("X-com.example.custom", "5").unwrap();
        assert_eq!(answer, "NotUnderstood");
    }

    #[test]
    fn test_bad_number_rejected() {
        let mut params = SessionParams::default();
        assert!(params.negotiate("MaxBurstLength", "lots").is_err());
        assert!(params.negotiate("ImmediateData", "Maybe").is_err());
    }

    #[test]
    fn test_cmd_sn_window() {
        let mut session = Session::new(Isid::default(), 1);
        session.seed_cmd_sn(10);

        assert_eq!(
            session.accept_cmd_sn(10, false).unwrap(),
            CmdSnDisposition::Expected
        );
        assert_eq!(session.exp_cmd_sn(), 11);

        // In-window but ahead.
        assert_eq!(
            session.accept_cmd_sn(13, false).unwrap(),
            CmdSnDisposition::Queued
        );
        assert_eq!(session.exp_cmd_sn(), 11);

        // Behind the window.
        assert!(session.accept_cmd_sn(9, false).is_err());
        // Beyond MaxCmdSN.
        assert!(session
            .accept_cmd_sn(session.max_cmd_sn().wrapping_add(1), false)
            .is_err());
    }

    #[test]
    fn test_immediate_does_not_advance() {
        let mut session = Session::new(Isid::default(), 1);
        session.seed_cmd_sn(5);
        assert_eq!(
            session.accept_cmd_sn(5, true).unwrap(),
            CmdSnDisposition::Immediate
        );
        assert_eq!(session.exp_cmd_sn(), 5);
    }

    #[test]
    fn test_window_across_wrap() {
        let mut session = Session::new(Isid::default(), 1);
        session.seed_cmd_sn(0xFFFF_FFFF);
        assert_eq!(
            session.accept_cmd_sn(0xFFFF_FFFF, false).unwrap(),
            CmdSnDisposition::Expected
        );
        assert_eq!(session.exp_cmd_sn(), 0);
        assert_eq!(
            session.accept_cmd_sn(0, false).unwrap(),
            CmdSnDisposition::Expected
        );
    }
}
