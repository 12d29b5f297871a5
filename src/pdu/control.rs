//! Control-plane PDU parsing: Logout, SNACK, Async Message, Reject and Task
//! Management (RFC 3720 Sections 10.5, 10.6, 10.14-10.17)

use byteorder::{BigEndian, ByteOrder};

use crate::codec;
use crate::error::{IscsiError, Result};
use crate::pdu::{read_word, reserved_range, write_word, BHS_SIZE, RESERVED_TAG};

/// Logout reason codes (low 7 bits of byte 1 of a Logout Request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogoutReason {
    CloseSession = 0,
    CloseConnection = 1,
    RemoveConnectionForRecovery = 2,
}

impl LogoutReason {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogoutReason::CloseSession),
            1 => Ok(LogoutReason::CloseConnection),
            2 => Ok(LogoutReason::RemoveConnectionForRecovery),
            other => Err(IscsiError::violation(format!(
                "invalid logout reason {}",
                other
            ))),
        }
    }
}

/// Logout response codes (byte 2 of a Logout Response).
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequestParser {
    pub reason: LogoutReason,
    /// Connection being closed; ignored for `CloseSession`.
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl LogoutRequestParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] & 0x80 == 0 {
            return Err(IscsiError::violation(
                "LogoutRequest.Flags bit 7 must be one",
            ));
        }
        reserved_range("LogoutRequest.Reserved1", &buf[2..4])?;
        reserved_range("LogoutRequest.Reserved2", &buf[8..16])?;
        reserved_range("LogoutRequest.Reserved3", &buf[22..24])?;
        reserved_range("LogoutRequest.Reserved4", &buf[32..48])?;

        Ok(LogoutRequestParser {
            reason: LogoutReason::from_u8(buf[1] & 0x7F)?,
            cid: BigEndian::read_u16(&buf[20..22]),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80 | self.reason as u8;
        BigEndian::write_u16(&mut out[20..22], self.cid);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponseParser {
    pub response: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    /// Seconds the initiator must wait before reconnecting (RFC 3720
    /// DefaultTime2Wait).
    pub time_2_wait: u16,
    /// Seconds the target keeps connection state for recovery.
    pub time_2_retain: u16,
}

impl LogoutResponseParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation(
                "LogoutResponse.Flags must be exactly 0x80",
            ));
        }
        if buf[3] != 0 {
            return Err(IscsiError::violation(
                "LogoutResponse.Reserved byte 3 must be zero",
            ));
        }
        reserved_range("LogoutResponse.Reserved2", &buf[36..40])?;
        reserved_range("LogoutResponse.Reserved3", &buf[44..48])?;

        Ok(LogoutResponseParser {
            response: buf[2],
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            time_2_wait: BigEndian::read_u16(&buf[40..42]),
            time_2_retain: BigEndian::read_u16(&buf[42..44]),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        out[2] = self.response;
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        BigEndian::write_u16(&mut out[40..42], self.time_2_wait);
        BigEndian::write_u16(&mut out[42..44], self.time_2_retain);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.response > logout_response::CLEANUP_FAILED {
            return Err(IscsiError::violation(format!(
                "invalid logout response code {}",
                self.response
            )));
        }
        Ok(())
    }
}

/// SNACK types (low 4 bits of byte 1 of a SNACK Request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnackType {
    DataR2t = 0,
    Status = 1,
    DataAck = 2,
    RData = 3,
}

impl SnackType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SnackType::DataR2t),
            1 => Ok(SnackType::Status),
            2 => Ok(SnackType::DataAck),
            3 => Ok(SnackType::RData),
            other => Err(IscsiError::violation(format!(
                "invalid SNACK type {}",
                other
            ))),
        }
    }
}

/// SNACK Request. Parsed for wire completeness; at ErrorRecoveryLevel 0 the
/// connection layer answers every SNACK with a Reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnackRequestParser {
    pub snack_type: SnackType,
    pub target_transfer_tag: u32,
    pub exp_stat_sn: u32,
    pub beg_run: u32,
    pub run_length: u32,
}

impl SnackRequestParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] & 0x80 == 0 {
            return Err(IscsiError::violation(
                "SnackRequest.Flags bit 7 must be one",
            ));
        }
        if buf[1] & 0x70 != 0 {
            return Err(IscsiError::violation(
                "SnackRequest.Flags reserved bits 4-6 must be zero",
            ));
        }
        reserved_range("SnackRequest.Reserved1", &buf[2..4])?;
        reserved_range("SnackRequest.Reserved2", &buf[24..28])?;
        reserved_range("SnackRequest.Reserved3", &buf[32..40])?;

        Ok(SnackRequestParser {
            snack_type: SnackType::from_u8(buf[1] & 0x0F)?,
            target_transfer_tag: read_word(buf, 20),
            exp_stat_sn: read_word(buf, 28),
            beg_run: read_word(buf, 40),
            run_length: read_word(buf, 44),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80 | self.snack_type as u8;
        write_word(out, 20, self.target_transfer_tag);
        write_word(out, 28, self.exp_stat_sn);
        write_word(out, 40, self.beg_run);
        write_word(out, 44, self.run_length);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

/// Async event codes (byte 36 of an Async Message).
pub mod async_event {
    pub const SCSI_ASYNC_EVENT: u8 = 0;
    pub const LOGOUT_REQUESTED: u8 = 1;
    pub const CONNECTION_DROPPING: u8 = 2;
    pub const SESSION_DROPPING: u8 = 3;
    pub const PARAMETER_RENEGOTIATION: u8 = 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncMessageParser {
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub event: u8,
    pub vendor_code: u8,
    pub parameter1: u16,
    pub parameter2: u16,
    pub parameter3: u16,
}

impl AsyncMessageParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation(
                "AsyncMessage.Flags must be exactly 0x80",
            ));
        }
        reserved_range("AsyncMessage.Reserved1", &buf[2..4])?;
        // Async messages are not tied to a task.
        codec::is_expected(
            "AsyncMessage.InitiatorTaskTag",
            read_word(buf, 16),
            RESERVED_TAG,
        )?;
        reserved_range("AsyncMessage.Reserved2", &buf[20..24])?;
        reserved_range("AsyncMessage.Reserved3", &buf[44..48])?;

        Ok(AsyncMessageParser {
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            event: buf[36],
            vendor_code: buf[37],
            parameter1: BigEndian::read_u16(&buf[38..40]),
            parameter2: BigEndian::read_u16(&buf[40..42]),
            parameter3: BigEndian::read_u16(&buf[42..44]),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        out[36] = self.event;
        out[37] = self.vendor_code;
        BigEndian::write_u16(&mut out[38..40], self.parameter1);
        BigEndian::write_u16(&mut out[40..42], self.parameter2);
        BigEndian::write_u16(&mut out[42..44], self.parameter3);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        if self.event > async_event::PARAMETER_RENEGOTIATION {
            return Err(IscsiError::violation(format!(
                "invalid async event code {}",
                self.event
            )));
        }
        Ok(())
    }
}

/// Reject reason codes (byte 2 of a Reject PDU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    DataDigestError = 0x02,
    SnackReject = 0x03,
    ProtocolError = 0x04,
    CommandNotSupported = 0x05,
    ImmediateCommandReject = 0x06,
    TaskInProgress = 0x07,
    InvalidDataAck = 0x08,
    InvalidPduField = 0x09,
    LongOperationReject = 0x0A,
    NegotiationReset = 0x0B,
    WaitingForLogout = 0x0C,
}

impl RejectReason {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(RejectReason::DataDigestError),
            0x03 => Ok(RejectReason::SnackReject),
            0x04 => Ok(RejectReason::ProtocolError),
            0x05 => Ok(RejectReason::CommandNotSupported),
            0x06 => Ok(RejectReason::ImmediateCommandReject),
            0x07 => Ok(RejectReason::TaskInProgress),
            0x08 => Ok(RejectReason::InvalidDataAck),
            0x09 => Ok(RejectReason::InvalidPduField),
            0x0A => Ok(RejectReason::LongOperationReject),
            0x0B => Ok(RejectReason::NegotiationReset),
            0x0C => Ok(RejectReason::WaitingForLogout),
            other => Err(IscsiError::violation(format!(
                "invalid reject reason 0x{:02x}",
                other
            ))),
        }
    }
}

/// Reject PDU. The data segment carries the header of the PDU being
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectParser {
    pub reason: RejectReason,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
}

impl RejectParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation("Reject.Flags must be exactly 0x80"));
        }
        if buf[3] != 0 {
            return Err(IscsiError::violation("Reject.Reserved byte 3 must be zero"));
        }
        codec::is_expected("Reject.InitiatorTaskTag", read_word(buf, 16), RESERVED_TAG)?;
        reserved_range("Reject.Reserved2", &buf[40..48])?;

        Ok(RejectParser {
            reason: RejectReason::from_u8(buf[2])?,
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
            data_sn: read_word(buf, 36),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        out[2] = self.reason as u8;
        write_word(out, 24, self.stat_sn);
        write_word(out, 28, self.exp_cmd_sn);
        write_word(out, 32, self.max_cmd_sn);
        write_word(out, 36, self.data_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

/// Task management functions (low 7 bits of byte 1 of a TMF Request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskManagementFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LogicalUnitReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    TaskReassign = 8,
}

impl TaskManagementFunction {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TaskManagementFunction::AbortTask),
            2 => Ok(TaskManagementFunction::AbortTaskSet),
            3 => Ok(TaskManagementFunction::ClearAca),
            4 => Ok(TaskManagementFunction::ClearTaskSet),
            5 => Ok(TaskManagementFunction::LogicalUnitReset),
            6 => Ok(TaskManagementFunction::TargetWarmReset),
            7 => Ok(TaskManagementFunction::TargetColdReset),
            8 => Ok(TaskManagementFunction::TaskReassign),
            other => Err(IscsiError::violation(format!(
                "invalid task management function {}",
                other
            ))),
        }
    }
}

/// Task management response codes (byte 2 of a TMF Response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmfResponse {
    FunctionComplete = 0,
    TaskDoesNotExist = 1,
    LunDoesNotExist = 2,
    TaskStillAllegiant = 3,
    ReassignNotSupported = 4,
    FunctionNotSupported = 5,
    AuthorizationFailed = 6,
    FunctionRejected = 255,
}

impl TmfResponse {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TmfResponse::FunctionComplete),
            1 => Ok(TmfResponse::TaskDoesNotExist),
            2 => Ok(TmfResponse::LunDoesNotExist),
            3 => Ok(TmfResponse::TaskStillAllegiant),
            4 => Ok(TmfResponse::ReassignNotSupported),
            5 => Ok(TmfResponse::FunctionNotSupported),
            6 => Ok(TmfResponse::AuthorizationFailed),
            255 => Ok(TmfResponse::FunctionRejected),
            other => Err(IscsiError::violation(format!(
                "invalid task management response {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskManagementRequestParser {
    pub function: TaskManagementFunction,
    /// ITT of the task being addressed; meaningful for ABORT TASK and TASK
    /// REASSIGN only.
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub ref_cmd_sn: u32,
    pub exp_data_sn: u32,
}

impl TaskManagementRequestParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] & 0x80 == 0 {
            return Err(IscsiError::violation(
                "TaskManagementRequest.Flags bit 7 must be one",
            ));
        }
        reserved_range("TaskManagementRequest.Reserved1", &buf[2..4])?;
        reserved_range("TaskManagementRequest.Reserved2", &buf[40..48])?;

        Ok(TaskManagementRequestParser {
            function: TaskManagementFunction::from_u8(buf[1] & 0x7F)?,
            referenced_task_tag: read_word(buf, 20),
            cmd_sn: read_word(buf, 24),
            exp_stat_sn: read_word(buf, 28),
            ref_cmd_sn: read_word(buf, 32),
            exp_data_sn: read_word(buf, 36),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80 | self.function as u8;
        write_word(out, 20, self.referenced_task_tag);
        write_word(out, 24, self.cmd_sn);
        write_word(out, 28, self.exp_stat_sn);
        write_word(out, 32, self.ref_cmd_sn);
        write_word(out, 36, self.exp_data_sn);
    }

    pub(crate) fn check_integrity(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskManagementResponseParser {
    pub response: TmfResponse,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl TaskManagementResponseParser {
    pub(crate) fn deserialize(buf: &[u8; BHS_SIZE]) -> Result<Self> {
        if buf[1] != 0x80 {
            return Err(IscsiError::violation(
                "TaskManagementResponse.Flags must be exactly 0x80",
            ));
        }
        if buf[3] != 0 {
            return Err(IscsiError::violation(
                "TaskManagementResponse.Reserved byte 3 must be zero",
            ));
        }
        reserved_range("TaskManagementResponse.Reserved2", &buf[20..24])?;
        reserved_range("TaskManagementResponse.Reserved3", &buf[36..48])?;

        Ok(TaskManagementResponseParser {
            response: TmfResponse::from_u8(buf[2])?,
            stat_sn: read_word(buf, 24),
            exp_cmd_sn: read_word(buf, 28),
            max_cmd_sn: read_word(buf, 32),
        })
    }

    pub(crate) fn serialize(&self, out: &mut [u8; BHS_SIZE]) {
        out[1] = 0x80;
        out[2] = self.response as u8;
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
    use crate::pdu::{PduParser, PduSettings, ProtocolDataUnit};

    #[test]
    fn test_logout_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::LogoutRequest(LogoutRequestParser {
            reason: LogoutReason::CloseSession,
            cid: 1,
            cmd_sn: 9,
            exp_stat_sn: 8,
        }))
        .with_itt(0x99);
        let bytes = pdu.serialize(&settings);
        assert_eq!(ProtocolDataUnit::parse(&bytes, &settings).unwrap(), pdu);
    }

    #[test]
    fn test_logout_bad_reason() {
        let settings = PduSettings::default();
        let mut bytes = [0u8; BHS_SIZE];
        bytes[0] = 0x06;
        bytes[1] = 0x80 | 0x05; // undefined reason
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_tmf_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::TaskManagementRequest(
            TaskManagementRequestParser {
                function: TaskManagementFunction::AbortTask,
                referenced_task_tag: 0x55,
                cmd_sn: 12,
                exp_stat_sn: 10,
                ref_cmd_sn: 11,
                exp_data_sn: 0,
            },
        ))
        .with_itt(0x56)
        .with_lun(1 << 48);
        let bytes = pdu.serialize(&settings);
        assert_eq!(ProtocolDataUnit::parse(&bytes, &settings).unwrap(), pdu);
    }

    #[test]
    fn test_reject_requires_reserved_itt() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::Reject(RejectParser {
            reason: RejectReason::CommandNotSupported,
            stat_sn: 2,
            exp_cmd_sn: 3,
            max_cmd_sn: 34,
            data_sn: 0,
        }))
        .with_itt(0x1234); // not the reserved tag
        let bytes = pdu.serialize(&settings);
        let err = ProtocolDataUnit::parse(&bytes, &settings).unwrap_err();
        assert!(matches!(err, IscsiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_snack_roundtrip() {
        let settings = PduSettings::default();
        let pdu = ProtocolDataUnit::new(PduParser::SnackRequest(SnackRequestParser {
            snack_type: SnackType::Status,
            target_transfer_tag: crate::pdu::RESERVED_TAG,
            exp_stat_sn: 7,
            beg_run: 5,
            run_length: 2,
        }))
        .with_itt(crate::pdu::RESERVED_TAG);
        let bytes = pdu.serialize(&settings);
        assert_eq!(ProtocolDataUnit::parse(&bytes, &settings).unwrap(), pdu);
    }
}
