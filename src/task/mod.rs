//! Task routing and execution
//!
//! A SCSI command accepted by the connection layer becomes a [`Task`] routed
//! to a logical unit, queued in that unit's [`TaskSet`] under its SAM-2
//! attribute, and executed on its own thread. Results flow back through the
//! [`TargetTransportPort`] the connection handed in, so this layer never
//! touches PDUs directly.

pub mod logical_unit;
pub mod router;
pub mod set;

pub use logical_unit::LogicalUnit;
pub use router::TaskRouter;
pub use set::{Task, TaskSet};

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{IscsiError, Result};
use crate::pdu::{Isid, ScsiCommandParser, ServiceResponse, TaskAttribute};
use crate::scsi::sense::SenseData;
use crate::scsi::ScsiResponseDataSegment;

/// The I_T_L_Q nexus: which initiator-target session, which logical unit,
/// which task. Identifies a task across the whole target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nexus {
    pub isid: Isid,
    pub tsih: u16,
    pub lun: u64,
    pub task_tag: u32,
}

impl std::fmt::Display for Nexus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tsih={} lun={} itt=0x{:08x}",
            self.tsih, self.lun, self.task_tag
        )
    }
}

/// Everything the task layer needs to run one SCSI command.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub nexus: Nexus,
    pub cdb: [u8; 16],
    pub attribute: TaskAttribute,
    pub expected_data_transfer_length: u32,
    /// Assembled Data-Out payload for write commands; empty when the data
    /// still has to be pulled through the port.
    pub write_data: Vec<u8>,
}

impl CommandDescriptor {
    pub fn from_parser(nexus: Nexus, parser: &ScsiCommandParser, write_data: Vec<u8>) -> Self {
        CommandDescriptor {
            nexus,
            cdb: parser.cdb,
            attribute: parser.attribute,
            expected_data_transfer_length: parser.expected_data_transfer_length,
            write_data,
        }
    }
}

/// Outcome of a task service call (enqueue or a task management function).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskServiceResponse {
    FunctionComplete,
    TaskDoesNotExist,
    IncorrectLogicalUnit,
    FunctionNotSupported,
    FunctionRejected,
}

/// The completed-command report a task pushes through the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub service_response: ServiceResponse,
    pub status: u8,
    /// Serialized response data segment (sense-length prefix + sense +
    /// response data), already cropped.
    pub segment: Vec<u8>,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    pub residual_count: u32,
}

impl TaskResponse {
    pub fn good() -> Self {
        TaskResponse {
            service_response: ServiceResponse::CommandCompletedAtTarget,
            status: crate::scsi::status::GOOD,
            segment: Vec::new(),
            residual_overflow: false,
            residual_underflow: false,
            residual_count: 0,
        }
    }

    pub fn status_only(status: u8) -> Self {
        TaskResponse {
            status,
            ..TaskResponse::good()
        }
    }

    pub fn check_condition(sense: SenseData) -> Self {
        let segment = ScsiResponseDataSegment::sense_only(sense, usize::MAX);
        TaskResponse {
            service_response: ServiceResponse::CommandCompletedAtTarget,
            status: crate::scsi::status::CHECK_CONDITION,
            segment: segment.serialize(),
            residual_overflow: false,
            residual_underflow: false,
            residual_count: 0,
        }
    }
}

/// The task layer's view of the connection: deliver data, deliver the final
/// response, or tear down a transfer.
///
/// `terminate_data_transfer` poisons the nexus identity: in-flight and
/// later transfers for it must fail until a new command reuses the tag.
pub trait TargetTransportPort: Send + Sync {
    /// Pulls solicited write data from the initiator.
    fn read_data(&self, nexus: &Nexus, buffer_offset: u32, length: u32) -> Result<Vec<u8>>;

    /// Pushes read/command data toward the initiator.
    fn write_data(&self, nexus: &Nexus, buffer_offset: u32, data: &[u8]) -> Result<()>;

    /// Sends the final response for the task. Called at most once per task.
    fn write_response(&self, nexus: &Nexus, response: TaskResponse) -> Result<()>;

    /// Abandons the data transfer for this nexus identity.
    fn terminate_data_transfer(&self, nexus: &Nexus);
}

/// An in-process [`TargetTransportPort`] that records everything, used by
/// tests and loopback tooling.
#[derive(Debug, Default)]
pub struct LoopbackPort {
    data: Mutex<Vec<(Nexus, u32, Vec<u8>)>>,
    responses: Mutex<Vec<(Nexus, TaskResponse)>>,
    poisoned: Mutex<HashSet<(u16, u64, u32)>>,
    /// Buffer handed out by `read_data`.
    pub outbound: Mutex<Vec<u8>>,
}

impl LoopbackPort {
    pub fn new() -> Self {
        LoopbackPort::default()
    }

    fn key(nexus: &Nexus) -> (u16, u64, u32) {
        (nexus.tsih, nexus.lun, nexus.task_tag)
    }

    fn check_poisoned(&self, nexus: &Nexus) -> Result<()> {
        if self.poisoned.lock().unwrap().contains(&Self::key(nexus)) {
            return Err(IscsiError::Session(format!(
                "data transfer for {} was terminated",
                nexus
            )));
        }
        Ok(())
    }

    /// Data segments written so far, in delivery order.
    pub fn written_data(&self) -> Vec<(Nexus, u32, Vec<u8>)> {
        self.data.lock().unwrap().clone()
    }

    /// Responses written so far, in delivery order.
    pub fn responses(&self) -> Vec<(Nexus, TaskResponse)> {
        self.responses.lock().unwrap().clone()
    }
}

impl TargetTransportPort for LoopbackPort {
    fn read_data(&self, nexus: &Nexus, buffer_offset: u32, length: u32) -> Result<Vec<u8>> {
        self.check_poisoned(nexus)?;
        let outbound = self.outbound.lock().unwrap();
        let start = buffer_offset as usize;
        let end = start + length as usize;
        if end > outbound.len() {
            return Err(IscsiError::Session(format!(
                "read_data past outbound buffer for {}",
                nexus
            )));
        }
        Ok(outbound[start..end].to_vec())
    }

    fn write_data(&self, nexus: &Nexus, buffer_offset: u32, data: &[u8]) -> Result<()> {
        self.check_poisoned(nexus)?;
        self.data
            .lock()
            .unwrap()
            .push((*nexus, buffer_offset, data.to_vec()));
        Ok(())
    }

    fn write_response(&self, nexus: &Nexus, response: TaskResponse) -> Result<()> {
        // A fresh command reusing the identity clears the poison.
        self.poisoned.lock().unwrap().remove(&Self::key(nexus));
        self.responses.lock().unwrap().push((*nexus, response));
        Ok(())
    }

    fn terminate_data_transfer(&self, nexus: &Nexus) {
        self.poisoned.lock().unwrap().insert(Self::key(nexus));
    }
}
