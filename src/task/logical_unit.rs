//! One logical unit: a block device plus the task set that orders access to
//! it.

use std::sync::Arc;

use crate::scsi::cdb::Cdb;
use crate::scsi::commands::{self, CommandOutcome};
use crate::scsi::sense::SenseData;
use crate::scsi::{status, BlockDevice, ScsiResponseDataSegment};
use crate::task::set::{Task, TaskSet};
use crate::task::{CommandDescriptor, TargetTransportPort, TaskResponse};

/// Commands one logical unit will queue before answering TASK SET FULL.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

pub struct LogicalUnit {
    device: Arc<dyn BlockDevice>,
    task_set: TaskSet,
}

impl LogicalUnit {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_queue_depth(device, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(device: Arc<dyn BlockDevice>, queue_depth: usize) -> Self {
        LogicalUnit {
            device,
            task_set: TaskSet::new(queue_depth),
        }
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.task_set
    }

    /// Logical unit reset: every queued and running task is aborted.
    pub fn reset(&self) {
        log::info!("resetting logical unit, {} tasks active", self.task_set.len());
        self.task_set.abort_all();
    }

    /// Runs one command to completion on the calling thread: admission into
    /// the task set, attribute ordering, execution, data delivery and the
    /// final response.
    ///
    /// An aborted task produces no response of its own; the initiator learns
    /// about it through the task management response that caused the abort.
    pub fn execute(
        &self,
        port: &dyn TargetTransportPort,
        task: Arc<Task>,
        command: &CommandDescriptor,
    ) {
        let Some(admission) = self.task_set.admit(Arc::clone(&task), command.attribute) else {
            let response = TaskResponse::status_only(status::TASK_SET_FULL);
            if let Err(err) = port.write_response(&command.nexus, response) {
                log::error!("failed to report TASK SET FULL for {}: {}", command.nexus, err);
            }
            return;
        };

        if !self.task_set.wait_runnable(admission) || !task.begin_run() {
            log::debug!("task {} aborted before running", command.nexus);
            self.task_set.complete(admission);
            return;
        }

        if let Some(response) = self.run_command(port, &task, command) {
            if task.begin_response() {
                if let Err(err) = port.write_response(&command.nexus, response) {
                    log::error!("failed to write response for {}: {}", command.nexus, err);
                }
                task.finish();
            }
        }
        self.task_set.complete(admission);
    }

    /// Executes the decoded CDB. `None` means the task was aborted and must
    /// stay silent.
    fn run_command(
        &self,
        port: &dyn TargetTransportPort,
        task: &Task,
        command: &CommandDescriptor,
    ) -> Option<TaskResponse> {
        let cdb = match Cdb::decode(&command.cdb) {
            Ok(cdb) => cdb,
            Err(sense) => return Some(TaskResponse::check_condition(sense)),
        };

        // Write data not assembled by the connection layer is pulled through
        // the port (solicited transfer).
        let pulled;
        let write_data: &[u8] = if cdb.is_write()
            && command.write_data.is_empty()
            && command.expected_data_transfer_length > 0
        {
            match port.read_data(&command.nexus, 0, command.expected_data_transfer_length) {
                Ok(data) => {
                    pulled = data;
                    &pulled
                }
                Err(err) => {
                    log::warn!("data transfer failed for {}: {}", command.nexus, err);
                    return Some(TaskResponse::check_condition(
                        SenseData::internal_target_failure(),
                    ));
                }
            }
        } else {
            &command.write_data
        };

        if task.is_aborted() {
            return None;
        }

        match commands::execute(self.device.as_ref(), &cdb, write_data) {
            CommandOutcome::Good {
                data,
                allocation_length,
            } => {
                if data.is_empty() {
                    return Some(self.dataless_response(command, write_data.len()));
                }
                self.deliver_data(port, command, data, allocation_length)
            }
            CommandOutcome::CheckCondition(sense) => {
                Some(TaskResponse::check_condition(sense))
            }
        }
    }

    /// GOOD response for commands without return data; reports a residual
    /// when a write moved less than the PDU announced.
    fn dataless_response(&self, command: &CommandDescriptor, moved: usize) -> TaskResponse {
        let expected = command.expected_data_transfer_length as usize;
        let mut response = TaskResponse::good();
        if expected > moved {
            response.residual_underflow = true;
            response.residual_count = (expected - moved) as u32;
        }
        response
    }

    fn deliver_data(
        &self,
        port: &dyn TargetTransportPort,
        command: &CommandDescriptor,
        data: Vec<u8>,
        allocation_length: Option<usize>,
    ) -> Option<TaskResponse> {
        // Parameter data is bounded by the CDB's allocation length, block
        // data by the PDU's expected transfer length. Either way overshoot
        // is cropped silently and reported as a residual.
        let limit = allocation_length
            .unwrap_or(usize::MAX)
            .min(command.expected_data_transfer_length as usize);
        let segment = ScsiResponseDataSegment::data_only(data, limit);
        let payload = segment.serialize();

        if let Err(err) = port.write_data(&command.nexus, 0, &payload) {
            log::warn!("data delivery failed for {}: {}", command.nexus, err);
            return Some(TaskResponse::check_condition(
                SenseData::internal_target_failure(),
            ));
        }

        let mut response = TaskResponse::good();
        response.residual_overflow = segment.residual_overflow();
        response.residual_underflow = segment.residual_underflow();
        response.residual_count = segment.residual_count();
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{Isid, TaskAttribute};
    use crate::scsi::MemoryBlockDevice;
    use crate::task::{LoopbackPort, Nexus};

    fn lu() -> LogicalUnit {
        LogicalUnit::new(Arc::new(MemoryBlockDevice::new(512, 8)))
    }

    fn descriptor(cdb_bytes: &[u8], edtl: u32, write_data: Vec<u8>) -> CommandDescriptor {
        let mut cdb = [0u8; 16];
        cdb[..cdb_bytes.len()].copy_from_slice(cdb_bytes);
        CommandDescriptor {
            nexus: Nexus {
                isid: Isid::default(),
                tsih: 1,
                lun: 0,
                task_tag: 0x10,
            },
            cdb,
            attribute: TaskAttribute::Simple,
            expected_data_transfer_length: edtl,
            write_data,
        }
    }

    #[test]
    fn test_write_then_read_through_port() {
        let lu = lu();
        let port = LoopbackPort::new();

        let write = descriptor(&[0x2A, 0, 0, 0, 0, 0x02, 0, 0, 0x01, 0], 512, vec![0x7E; 512]);
        lu.execute(&port, Arc::new(Task::new(write.nexus)), &write);

        let read = descriptor(&[0x28, 0, 0, 0, 0, 0x02, 0, 0, 0x01, 0], 512, Vec::new());
        lu.execute(&port, Arc::new(Task::new(read.nexus)), &read);

        let responses = port.responses();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|(_, r)| r.status == status::GOOD));

        let data = port.written_data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].2, vec![0x7E; 512]);
    }

    #[test]
    fn test_bad_opcode_yields_check_condition() {
        let lu = lu();
        let port = LoopbackPort::new();
        let command = descriptor(&[0xEE], 0, Vec::new());
        lu.execute(&port, Arc::new(Task::new(command.nexus)), &command);

        let responses = port.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, status::CHECK_CONDITION);
        // Sense data rides in the response segment.
        assert_eq!(responses[0].1.segment[2], 0x70);
    }

    #[test]
    fn test_inquiry_cropped_to_allocation_length() {
        let lu = lu();
        let port = LoopbackPort::new();
        // INQUIRY with allocation length 16; standard data is 36 bytes.
        let command = descriptor(&[0x12, 0, 0, 0x00, 0x10, 0], 64, Vec::new());
        lu.execute(&port, Arc::new(Task::new(command.nexus)), &command);

        let data = port.written_data();
        assert_eq!(data[0].2.len(), 16);
        let (_, response) = &port.responses()[0];
        assert_eq!(response.status, status::GOOD);
        assert!(response.residual_overflow);
        assert_eq!(response.residual_count, 20);
    }

    #[test]
    fn test_aborted_task_is_silent() {
        let lu = lu();
        let port = LoopbackPort::new();
        let command = descriptor(&[0x00], 0, Vec::new());
        let task = Arc::new(Task::new(command.nexus));
        assert!(task.abort());
        lu.execute(&port, task, &command);
        assert!(port.responses().is_empty());
    }

    #[test]
    fn test_queue_depth_reports_task_set_full() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new(512, 8));
        let lu = LogicalUnit::with_queue_depth(device, 0);
        let port = LoopbackPort::new();
        let command = descriptor(&[0x00], 0, Vec::new());
        lu.execute(&port, Arc::new(Task::new(command.nexus)), &command);

        let responses = port.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, status::TASK_SET_FULL);
    }
}
