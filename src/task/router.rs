//! Routing of commands and task management functions to logical units

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use byteorder::{BigEndian, ByteOrder};
use dashmap::DashMap;

use crate::error::{IscsiError, Result};
use crate::pdu::TaskManagementFunction;
use crate::scsi::commands::report_luns_data;
use crate::scsi::sense::SenseData;
use crate::scsi::ScsiResponseDataSegment;
use crate::task::logical_unit::LogicalUnit;
use crate::task::set::Task;
use crate::task::{CommandDescriptor, TargetTransportPort, TaskResponse, TaskServiceResponse};

/// Routes commands to logical units by LUN and dispatches task management
/// functions.
///
/// The LUN registry is a concurrent map; units may be registered and removed
/// while connections are live. Each enqueued command runs on its own worker
/// thread so a slow device never stalls the connection's receive loop.
pub struct TaskRouter {
    units: Arc<DashMap<u64, Arc<LogicalUnit>>>,
    tasks: Arc<DashMap<(u64, u32), Arc<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRouter {
    pub fn new() -> Self {
        TaskRouter {
            units: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, lun: u64, unit: Arc<LogicalUnit>) {
        log::info!("registering logical unit {}", lun);
        self.units.insert(lun, unit);
    }

    pub fn remove(&self, lun: u64) -> Option<Arc<LogicalUnit>> {
        self.units.remove(&lun).map(|(_, unit)| unit)
    }

    pub fn unit(&self, lun: u64) -> Option<Arc<LogicalUnit>> {
        self.units.get(&lun).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered LUNs in ascending order.
    pub fn luns(&self) -> Vec<u64> {
        let mut luns: Vec<u64> = self.units.iter().map(|entry| *entry.key()).collect();
        luns.sort_unstable();
        luns
    }

    /// Accepts one SCSI command for execution.
    ///
    /// An unknown LUN answers with exactly one CHECK CONDITION response
    /// (LOGICAL UNIT NOT SUPPORTED) through the port and never blocks.
    /// REPORT LUNS is answered by the router itself because no single unit
    /// knows the whole inventory. Everything else spawns a worker thread
    /// that runs the command through the unit's task set.
    pub fn enqueue(
        &self,
        port: Arc<dyn TargetTransportPort>,
        command: CommandDescriptor,
    ) -> Result<()> {
        if command.cdb[0] == 0xA0 {
            return self.report_luns(port.as_ref(), &command);
        }

        let Some(unit) = self.unit(command.nexus.lun) else {
            log::warn!("command for unknown LUN {}", command.nexus.lun);
            port.write_response(
                &command.nexus,
                TaskResponse::check_condition(SenseData::logical_unit_not_supported()),
            )?;
            return Ok(());
        };

        let task = Arc::new(Task::new(command.nexus));
        let key = (command.nexus.lun, command.nexus.task_tag);
        self.tasks.insert(key, Arc::clone(&task));

        let tasks = Arc::clone(&self.tasks);
        let worker = std::thread::Builder::new()
            .name(format!("iscsi-task-{:08x}", command.nexus.task_tag))
            .spawn(move || {
                unit.execute(port.as_ref(), task, &command);
                tasks.remove(&key);
            })
            .map_err(IscsiError::Io)?;
        self.workers.lock().unwrap().push(worker);
        Ok(())
    }

    /// Answers REPORT LUNS from the registry, cropped to the CDB's
    /// allocation length.
    fn report_luns(
        &self,
        port: &dyn TargetTransportPort,
        command: &CommandDescriptor,
    ) -> Result<()> {
        let allocation_length = BigEndian::read_u32(&command.cdb[6..10]) as usize;
        let segment =
            ScsiResponseDataSegment::data_only(report_luns_data(&self.luns()), allocation_length);
        port.write_data(&command.nexus, 0, &segment.serialize())?;

        let mut response = TaskResponse::good();
        response.residual_overflow = segment.residual_overflow();
        response.residual_underflow = segment.residual_underflow();
        response.residual_count = segment.residual_count();
        port.write_response(&command.nexus, response)?;
        Ok(())
    }

    /// Waits for every spawned worker to finish. Meant for shutdown and
    /// tests; new enqueues during the drain are not waited for.
    pub fn drain(&self) {
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("task worker panicked");
            }
        }
    }

    /// Executes a task management function synchronously.
    pub fn execute_tmf(
        &self,
        function: TaskManagementFunction,
        lun: u64,
        referenced_task_tag: u32,
    ) -> TaskServiceResponse {
        log::info!(
            "task management {:?} lun={} ref_itt=0x{:08x}",
            function,
            lun,
            referenced_task_tag
        );
        match function {
            TaskManagementFunction::AbortTask => {
                let Some(task) = self
                    .tasks
                    .get(&(lun, referenced_task_tag))
                    .map(|entry| Arc::clone(entry.value()))
                else {
                    return TaskServiceResponse::TaskDoesNotExist;
                };
                task.abort();
                // Wake the task if it is queued so it can observe the abort.
                if let Some(unit) = self.unit(lun) {
                    unit.task_set().interrupt();
                }
                TaskServiceResponse::FunctionComplete
            }
            TaskManagementFunction::AbortTaskSet | TaskManagementFunction::ClearTaskSet => {
                match self.unit(lun) {
                    Some(unit) => {
                        unit.task_set().abort_all();
                        TaskServiceResponse::FunctionComplete
                    }
                    None => TaskServiceResponse::IncorrectLogicalUnit,
                }
            }
            TaskManagementFunction::ClearAca => match self.unit(lun) {
                // No ACA state is ever held, so clearing it always succeeds.
                Some(_) => TaskServiceResponse::FunctionComplete,
                None => TaskServiceResponse::IncorrectLogicalUnit,
            },
            TaskManagementFunction::LogicalUnitReset => match self.unit(lun) {
                Some(unit) => {
                    unit.reset();
                    TaskServiceResponse::FunctionComplete
                }
                None => TaskServiceResponse::IncorrectLogicalUnit,
            },
            TaskManagementFunction::TargetWarmReset | TaskManagementFunction::TargetColdReset => {
                for entry in self.units.iter() {
                    entry.value().reset();
                }
                self.tasks.clear();
                TaskServiceResponse::FunctionComplete
            }
            TaskManagementFunction::TaskReassign => TaskServiceResponse::FunctionNotSupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{Isid, TaskAttribute};
    use crate::scsi::{status, MemoryBlockDevice};
    use crate::task::{LoopbackPort, Nexus};

    fn router_with_lun0() -> TaskRouter {
        let router = TaskRouter::new();
        router.register(
            0,
            Arc::new(LogicalUnit::new(Arc::new(MemoryBlockDevice::new(512, 8)))),
        );
        router
    }

    fn command(lun: u64, tag: u32, cdb_bytes: &[u8]) -> CommandDescriptor {
        let mut cdb = [0u8; 16];
        cdb[..cdb_bytes.len()].copy_from_slice(cdb_bytes);
        CommandDescriptor {
            nexus: Nexus {
                isid: Isid::default(),
                tsih: 1,
                lun,
                task_tag: tag,
            },
            cdb,
            attribute: TaskAttribute::Simple,
            expected_data_transfer_length: 0,
            write_data: Vec::new(),
        }
    }

    #[test]
    fn test_unknown_lun_single_check_condition() {
        let router = router_with_lun0();
        let port = Arc::new(LoopbackPort::new());
        router
            .enqueue(Arc::clone(&port) as Arc<dyn TargetTransportPort>, command(9, 1, &[0x00]))
            .unwrap();
        router.drain();

        let responses = port.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, status::CHECK_CONDITION);
        // LOGICAL UNIT NOT SUPPORTED: key 5, ASC 0x25.
        assert_eq!(responses[0].1.segment[4], 0x05);
        assert_eq!(responses[0].1.segment[14], 0x25);
    }

    #[test]
    fn test_enqueue_runs_to_completion() {
        let router = router_with_lun0();
        let port = Arc::new(LoopbackPort::new());
        router
            .enqueue(Arc::clone(&port) as Arc<dyn TargetTransportPort>, command(0, 2, &[0x00]))
            .unwrap();
        router.drain();

        let responses = port.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, status::GOOD);
    }

    #[test]
    fn test_report_luns_from_registry() {
        let router = router_with_lun0();
        router.register(
            3,
            Arc::new(LogicalUnit::new(Arc::new(MemoryBlockDevice::new(512, 8)))),
        );
        let port = Arc::new(LoopbackPort::new());
        let mut cmd = command(0, 3, &[0xA0]);
        BigEndian::write_u32(&mut cmd.cdb[6..10], 1024);
        cmd.expected_data_transfer_length = 1024;
        router
            .enqueue(Arc::clone(&port) as Arc<dyn TargetTransportPort>, cmd)
            .unwrap();

        let data = port.written_data();
        assert_eq!(data.len(), 1);
        assert_eq!(BigEndian::read_u32(&data[0].2[0..4]), 16); // two LUNs
        assert_eq!(port.responses()[0].1.status, status::GOOD);
    }

    #[test]
    fn test_abort_task_responses() {
        let router = router_with_lun0();
        assert_eq!(
            router.execute_tmf(TaskManagementFunction::AbortTask, 0, 0xDEAD),
            TaskServiceResponse::TaskDoesNotExist
        );
        assert_eq!(
            router.execute_tmf(TaskManagementFunction::LogicalUnitReset, 9, 0),
            TaskServiceResponse::IncorrectLogicalUnit
        );
        assert_eq!(
            router.execute_tmf(TaskManagementFunction::TargetWarmReset, 0, 0),
            TaskServiceResponse::FunctionComplete
        );
        assert_eq!(
            router.execute_tmf(TaskManagementFunction::TaskReassign, 0, 0),
            TaskServiceResponse::FunctionNotSupported
        );
    }
}
