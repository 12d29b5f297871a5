//! Bridge from the task layer's transport port to outbound PDUs
//!
//! Tasks report results through [`TargetTransportPort`]; this sink renders
//! those calls into Data-In and SCSI Response PDUs using the connection's
//! sequence counters and queues them for the transport to send.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{IscsiError, Result};
use crate::pdu::{
    DataInParser, DataSegment, PduParser, ProtocolDataUnit, ScsiResponseParser,
    RESERVED_TAG,
};
use crate::serial::SequenceCounter;
use crate::session::Session;
use crate::task::{Nexus, TargetTransportPort, TaskResponse};

pub(crate) struct PduSink {
    session: Arc<Mutex<Session>>,
    stat_sn: Arc<SequenceCounter>,
    /// Peer's MaxRecvDataSegmentLength; bounds each Data-In payload.
    peer_max_data_segment: u32,
    outbound: Mutex<Vec<ProtocolDataUnit>>,
    poisoned: Mutex<HashSet<u32>>,
}

impl PduSink {
    pub(crate) fn new(
        session: Arc<Mutex<Session>>,
        stat_sn: Arc<SequenceCounter>,
        peer_max_data_segment: u32,
    ) -> Self {
        PduSink {
            session,
            stat_sn,
            peer_max_data_segment,
            outbound: Mutex::new(Vec::new()),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    /// Takes every PDU queued so far, in emission order.
    pub(crate) fn take_outbound(&self) -> Vec<ProtocolDataUnit> {
        std::mem::take(&mut self.outbound.lock().unwrap())
    }

    fn window(&self) -> (u32, u32) {
        let session = self.session.lock().unwrap();
        (session.exp_cmd_sn(), session.max_cmd_sn())
    }

    fn check_poisoned(&self, nexus: &Nexus) -> Result<()> {
        if self.poisoned.lock().unwrap().contains(&nexus.task_tag) {
            return Err(IscsiError::Session(format!(
                "data transfer for {} was terminated",
                nexus
            )));
        }
        Ok(())
    }
}

impl TargetTransportPort for PduSink {
    fn read_data(&self, nexus: &Nexus, _buffer_offset: u32, _length: u32) -> Result<Vec<u8>> {
        // Write payloads are assembled from Data-Out PDUs before the task is
        // enqueued, so a pull from the task side means the staging logic was
        // bypassed.
        Err(IscsiError::Session(format!(
            "no staged write data for {}",
            nexus
        )))
    }

    fn write_data(&self, nexus: &Nexus, buffer_offset: u32, data: &[u8]) -> Result<()> {
        self.check_poisoned(nexus)?;
        let (exp_cmd_sn, max_cmd_sn) = self.window();
        let chunk_size = self.peer_max_data_segment.max(1) as usize;
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        let mut outbound = self.outbound.lock().unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            let pdu = ProtocolDataUnit::new(PduParser::ScsiDataIn(DataInParser {
                final_flag: last,
                acknowledge: false,
                residual_overflow: false,
                residual_underflow: false,
                // Status always travels in a separate SCSI Response.
                status_flag: false,
                status: 0,
                target_transfer_tag: RESERVED_TAG,
                stat_sn: self.stat_sn.get().value(),
                exp_cmd_sn,
                max_cmd_sn,
                data_sn: i as u32,
                buffer_offset: buffer_offset + (i * chunk_size) as u32,
                residual_count: 0,
            }))
            .with_lun(nexus.lun)
            .with_itt(nexus.task_tag)
            .with_data(DataSegment::binary(chunk.to_vec()));
            outbound.push(pdu);
        }
        Ok(())
    }

    fn write_response(&self, nexus: &Nexus, response: TaskResponse) -> Result<()> {
        self.poisoned.lock().unwrap().remove(&nexus.task_tag);
        let (exp_cmd_sn, max_cmd_sn) = self.window();
        let pdu = ProtocolDataUnit::new(PduParser::ScsiResponse(ScsiResponseParser {
            bidi_read_residual_overflow: false,
            bidi_read_residual_underflow: false,
            residual_overflow: response.residual_overflow,
            residual_underflow: response.residual_underflow,
            response: response.service_response,
            status: response.status,
            snack_tag: 0,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
            exp_data_sn: 0,
            bidi_read_residual_count: 0,
            residual_count: response.residual_count,
        }))
        .with_itt(nexus.task_tag)
        .with_data(DataSegment::binary(response.segment));
        self.outbound.lock().unwrap().push(pdu);
        Ok(())
    }

    fn terminate_data_transfer(&self, nexus: &Nexus) {
        self.poisoned.lock().unwrap().insert(nexus.task_tag);
    }
}
