//! Connection state machine
//!
//! A connection moves through the login phase (security negotiation, then
//! operational negotiation) into the full feature phase, and ends with
//! logout. In the full feature phase each incoming PDU's opcode selects a
//! dispatch stage; a SCSI Command goes through a second dispatch on its CDB
//! operation code inside the task layer.
//!
//! The connection is transport-agnostic: it consumes parsed PDUs (or raw
//! buffers via [`Connection::handle_bytes`]) and returns the PDUs to send
//! back. Socket plumbing lives outside this crate.

pub mod login;
pub(crate) mod sink;

pub use login::LoginNegotiator;

use std::collections::{btree_map, BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{IscsiError, Result};
use crate::pdu::{
    DataOutParser, DataSegment, LoginStage, LogoutReason, LogoutResponseParser, NopInParser,
    Opcode, PduParser, PduSettings, ProtocolDataUnit, Ready2TransferParser, RejectParser,
    RejectReason, ScsiCommandParser, TaskManagementResponseParser, TextReassembler,
    TextResponseParser, TmfResponse, Isid, RESERVED_TAG,
};
use crate::serial::SequenceCounter;
use crate::session::{CmdSnDisposition, Session, SessionParams};
use crate::task::{CommandDescriptor, Nexus, TaskRouter, TaskServiceResponse};
use sink::PduSink;

/// How login authenticates the initiator.
///
/// Only `None` exists today: the security negotiation stage always succeeds.
/// This is an explicit, configurable simplification rather than a hidden
/// assumption; a CHAP mode would slot in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
}

/// Static configuration for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub target_name: String,
    pub auth: AuthMode,
    pub max_recv_data_segment_length: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            target_name: "iqn.2026-08.org.example:target0".to_string(),
            auth: AuthMode::None,
            max_recv_data_segment_length: 8192,
        }
    }
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Login(LoginStage),
    FullFeature,
    Closed,
}

/// First-level dispatch in the full feature phase: the opcode names the
/// stage that handles the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullFeatureStage {
    Ping,
    ScsiCommand,
    DataOut,
    TaskManagement,
    TextNegotiation,
    Logout,
    Snack,
}

impl FullFeatureStage {
    fn from_opcode(opcode: Opcode) -> Result<Self> {
        match opcode {
            Opcode::NopOut => Ok(FullFeatureStage::Ping),
            Opcode::ScsiCommand => Ok(FullFeatureStage::ScsiCommand),
            Opcode::ScsiDataOut => Ok(FullFeatureStage::DataOut),
            Opcode::TaskManagementRequest => Ok(FullFeatureStage::TaskManagement),
            Opcode::TextRequest => Ok(FullFeatureStage::TextNegotiation),
            Opcode::LogoutRequest => Ok(FullFeatureStage::Logout),
            Opcode::SnackRequest => Ok(FullFeatureStage::Snack),
            other => Err(IscsiError::violation(format!(
                "{} PDU is not valid in the full feature phase",
                other.name()
            ))),
        }
    }
}

/// An in-progress write command waiting for Data-Out PDUs.
struct WriteAssembly {
    parser: ScsiCommandParser,
    lun: u64,
    itt: u32,
    /// Tag the R2T handed out; `RESERVED_TAG` while the transfer is
    /// unsolicited.
    ttt: u32,
    buffer: Vec<u8>,
    received: u32,
    r2t_sn: u32,
}

pub struct Connection {
    config: ConnectionConfig,
    router: Arc<TaskRouter>,
    phase: Phase,
    settings: PduSettings,
    pub(crate) session: Arc<Mutex<Session>>,
    pub(crate) stat_sn: Arc<SequenceCounter>,
    pub(crate) negotiator: LoginNegotiator,
    pub(crate) login_text: TextReassembler,
    text: TextReassembler,
    pub(crate) isid: Isid,
    pub(crate) tsih: u16,
    pub(crate) cid: u16,
    pub(crate) discovery: bool,
    pub(crate) login_seeded: bool,
    pub(crate) params_snapshot: Option<SessionParams>,
    /// Non-immediate commands ahead of ExpCmdSN, held until the gap fills.
    pending: BTreeMap<u32, ProtocolDataUnit>,
    write_assemblies: HashMap<u32, WriteAssembly>,
    next_ttt: u32,
    sink: Option<Arc<PduSink>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, router: Arc<TaskRouter>) -> Self {
        let mut settings = PduSettings::target();
        settings.max_recv_data_segment_length = config.max_recv_data_segment_length;
        let mut session = Session::new(Isid::default(), 0);
        session.params.max_recv_data_segment_length = config.max_recv_data_segment_length;
        Connection {
            config,
            router,
            phase: Phase::Login(LoginStage::SecurityNegotiation),
            settings,
            session: Arc::new(Mutex::new(session)),
            stat_sn: Arc::new(SequenceCounter::new(0)),
            negotiator: LoginNegotiator::new(),
            login_text: TextReassembler::new(),
            text: TextReassembler::new(),
            isid: Isid::default(),
            tsih: 0,
            cid: 0,
            discovery: false,
            login_seeded: false,
            params_snapshot: None,
            pending: BTreeMap::new(),
            write_assemblies: HashMap::new(),
            next_ttt: 1,
            sink: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Codec settings currently in force (digests activate when login
    /// completes).
    pub fn settings(&self) -> &PduSettings {
        &self.settings
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Parses one inbound buffer, handles it, and serializes the responses
    /// under the current settings.
    pub fn handle_bytes(&mut self, buf: &[u8]) -> Result<Vec<Vec<u8>>> {
        // Digests negotiated by this very PDU take effect only afterwards,
        // so responses go out under the settings that were in force when the
        // request arrived.
        let settings = self.settings.clone();
        let pdu = ProtocolDataUnit::parse(buf, &settings)?;
        let responses = self.handle(pdu)?;
        Ok(responses
            .iter()
            .map(|pdu| pdu.serialize(&settings))
            .collect())
    }

    /// Handles one inbound PDU and returns the PDUs to send in reply.
    pub fn handle(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        match self.phase {
            Phase::Closed => Err(IscsiError::Session("connection is closed".to_string())),
            Phase::Login(_) => match pdu.bhs.parser {
                PduParser::LoginRequest(_) => self.handle_login(pdu),
                _ => Err(IscsiError::violation(format!(
                    "{} PDU during the login phase",
                    pdu.opcode().name()
                ))),
            },
            Phase::FullFeature => self.full_feature(pdu),
        }
    }

    fn full_feature(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let stage = FullFeatureStage::from_opcode(pdu.opcode())?;
        log::trace!("full feature dispatch: {:?}", stage);

        // A discovery session exists to answer SendTargets; anything that
        // touches SCSI is a hard protocol error on it.
        if self.discovery
            && matches!(
                stage,
                FullFeatureStage::ScsiCommand
                    | FullFeatureStage::DataOut
                    | FullFeatureStage::TaskManagement
            )
        {
            self.phase = Phase::Closed;
            return Err(IscsiError::violation(format!(
                "{} PDU on a discovery session",
                pdu.opcode().name()
            )));
        }

        if let Some(CmdSnDisposition::Queued) = self.check_cmd_sn(&pdu)? {
            return self.hold_for_window(pdu);
        }

        let mut responses = self.dispatch(stage, pdu)?;
        self.release_held(&mut responses)?;
        Ok(responses)
    }

    fn dispatch(
        &mut self,
        stage: FullFeatureStage,
        pdu: ProtocolDataUnit,
    ) -> Result<Vec<ProtocolDataUnit>> {
        match stage {
            FullFeatureStage::Ping => self.handle_nop(pdu),
            FullFeatureStage::ScsiCommand => self.handle_scsi_command(pdu),
            FullFeatureStage::DataOut => self.handle_data_out(pdu),
            FullFeatureStage::TaskManagement => self.handle_task_management(pdu),
            FullFeatureStage::TextNegotiation => self.handle_text(pdu),
            FullFeatureStage::Logout => self.handle_logout(pdu),
            FullFeatureStage::Snack => self.handle_snack(pdu),
        }
    }

    fn command_sn(pdu: &ProtocolDataUnit) -> Option<u32> {
        match &pdu.bhs.parser {
            PduParser::NopOut(p) => Some(p.cmd_sn),
            PduParser::ScsiCommand(p) => Some(p.cmd_sn),
            PduParser::TextRequest(p) => Some(p.cmd_sn),
            PduParser::LogoutRequest(p) => Some(p.cmd_sn),
            PduParser::TaskManagementRequest(p) => Some(p.cmd_sn),
            _ => None,
        }
    }

    /// Validates the command window for the PDU kinds that carry a CmdSN.
    fn check_cmd_sn(&mut self, pdu: &ProtocolDataUnit) -> Result<Option<CmdSnDisposition>> {
        let Some(cmd_sn) = Self::command_sn(pdu) else {
            return Ok(None);
        };
        // NOP-Out without a response request does not consume a CmdSN slot.
        let consumes = !matches!(&pdu.bhs.parser, PduParser::NopOut(_))
            || pdu.bhs.initiator_task_tag != RESERVED_TAG;
        let immediate = pdu.bhs.immediate || !consumes;
        let disposition = self
            .session
            .lock()
            .unwrap()
            .accept_cmd_sn(cmd_sn, immediate)?;
        Ok(Some(disposition))
    }

    /// Parks a command that arrived ahead of ExpCmdSN. It runs, in CmdSN
    /// order, once the sequence gap fills.
    fn hold_for_window(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let Some(cmd_sn) = Self::command_sn(&pdu) else {
            return Err(IscsiError::violation("queued PDU without a CmdSN"));
        };
        match self.pending.entry(cmd_sn) {
            btree_map::Entry::Occupied(_) => Err(IscsiError::violation(format!(
                "duplicate CmdSN {} ahead of the window",
                cmd_sn
            ))),
            btree_map::Entry::Vacant(slot) => {
                log::debug!("holding CmdSN {} until the window reaches it", cmd_sn);
                slot.insert(pdu);
                Ok(Vec::new())
            }
        }
    }

    /// Runs held commands the advancing window has made deliverable,
    /// appending their responses.
    fn release_held(&mut self, responses: &mut Vec<ProtocolDataUnit>) -> Result<()> {
        loop {
            if self.phase != Phase::FullFeature {
                return Ok(());
            }
            let exp = self.session.lock().unwrap().exp_cmd_sn();
            let Some(pdu) = self.pending.remove(&exp) else {
                return Ok(());
            };
            self.session.lock().unwrap().accept_cmd_sn(exp, false)?;
            let stage = FullFeatureStage::from_opcode(pdu.opcode())?;
            responses.extend(self.dispatch(stage, pdu)?);
        }
    }

    fn window(&self) -> (u32, u32) {
        let session = self.session.lock().unwrap();
        (session.exp_cmd_sn(), session.max_cmd_sn())
    }

    fn peer_max_data_segment(&self) -> u32 {
        self.session
            .lock()
            .unwrap()
            .params
            .peer_max_recv_data_segment_length
    }

    pub(crate) fn sink(&mut self) -> Arc<PduSink> {
        if self.sink.is_none() {
            self.sink = Some(Arc::new(PduSink::new(
                Arc::clone(&self.session),
                Arc::clone(&self.stat_sn),
                self.peer_max_data_segment(),
            )));
        }
        Arc::clone(self.sink.as_ref().unwrap())
    }

    fn handle_nop(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::NopOut(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a NOP-Out"),
        };

        if pdu.bhs.initiator_task_tag == RESERVED_TAG {
            // The initiator answered a target ping or sent a pure
            // keep-alive; nothing to say back.
            log::trace!("NOP-Out without response request, ttt=0x{:08x}", parser.target_transfer_tag);
            return Ok(Vec::new());
        }

        // Echo the ping data back, bounded by what the peer can receive.
        let limit = self.peer_max_data_segment() as usize;
        let mut echo = pdu.data.bytes.clone();
        echo.truncate(limit);

        let (exp_cmd_sn, max_cmd_sn) = self.window();
        let response = ProtocolDataUnit::new(PduParser::NopIn(NopInParser {
            target_transfer_tag: RESERVED_TAG,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
        }))
        .with_lun(pdu.bhs.lun)
        .with_itt(pdu.bhs.initiator_task_tag)
        .with_data(DataSegment::binary(echo));
        Ok(vec![response])
    }

    fn handle_text(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::TextRequest(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a Text Request"),
        };

        if self.text.is_empty() {
            self.negotiator.begin()?;
            self.params_snapshot = Some(self.session.lock().unwrap().params.clone());
        }

        let pairs = match self.text.push(&pdu.data.bytes, parser.continue_flag) {
            Ok(Some(pairs)) => pairs,
            Ok(None) => {
                // More text coming; acknowledge with an empty response
                // carrying a tag for the continuation.
                let ttt = self.allocate_ttt();
                return Ok(vec![self.text_response(&pdu, Vec::new(), ttt, false)]);
            }
            Err(err) => {
                // The gate must not stay held across a failed reassembly.
                self.rollback_negotiation();
                return Err(err);
            }
        };

        let mut responses = Vec::new();
        for (key, value) in &pairs {
            if key == "SendTargets" {
                if value == "All" && !self.discovery {
                    self.rollback_negotiation();
                    return Ok(vec![self.reject(&pdu, RejectReason::ProtocolError)]);
                }
                responses.push(("TargetName".to_string(), self.config.target_name.clone()));
                continue;
            }
            let outcome = self.session.lock().unwrap().params.negotiate(key, value);
            match outcome {
                Ok(answer) => responses.push((key.clone(), answer)),
                Err(err) => {
                    log::warn!("text negotiation failed on {}: {}", key, err);
                    self.rollback_negotiation();
                    return Ok(vec![self.reject(&pdu, RejectReason::NegotiationReset)]);
                }
            }
        }

        self.negotiator.finish(true);
        self.params_snapshot = None;
        Ok(vec![self.text_response(&pdu, responses, RESERVED_TAG, true)])
    }

    fn text_response(
        &mut self,
        request: &ProtocolDataUnit,
        pairs: Vec<(String, String)>,
        ttt: u32,
        final_flag: bool,
    ) -> ProtocolDataUnit {
        let (exp_cmd_sn, max_cmd_sn) = self.window();
        ProtocolDataUnit::new(PduParser::TextResponse(TextResponseParser {
            final_flag,
            continue_flag: false,
            target_transfer_tag: ttt,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
        }))
        .with_itt(request.bhs.initiator_task_tag)
        .with_data(DataSegment::text_pairs(&pairs))
    }

    fn handle_logout(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::LogoutRequest(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a Logout Request"),
        };
        log::info!(
            "logout requested, reason {:?}, cid {}",
            parser.reason,
            parser.cid
        );

        let response_code = match parser.reason {
            LogoutReason::CloseSession | LogoutReason::CloseConnection => {
                crate::pdu::control::logout_response::SUCCESS
            }
            LogoutReason::RemoveConnectionForRecovery => {
                crate::pdu::control::logout_response::RECOVERY_NOT_SUPPORTED
            }
        };

        let (exp_cmd_sn, max_cmd_sn) = self.window();
        let params = self.session.lock().unwrap().params.clone();
        let response = ProtocolDataUnit::new(PduParser::LogoutResponse(LogoutResponseParser {
            response: response_code,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
            time_2_wait: params.default_time_2_wait as u16,
            time_2_retain: params.default_time_2_retain as u16,
        }))
        .with_itt(pdu.bhs.initiator_task_tag);

        // The logout stage ends the dispatch loop.
        self.phase = Phase::Closed;
        Ok(vec![response])
    }

    fn handle_snack(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        // Parsed for completeness; at ErrorRecoveryLevel 0 every SNACK is
        // answered with a Reject.
        Ok(vec![self.reject(&pdu, RejectReason::SnackReject)])
    }

    fn handle_task_management(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::TaskManagementRequest(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a TMF Request"),
        };

        let service =
            self.router
                .execute_tmf(parser.function, pdu.bhs.lun, parser.referenced_task_tag);
        let response = match service {
            TaskServiceResponse::FunctionComplete => TmfResponse::FunctionComplete,
            TaskServiceResponse::TaskDoesNotExist => TmfResponse::TaskDoesNotExist,
            TaskServiceResponse::IncorrectLogicalUnit => TmfResponse::LunDoesNotExist,
            TaskServiceResponse::FunctionNotSupported => TmfResponse::FunctionNotSupported,
            TaskServiceResponse::FunctionRejected => TmfResponse::FunctionRejected,
        };

        let (exp_cmd_sn, max_cmd_sn) = self.window();
        Ok(vec![ProtocolDataUnit::new(
            PduParser::TaskManagementResponse(TaskManagementResponseParser {
                response,
                stat_sn: self.stat_sn.fetch_increment().value(),
                exp_cmd_sn,
                max_cmd_sn,
            }),
        )
        .with_itt(pdu.bhs.initiator_task_tag)])
    }

    fn handle_scsi_command(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::ScsiCommand(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a SCSI Command"),
        };
        let itt = pdu.bhs.initiator_task_tag;
        let lun = pdu.bhs.lun;

        if !parser.write {
            return self.submit_command(lun, itt, &parser, Vec::new());
        }

        // Write command: stage the buffer and collect immediate data.
        let edtl = parser.expected_data_transfer_length as usize;
        let mut buffer = vec![0u8; edtl];
        let immediate = &pdu.data.bytes;
        if !immediate.is_empty() && !self.session.lock().unwrap().params.immediate_data {
            return Ok(vec![self.reject(&pdu, RejectReason::ProtocolError)]);
        }
        let received = immediate.len().min(edtl);
        buffer[..received].copy_from_slice(&immediate[..received]);

        if received >= edtl {
            return self.submit_command(lun, itt, &parser, buffer);
        }

        let mut assembly = WriteAssembly {
            parser,
            lun,
            itt,
            ttt: RESERVED_TAG,
            buffer,
            received: received as u32,
            r2t_sn: 0,
        };

        if assembly.parser.final_flag {
            // No unsolicited data follows; solicit the rest now.
            let r2t = self.solicit(&mut assembly);
            self.write_assemblies.insert(itt, assembly);
            return Ok(vec![r2t]);
        }

        // Unsolicited Data-Out PDUs follow with the reserved tag.
        self.write_assemblies.insert(itt, assembly);
        Ok(Vec::new())
    }

    fn handle_data_out(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser: DataOutParser = match &pdu.bhs.parser {
            PduParser::ScsiDataOut(p) => p.clone(),
            _ => unreachable!("dispatch guarantees a Data-Out"),
        };
        let itt = pdu.bhs.initiator_task_tag;

        let Some(assembly) = self.write_assemblies.get_mut(&itt) else {
            return Err(IscsiError::violation(format!(
                "Data-Out for unknown task 0x{:08x}",
                itt
            )));
        };
        if parser.target_transfer_tag != assembly.ttt {
            return Err(IscsiError::violation(format!(
                "Data-Out tag 0x{:08x} does not match the solicited 0x{:08x}",
                parser.target_transfer_tag, assembly.ttt
            )));
        }

        let offset = parser.buffer_offset as usize;
        let data = &pdu.data.bytes;
        // DataPDUInOrder negotiates to Yes: each Data-Out must continue
        // exactly where the previous one ended, or a duplicated PDU would
        // inflate the received count and submit a write with a hole.
        if offset != assembly.received as usize {
            return Err(IscsiError::violation(format!(
                "Data-Out offset {} does not continue the {} bytes already received",
                offset, assembly.received
            )));
        }
        if offset + data.len() > assembly.buffer.len() {
            return Err(IscsiError::violation(format!(
                "Data-Out overruns the write buffer: offset {} + {} > {}",
                offset,
                data.len(),
                assembly.buffer.len()
            )));
        }
        assembly.buffer[offset..offset + data.len()].copy_from_slice(data);
        assembly.received += data.len() as u32;

        let edtl = assembly.parser.expected_data_transfer_length;
        if assembly.received >= edtl {
            let assembly = self.write_assemblies.remove(&itt).unwrap();
            return self.submit_command(assembly.lun, itt, &assembly.parser, assembly.buffer);
        }

        if parser.final_flag {
            // The initiator finished this sequence; solicit the next burst.
            let mut assembly = self.write_assemblies.remove(&itt).unwrap();
            let r2t = self.solicit(&mut assembly);
            self.write_assemblies.insert(itt, assembly);
            return Ok(vec![r2t]);
        }

        Ok(Vec::new())
    }

    /// Builds the next R2T for a partially received write.
    fn solicit(&mut self, assembly: &mut WriteAssembly) -> ProtocolDataUnit {
        let max_burst = self.session.lock().unwrap().params.max_burst_length;
        let remaining = assembly.parser.expected_data_transfer_length - assembly.received;
        let desired = remaining.min(max_burst);
        let ttt = self.allocate_ttt();
        assembly.ttt = ttt;

        let (exp_cmd_sn, max_cmd_sn) = self.window();
        let r2t_sn = assembly.r2t_sn;
        assembly.r2t_sn += 1;
        ProtocolDataUnit::new(PduParser::Ready2Transfer(Ready2TransferParser {
            target_transfer_tag: ttt,
            stat_sn: self.stat_sn.get().value(),
            exp_cmd_sn,
            max_cmd_sn,
            r2t_sn,
            buffer_offset: assembly.received,
            desired_data_transfer_length: desired,
        }))
        .with_lun(assembly.lun)
        .with_itt(assembly.itt)
    }

    /// Hands a complete command to the task router and collects the PDUs
    /// its execution produced.
    fn submit_command(
        &mut self,
        lun: u64,
        itt: u32,
        parser: &ScsiCommandParser,
        write_data: Vec<u8>,
    ) -> Result<Vec<ProtocolDataUnit>> {
        let nexus = Nexus {
            isid: self.isid,
            tsih: self.tsih,
            lun,
            task_tag: itt,
        };
        let descriptor = CommandDescriptor::from_parser(nexus, parser, write_data);
        let sink = self.sink();
        self.router.enqueue(sink.clone(), descriptor)?;
        // Synchronous completion keeps response ordering deterministic for
        // the transport above us.
        self.router.drain();
        Ok(sink.take_outbound())
    }

    /// Builds a Reject PDU carrying the offending header and advances
    /// StatSN.
    pub(crate) fn reject(
        &mut self,
        offending: &ProtocolDataUnit,
        reason: RejectReason,
    ) -> ProtocolDataUnit {
        log::warn!(
            "rejecting {} PDU: {:?}",
            offending.opcode().name(),
            reason
        );
        let header = offending.serialize(&PduSettings::default());
        let (exp_cmd_sn, max_cmd_sn) = self.window();
        ProtocolDataUnit::new(PduParser::Reject(RejectParser {
            reason,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
            data_sn: 0,
        }))
        .with_itt(RESERVED_TAG)
        .with_data(DataSegment::binary(header[..crate::pdu::BHS_SIZE].to_vec()))
    }

    fn allocate_ttt(&mut self) -> u32 {
        let ttt = self.next_ttt;
        self.next_ttt = self.next_ttt.wrapping_add(1);
        if self.next_ttt == RESERVED_TAG {
            self.next_ttt = 1;
        }
        ttt
    }

    /// Restores the parameter snapshot and releases the negotiation gate.
    /// Every failure path out of an open negotiation must come through here.
    pub(crate) fn rollback_negotiation(&mut self) {
        if let Some(snapshot) = self.params_snapshot.take() {
            self.session.lock().unwrap().params = snapshot;
        }
        self.negotiator.finish(false);
    }

    /// Activates the digests and limits agreed during login.
    pub(crate) fn activate_negotiated_settings(&mut self) {
        let params = self.session.lock().unwrap().params.clone();
        self.settings.header_digest = params.header_digest;
        self.settings.data_digest = params.data_digest;
        log::info!(
            "negotiated settings active: header digest {:?}, data digest {:?}",
            params.header_digest,
            params.data_digest
        );
    }
}
