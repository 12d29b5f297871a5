//! Login phase: stage transitions and the negotiation gate
//!
//! Login walks the initiator from security negotiation through operational
//! negotiation into the full feature phase. Authentication is limited to
//! [`AuthMode::None`](super::AuthMode), so the security stage accepts an
//! `AuthMethod` offer that includes `None` and nothing else.
//!
//! [`LoginNegotiator`] is the mutual exclusion gate around parameter
//! negotiation: only one negotiation (login or a later text negotiation) may
//! be open at a time, and a failed one rolls the session parameters back to
//! the snapshot taken when it began.

use rand::Rng;

use crate::error::{IscsiError, Result};
use crate::pdu::login::{login_status_detail, VERSION};
use crate::pdu::{
    DataSegment, Isid, LoginRequestParser, LoginResponseParser, LoginStage, LoginStatusClass,
    PduParser, ProtocolDataUnit,
};

use super::{Connection, Phase};

/// Serializes parameter negotiations on a connection.
#[derive(Debug, Default)]
pub struct LoginNegotiator {
    in_progress: bool,
}

impl LoginNegotiator {
    pub fn new() -> Self {
        LoginNegotiator::default()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Opens a negotiation. Fails while another one is still open.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_progress {
            return Err(IscsiError::Session(
                "a parameter negotiation is already in progress".to_string(),
            ));
        }
        self.in_progress = true;
        Ok(())
    }

    /// Closes the current negotiation. The caller restores its parameter
    /// snapshot first when `success` is false.
    pub fn finish(&mut self, success: bool) {
        if !success {
            log::warn!("parameter negotiation failed, rolling back");
        }
        self.in_progress = false;
    }
}

fn assign_tsih() -> u16 {
    // Zero is reserved for "new session" in login requests.
    rand::thread_rng().gen_range(1..=u16::MAX)
}

impl Connection {
    pub(crate) fn handle_login(&mut self, pdu: ProtocolDataUnit) -> Result<Vec<ProtocolDataUnit>> {
        let parser = match &pdu.bhs.parser {
            PduParser::LoginRequest(p) => p.clone(),
            _ => unreachable!("caller guarantees a Login Request"),
        };
        let itt = pdu.bhs.initiator_task_tag;

        if parser.version_min > VERSION || parser.version_max < VERSION {
            log::warn!(
                "unsupported login version range {}..={}",
                parser.version_min,
                parser.version_max
            );
            return Ok(vec![self.login_reject(
                itt,
                &parser,
                LoginStatusClass::InitiatorError,
                login_status_detail::UNSUPPORTED_VERSION,
            )]);
        }

        if !self.login_seeded {
            self.seed_from_first_request(&pdu, &parser)?;
        }

        let stage = match self.phase {
            Phase::Login(stage) => stage,
            _ => unreachable!("caller guarantees the login phase"),
        };
        if parser.current_stage != stage {
            return Err(IscsiError::violation(format!(
                "login CSG {:?} does not match the connection stage {:?}",
                parser.current_stage, stage
            )));
        }

        // Login requests all carry the same CmdSN; the window only moves
        // once the full feature phase starts.
        self.session.lock().unwrap().accept_cmd_sn(parser.cmd_sn, true)?;

        let pairs = match self.login_text.push(&pdu.data.bytes, parser.continue_flag) {
            Ok(Some(pairs)) => pairs,
            Ok(None) => {
                // Partial text; acknowledge and wait for the rest.
                return Ok(vec![self.login_response(itt, stage, stage, false, Vec::new())]);
            }
            Err(err) => {
                // The gate must not stay held across a failed reassembly.
                self.rollback_negotiation();
                return Err(err);
            }
        };

        let mut responses = Vec::with_capacity(pairs.len());
        for (key, value) in &pairs {
            match self.negotiate_login_key(key, value) {
                Ok(Some(answer)) => responses.push((key.clone(), answer)),
                Ok(None) => {}
                Err(detail) => {
                    self.rollback_negotiation();
                    return Ok(vec![self.login_reject(
                        itt,
                        &parser,
                        LoginStatusClass::InitiatorError,
                        detail,
                    )]);
                }
            }
        }

        if !parser.transit {
            return Ok(vec![self.login_response(itt, stage, stage, false, responses)]);
        }

        let next = parser.next_stage;
        if next == LoginStage::FullFeaturePhase {
            if !self.discovery
                && self
                    .session
                    .lock()
                    .unwrap()
                    .params
                    .initiator_name
                    .is_none()
            {
                self.rollback_negotiation();
                return Ok(vec![self.login_reject(
                    itt,
                    &parser,
                    LoginStatusClass::InitiatorError,
                    login_status_detail::MISSING_PARAMETER,
                )]);
            }

            self.tsih = assign_tsih();
            {
                let mut session = self.session.lock().unwrap();
                session.tsih = self.tsih;
            }
            let response = self.login_response(itt, stage, next, true, responses);
            self.phase = Phase::FullFeature;
            self.negotiator.finish(true);
            self.params_snapshot = None;
            self.activate_negotiated_settings();
            log::info!(
                "login complete: isid {:02x?}, tsih 0x{:04x}, discovery={}",
                self.isid.0,
                self.tsih,
                self.discovery
            );
            return Ok(vec![response]);
        }

        let response = self.login_response(itt, stage, next, true, responses);
        self.phase = Phase::Login(next);
        Ok(vec![response])
    }

    /// The first login request fixes the session identity and command
    /// numbering, and selects the starting stage.
    fn seed_from_first_request(
        &mut self,
        pdu: &ProtocolDataUnit,
        parser: &LoginRequestParser,
    ) -> Result<()> {
        let (isid, tsih) = Isid::from_lun_field(pdu.bhs.lun);
        if tsih != 0 {
            // Session reinstatement is not offered; a nonzero TSIH asks to
            // rejoin a session this target never handed out.
            return Err(IscsiError::Session(format!(
                "unknown session handle 0x{:04x}",
                tsih
            )));
        }
        self.isid = isid;
        self.cid = parser.cid;
        self.phase = Phase::Login(parser.current_stage);
        {
            let mut session = self.session.lock().unwrap();
            session.isid = isid;
            session.seed_cmd_sn(parser.cmd_sn);
        }
        self.negotiator.begin()?;
        self.params_snapshot = Some(self.session.lock().unwrap().params.clone());
        self.login_seeded = true;
        log::debug!(
            "login opened: isid {:02x?}, cid {}, starting stage {:?}",
            isid.0,
            parser.cid,
            parser.current_stage
        );
        Ok(())
    }

    /// Applies one login key. `Ok(None)` means the key produced no answer
    /// pair; `Err` carries the status detail for the login reject.
    fn negotiate_login_key(&mut self, key: &str, value: &str) -> std::result::Result<Option<String>, u8> {
        match key {
            "AuthMethod" => {
                // The only authentication on offer.
                if value.split(',').any(|alt| alt == "None") {
                    Ok(Some("None".to_string()))
                } else {
                    log::warn!("initiator offered AuthMethod={} without None", value);
                    Err(login_status_detail::AUTHENTICATION_FAILURE)
                }
            }
            "SessionType" => {
                match self.session.lock().unwrap().params.negotiate(key, value) {
                    Ok(answer) => {
                        self.discovery = value == "Discovery";
                        Ok(Some(answer))
                    }
                    Err(_) => Err(login_status_detail::INITIATOR_ERROR),
                }
            }
            "TargetName" => {
                if value != self.config().target_name {
                    log::warn!("login for unknown target {:?}", value);
                    return Err(login_status_detail::NOT_FOUND);
                }
                let _ = self.session.lock().unwrap().params.negotiate(key, value);
                // Declarative from the initiator; not echoed.
                Ok(None)
            }
            _ => match self.session.lock().unwrap().params.negotiate(key, value) {
                Ok(answer) => Ok(Some(answer)),
                Err(err) => {
                    log::warn!("login negotiation failed on {}: {}", key, err);
                    Err(login_status_detail::INITIATOR_ERROR)
                }
            },
        }
    }

    fn login_response(
        &mut self,
        itt: u32,
        current_stage: LoginStage,
        next_stage: LoginStage,
        transit: bool,
        pairs: Vec<(String, String)>,
    ) -> ProtocolDataUnit {
        let (exp_cmd_sn, max_cmd_sn) = {
            let session = self.session.lock().unwrap();
            (session.exp_cmd_sn(), session.max_cmd_sn())
        };
        ProtocolDataUnit::new(PduParser::LoginResponse(LoginResponseParser {
            transit,
            continue_flag: false,
            current_stage,
            next_stage,
            version_max: VERSION,
            version_active: VERSION,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
            status_class: LoginStatusClass::Success,
            status_detail: login_status_detail::SUCCESS,
        }))
        .with_lun(self.isid.to_lun_field(self.tsih))
        .with_itt(itt)
        .with_data(DataSegment::text_pairs(&pairs))
    }

    /// Builds a failing login response and closes the connection; a failed
    /// login never continues.
    fn login_reject(
        &mut self,
        itt: u32,
        request: &LoginRequestParser,
        status_class: LoginStatusClass,
        status_detail: u8,
    ) -> ProtocolDataUnit {
        let (exp_cmd_sn, max_cmd_sn) = {
            let session = self.session.lock().unwrap();
            (session.exp_cmd_sn(), session.max_cmd_sn())
        };
        self.phase = Phase::Closed;
        ProtocolDataUnit::new(PduParser::LoginResponse(LoginResponseParser {
            transit: false,
            continue_flag: false,
            current_stage: request.current_stage,
            next_stage: request.current_stage,
            version_max: VERSION,
            version_active: VERSION,
            stat_sn: self.stat_sn.fetch_increment().value(),
            exp_cmd_sn,
            max_cmd_sn,
            status_class,
            status_detail,
        }))
        .with_lun(self.isid.to_lun_field(self.tsih))
        .with_itt(itt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Opcode;
    use crate::scsi::MemoryBlockDevice;
    use crate::task::{LogicalUnit, TaskRouter};
    use std::sync::Arc;

    use super::super::ConnectionConfig;

    fn connection() -> Connection {
        let router = Arc::new(TaskRouter::new());
        router.register(
            0,
            Arc::new(LogicalUnit::new(Arc::new(MemoryBlockDevice::new(512, 8)))),
        );
        Connection::new(ConnectionConfig::default(), router)
    }

    fn login_request(
        transit: bool,
        csg: LoginStage,
        nsg: LoginStage,
        pairs: &[(&str, &str)],
    ) -> ProtocolDataUnit {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProtocolDataUnit::new(PduParser::LoginRequest(LoginRequestParser {
            transit,
            continue_flag: false,
            current_stage: csg,
            next_stage: nsg,
            version_max: VERSION,
            version_min: VERSION,
            cid: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
        }))
        .immediate()
        .with_lun(Isid([0x40, 0, 0, 0, 0, 1]).to_lun_field(0))
        .with_itt(0xAB01)
        .with_data(DataSegment::text_pairs(&pairs))
    }

    fn operational_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("InitiatorName", "iqn.2005-03.org.example:host1"),
            ("TargetName", "iqn.2026-08.org.example:target0"),
            ("SessionType", "Normal"),
            ("MaxRecvDataSegmentLength", "4096"),
        ]
    }

    #[test]
    fn test_single_stage_login_to_full_feature() {
        let mut connection = connection();
        let request = login_request(
            true,
            LoginStage::OperationalNegotiation,
            LoginStage::FullFeaturePhase,
            &operational_pairs(),
        );
        let responses = connection.handle(request).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].opcode(), Opcode::LoginResponse);

        match &responses[0].bhs.parser {
            PduParser::LoginResponse(p) => {
                assert!(p.transit);
                assert_eq!(p.current_stage, LoginStage::OperationalNegotiation);
                assert_eq!(p.next_stage, LoginStage::FullFeaturePhase);
                assert_eq!(p.status_class, LoginStatusClass::Success);
            }
            other => panic!("unexpected parser {other:?}"),
        }

        // The target assigned a session handle and entered full feature.
        let (_, tsih) = Isid::from_lun_field(responses[0].bhs.lun);
        assert_ne!(tsih, 0);
        assert_eq!(connection.phase(), Phase::FullFeature);
        assert_eq!(connection.session.lock().unwrap().exp_cmd_sn(), 1);

        // The peer's announced limit stuck.
        assert_eq!(
            connection
                .session
                .lock()
                .unwrap()
                .params
                .peer_max_recv_data_segment_length,
            4096
        );
    }

    #[test]
    fn test_two_stage_login() {
        let mut connection = connection();
        let first = login_request(
            true,
            LoginStage::SecurityNegotiation,
            LoginStage::OperationalNegotiation,
            &[
                ("InitiatorName", "iqn.2005-03.org.example:host1"),
                ("TargetName", "iqn.2026-08.org.example:target0"),
                ("AuthMethod", "None"),
            ],
        );
        let responses = connection.handle(first).unwrap();
        match &responses[0].bhs.parser {
            PduParser::LoginResponse(p) => {
                assert!(p.transit);
                assert_eq!(p.next_stage, LoginStage::OperationalNegotiation);
                let pairs = responses[0].data.text().unwrap();
                assert!(pairs.contains(&("AuthMethod".to_string(), "None".to_string())));
            }
            other => panic!("unexpected parser {other:?}"),
        }
        assert_eq!(
            connection.phase(),
            Phase::Login(LoginStage::OperationalNegotiation)
        );

        let second = login_request(
            true,
            LoginStage::OperationalNegotiation,
            LoginStage::FullFeaturePhase,
            &[],
        );
        connection.handle(second).unwrap();
        assert_eq!(connection.phase(), Phase::FullFeature);
    }

    #[test]
    fn test_auth_without_none_rejected() {
        let mut connection = connection();
        let request = login_request(
            false,
            LoginStage::SecurityNegotiation,
            LoginStage::SecurityNegotiation,
            &[("AuthMethod", "CHAP")],
        );
        let responses = connection.handle(request).unwrap();
        match &responses[0].bhs.parser {
            PduParser::LoginResponse(p) => {
                assert_eq!(p.status_class, LoginStatusClass::InitiatorError);
                assert_eq!(
                    p.status_detail,
                    login_status_detail::AUTHENTICATION_FAILURE
                );
            }
            other => panic!("unexpected parser {other:?}"),
        }
        assert!(connection.is_closed());
    }

    #[test]
    fn test_missing_initiator_name_rejected() {
        let mut connection = connection();
        let request = login_request(
            true,
            LoginStage::OperationalNegotiation,
            LoginStage::FullFeaturePhase,
            &[("TargetName", "iqn.2026-08.org.example:target0")],
        );
        let responses = connection.handle(request).unwrap();
        match &responses[0].bhs.parser {
            PduParser::LoginResponse(p) => {
                assert_eq!(p.status_class, LoginStatusClass::InitiatorError);
                assert_eq!(p.status_detail, login_status_detail::MISSING_PARAMETER);
            }
            other => panic!("unexpected parser {other:?}"),
        }
        assert!(connection.is_closed());
    }

    #[test]
    fn test_wrong_target_name_not_found() {
        let mut connection = connection();
        let request = login_request(
            true,
            LoginStage::OperationalNegotiation,
            LoginStage::FullFeaturePhase,
            &[
                ("InitiatorName", "iqn.2005-03.org.example:host1"),
                ("TargetName", "iqn.2026-08.org.example:elsewhere"),
            ],
        );
        let responses = connection.handle(request).unwrap();
        match &responses[0].bhs.parser {
            PduParser::LoginResponse(p) => {
                assert_eq!(p.status_class, LoginStatusClass::InitiatorError);
                assert_eq!(p.status_detail, login_status_detail::NOT_FOUND);
            }
            other => panic!("unexpected parser {other:?}"),
        }
    }

    #[test]
    fn test_stage_mismatch_is_hard_error() {
        let mut connection = connection();
        let first = login_request(
            false,
            LoginStage::SecurityNegotiation,
            LoginStage::SecurityNegotiation,
            &[("AuthMethod", "None")],
        );
        connection.handle(first).unwrap();

        // Jumping to operational negotiation without a transit is a
        // protocol violation, not a login reject.
        let skipped = login_request(
            false,
            LoginStage::OperationalNegotiation,
            LoginStage::OperationalNegotiation,
            &[],
        );
        assert!(connection.handle(skipped).is_err());
    }

    #[test]
    fn test_session_reinstatement_refused() {
        let mut connection = connection();
        let request = login_request(
            true,
            LoginStage::OperationalNegotiation,
            LoginStage::FullFeaturePhase,
            &operational_pairs(),
        )
        .with_lun(Isid([0x40, 0, 0, 0, 0, 1]).to_lun_field(0x77));
        assert!(connection.handle(request).is_err());
    }

    #[test]
    fn test_malformed_login_text_releases_gate() {
        let mut connection = connection();
        let request = login_request(
            false,
            LoginStage::SecurityNegotiation,
            LoginStage::SecurityNegotiation,
            &[],
        )
        .with_data(DataSegment::binary(vec![0xFE, 0xFF]));
        assert!(connection.handle(request).is_err());
        assert!(!connection.negotiator.in_progress());
        assert!(connection.params_snapshot.is_none());
    }

    #[test]
    fn test_negotiator_gate() {
        let mut gate = LoginNegotiator::new();
        assert!(gate.begin().is_ok());
        assert!(gate.begin().is_err());
        gate.finish(true);
        assert!(gate.begin().is_ok());
    }
}
