//! Session/request state machine.
//!
//! Ties a network-originated position request to its eventual response and
//! decides when to abort. Exactly one session is active at a time; a new
//! incoming request overwrites the in-flight one.
//!
//! The predicates here are pure functions of the request record so the
//! timeout/sufficiency rules stay unit-testable without I/O. The "is there
//! an active session" question reduces to timestamp ordering: a request is
//! live while `received_at` postdates `stop_sent_at`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use cposd_config::SharedConfig;

use crate::common::monotime;
use crate::records::{MultSets, PosMeas, RequestRecord, ResponseKind, ResponseRecord};
use crate::scanner::AckClass;
use crate::xml::XmlTranslator;

/// Safety margin over the advertised service time before a session is
/// force-aborted: 1.8x, expressed in ms per advertised second.
const SERVICE_TIME_MARGIN_MS_PER_SEC: u64 = 1800;

/// Parsed network requests enter the session here (modem side).
pub trait RequestSink: Send + Sync {
    fn on_network_request(&self, req: RequestRecord);
}

/// Positioning-process events enter the session here (GPS side).
pub trait ResponseSink: Send + Sync {
    fn on_position_response(&self, resp: ResponseRecord);
    fn on_abort_request(&self);
    /// A position request arriving over the link (the channel is symmetric);
    /// recorded as the current request without restarting the session.
    fn on_position_request(&self, req: RequestRecord);
}

/// Outbound channel toward the positioning process.
pub trait PositionPort: Send + Sync {
    fn send_position_request(&self, req: &RequestRecord) -> anyhow::Result<()>;
    fn send_abort(&self) -> anyhow::Result<()>;
    fn send_stop_all(&self) -> anyhow::Result<()>;
}

/// Outbound channel toward the modem.
pub trait ModemPort: Send + Sync {
    /// Deliver a rendered +CPOS payload; returns the terminator class the
    /// modem answered with.
    fn send_position_response(&self, xml: &[u8]) -> anyhow::Result<AckClass>;
}

/// Hook for kicking the supervisor when a session starts or a port fails.
pub trait SupervisorHook: Send + Sync {
    fn ensure_running(&self);
    fn session_started(&self);
}

/*
 * Pure predicates
 */

/// A session is active iff the request is a position measurement, it has
/// been received, and no stop postdates it.
pub fn is_session_active(req: &RequestRecord) -> bool {
    req.is_pos_meas()
        && req.status.received_at > 0
        && req.status.received_at > req.status.stop_sent_at
}

/// Have enough responses been delivered to fulfill the request?
/// Periodic RRC with `rep_amount == 0` runs until explicitly stopped and is
/// never sufficient by count; RRLP "multiple sets" behaves the same way.
pub fn responses_sufficient(req: &RequestRecord) -> bool {
    match req.pos_meas {
        PosMeas::Rrc(m) => {
            m.rep_amount != 0 && req.status.responses_sent >= m.rep_amount.max(0) as u32
        }
        PosMeas::Rrlp(m) => {
            m.mult_sets != MultSets::Multiple && req.status.responses_sent >= 1
        }
        _ => true,
    }
}

/// Seconds the network allotted to service the request; None = unbounded.
pub fn required_service_time_secs(req: &RequestRecord) -> Option<u64> {
    match req.pos_meas {
        PosMeas::Rrc(m) => {
            if m.rep_amount == 0 {
                None
            } else {
                let amount = m.rep_amount.max(0) as u64;
                let interval = m.rep_interval_seconds.max(0) as u64;
                Some(amount * interval + interval)
            }
        }
        PosMeas::Rrlp(m) => {
            if m.mult_sets == MultSets::Multiple {
                None
            } else if req.status.responses_sent < 1 {
                Some(m.resp_time_seconds.max(0) as u64 + 1)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Abort triggers, evaluated by the active-session monitor every tick:
/// (a) the request is fulfilled and no abort was sent yet;
/// (b) elapsed time exceeds 1.8x the bounded service time;
/// (c) nothing was delivered within the no-fix window.
pub fn abort_due(req: &RequestRecord, now_ms: u64, no_fix_abort_ms: u64) -> bool {
    let s = &req.status;
    if s.received_at == 0 {
        return false;
    }
    let elapsed = now_ms.saturating_sub(s.received_at);

    if s.received_at <= s.response_from_gps_at
        && s.received_at <= s.response_sent_to_modem_at
        && s.received_at > s.stop_sent_at
        && responses_sufficient(req)
    {
        return true;
    }
    if s.received_at > s.stop_sent_at {
        if let Some(required) = required_service_time_secs(req) {
            if elapsed > required * SERVICE_TIME_MARGIN_MS_PER_SEC {
                return true;
            }
        }
        if s.responses_sent == 0 && elapsed > no_fix_abort_ms {
            return true;
        }
    }
    false
}

/*
 * Session
 */

pub struct Session {
    config: SharedConfig,
    translator: Arc<dyn XmlTranslator>,
    request: Mutex<RequestRecord>,
    response: Mutex<ResponseRecord>,
    /// Last +CPOS delivery attempt; zero = none since the request arrived.
    sending_cpos_at: AtomicU64,
    /// The current response cycle was acknowledged by the modem.
    sent_cpos_ok: AtomicBool,
    gps: OnceLock<Arc<dyn PositionPort>>,
    modem: OnceLock<Arc<dyn ModemPort>>,
    supervisor: OnceLock<Arc<dyn SupervisorHook>>,
}

impl Session {
    pub fn new(config: SharedConfig, translator: Arc<dyn XmlTranslator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            translator,
            request: Mutex::new(RequestRecord::default()),
            response: Mutex::new(ResponseRecord::default()),
            sending_cpos_at: AtomicU64::new(0),
            sent_cpos_ok: AtomicBool::new(false),
            gps: OnceLock::new(),
            modem: OnceLock::new(),
            supervisor: OnceLock::new(),
        })
    }

    /// Wire the outbound ports and the supervisor; called once at startup.
    pub fn attach(
        &self,
        gps: Arc<dyn PositionPort>,
        modem: Arc<dyn ModemPort>,
        supervisor: Arc<dyn SupervisorHook>,
    ) {
        let _ = self.gps.set(gps);
        let _ = self.modem.set(modem);
        let _ = self.supervisor.set(supervisor);
    }

    pub fn request_snapshot(&self) -> RequestRecord {
        *self.request.lock().unwrap()
    }

    pub fn response_snapshot(&self) -> ResponseRecord {
        self.response.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        is_session_active(&self.request_snapshot())
    }

    /// Store a position-measurement request decoded off the GPS link.
    pub fn store_request(&self, req: RequestRecord) {
        *self.request.lock().unwrap() = req;
    }

    pub fn store_response(&self, resp: ResponseRecord) {
        *self.response.lock().unwrap() = resp;
    }

    /// Stamp "a response arrived from the positioning process".
    pub fn stamp_response_received(&self) {
        let mut req = self.request.lock().unwrap();
        req.status.response_from_gps_at = monotime::msec_now();
    }

    /// Evaluate the abort triggers and issue the abort if one fires.
    /// Called by the active-session monitor every tick.
    pub fn enforce_service_limits(&self) {
        let req = self.request_snapshot();
        if abort_due(&req, monotime::msec_now(), self.config.monitor.no_fix_abort_ms) {
            tracing::info!(
                responses_sent = req.status.responses_sent,
                "service limits reached, stopping positioning"
            );
            self.send_abort_to_gps();
        }
    }

    /// Send the measurement abort and stamp the stop. The stamp makes the
    /// session inactive, which winds down the active monitor.
    pub fn send_abort_to_gps(&self) {
        let result = match self.gps.get() {
            Some(gps) => gps.send_abort(),
            None => return,
        };
        match result {
            Ok(()) => {
                let mut req = self.request.lock().unwrap();
                req.status.stop_sent_at = monotime::msec_now();
                req.dbg.abort_id += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "abort toward positioning process failed");
                self.kick_supervisor();
            }
        }
    }

    fn kick_supervisor(&self) {
        if let Some(s) = self.supervisor.get() {
            s.ensure_running();
        }
    }

    fn forward_request_to_gps(&self, req: &RequestRecord) {
        let Some(gps) = self.gps.get() else { return };
        {
            let mut stored = self.request.lock().unwrap();
            stored.dbg.requested_from_gps_at = monotime::msec_now();
        }
        if let Err(e) = gps.send_position_request(req) {
            tracing::warn!(error = %e, "request toward positioning process failed");
            self.kick_supervisor();
        }
    }

    /// Deliver the current response over the modem, rate-limited to one
    /// attempt per configured window. Returns true when the modem accepted.
    fn deliver_response_to_modem(&self) -> bool {
        let resp = self.response_snapshot();
        if !matches!(resp.kind, ResponseKind::Location | ResponseKind::GpsMeas) {
            tracing::debug!(kind = ?resp.kind, "not delivering non-location response");
            return false;
        }
        let req = self.request_snapshot();
        // a periodic session keeps sending past the first accept until its
        // repeat count is satisfied (or forever, for run-until-stopped)
        let send_multiple =
            matches!(req.pos_meas, PosMeas::Rrc(_)) && !responses_sufficient(&req);
        if self.sent_cpos_ok.load(Ordering::Acquire) && !send_multiple {
            return false;
        }
        let last_attempt = self.sending_cpos_at.load(Ordering::Acquire);
        if last_attempt != 0
            && monotime::msec_since(last_attempt) < self.config.session.response_rate_limit_ms
        {
            tracing::debug!("response delivery rate-limited");
            return false;
        }
        self.sending_cpos_at.store(monotime::msec_now(), Ordering::Release);

        let xml = match self.translator.render_response(&resp) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::warn!(error = %e, "response rendering failed");
                return false;
            }
        };
        let Some(modem) = self.modem.get() else {
            return false;
        };
        match modem.send_position_response(&xml) {
            Ok(AckClass::Ok) => {
                let (sent, received_at) = {
                    let mut req = self.request.lock().unwrap();
                    req.status.responses_sent += 1;
                    req.status.response_sent_to_modem_at = monotime::msec_now();
                    (req.status.responses_sent, req.status.received_at)
                };
                self.sent_cpos_ok.store(true, Ordering::Release);
                tracing::info!(
                    responses_sent = sent,
                    ttff_ms = monotime::msec_since(received_at),
                    "position response accepted by modem"
                );
                true
            }
            Ok(AckClass::Error) => {
                tracing::warn!("modem rejected position response");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "position response delivery failed");
                false
            }
        }
    }

    /// Clear the measurement state once the request is fulfilled.
    fn clear_fulfilled_request(&self) {
        let mut req = self.request.lock().unwrap();
        req.kind = crate::records::RequestKind::None;
        req.pos_meas = PosMeas::None;
    }
}

impl RequestSink for Session {
    /// A network-originated request parsed out of an unsolicited +CPOSR.
    fn on_network_request(&self, mut req: RequestRecord) {
        let now = monotime::msec_now();
        match req.pos_meas {
            PosMeas::Abort => {
                req.status.stop_sent_at = now;
                req.dbg.abort_id += 1;
                *self.request.lock().unwrap() = req;
                tracing::info!("network aborted position session");
                self.forward_request_to_gps(&req);
            }
            PosMeas::Rrlp(_) | PosMeas::Rrc(_) => {
                req.status.received_at = now;
                req.status.response_from_gps_at = 0;
                req.status.response_sent_to_modem_at = 0;
                req.status.stop_sent_at = 0;
                req.status.responses_sent = 0;
                req.dbg.requested_by_network_at = now;
                req.dbg.request_id += 1;
                self.sent_cpos_ok.store(false, Ordering::Release);
                self.sending_cpos_at.store(0, Ordering::Release);
                *self.request.lock().unwrap() = req;
                tracing::info!(pos_meas = ?req.pos_meas, "network position request received");
                self.forward_request_to_gps(&req);
                if let Some(s) = self.supervisor.get() {
                    s.session_started();
                }
            }
            _ => {
                // assist data and friends are recorded for reference only
                *self.request.lock().unwrap() = req;
            }
        }
    }
}

impl ResponseSink for Session {
    fn on_position_response(&self, resp: ResponseRecord) {
        self.store_response(resp);
        self.stamp_response_received();
        let accepted = self.deliver_response_to_modem();
        if accepted && responses_sufficient(&self.request_snapshot()) {
            self.send_abort_to_gps();
            self.clear_fulfilled_request();
        }
    }

    fn on_abort_request(&self) {
        let mut aborted = RequestRecord::new_pos_meas(PosMeas::Abort);
        aborted.status.received_at = 0;
        aborted.status.stop_sent_at = monotime::msec_now();
        *self.request.lock().unwrap() = aborted;
        tracing::info!("positioning process requested measurement abort");
    }

    fn on_position_request(&self, req: RequestRecord) {
        self.store_request(req);
    }
}
