//! Health monitoring supervisor.
//!
//! Two cooperating loops share the session:
//!
//! - the background loop reopens the modem, re-establishes the GPS
//!   connection and re-registers for unsolicited notifications, at a low
//!   tick adjusted by platform power state. After three consecutive
//!   all-healthy checks it stops itself; any component that hits an I/O
//!   error calls [`HealthMonitor::ensure_running`] to bring it back.
//! - the active-session loop re-evaluates the session's abort triggers
//!   every second and winds down once the session goes inactive.
//!
//! Every corrective action is idempotent and gated by the resource's
//! keep-open retry interval, so a healthy system sees no side effects.

pub mod power;

use std::sync::{Arc, Weak};
use std::time::Duration;

use cposd_config::SharedConfig;

use crate::common::lifecycle::{LifecycleCell, RunState};
use crate::common::monotime;
use crate::gpslink::GpsLink;
use crate::modem::ModemChannel;
use crate::session::{Session, SupervisorHook};
use self::power::{PowerMonitor, PowerState};

const HEALTHY_CHECKS_TO_IDLE: u32 = 3;
const SLEEP_STEP: Duration = Duration::from_millis(50);

pub struct HealthMonitor {
    me: Weak<HealthMonitor>,
    config: SharedConfig,
    session: Arc<Session>,
    modem: Arc<ModemChannel>,
    gps: Arc<GpsLink>,
    power: PowerMonitor,
    background_state: LifecycleCell,
    active_state: LifecycleCell,
}

impl HealthMonitor {
    pub fn new(
        config: SharedConfig,
        session: Arc<Session>,
        modem: Arc<ModemChannel>,
        gps: Arc<GpsLink>,
    ) -> Arc<Self> {
        let power = PowerMonitor::new(&config.monitor.power_state_path);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            session,
            modem,
            gps,
            power,
            background_state: LifecycleCell::default(),
            active_state: LifecycleCell::default(),
        })
    }

    pub fn background_running(&self) -> bool {
        self.background_state.is_running()
    }

    pub fn active_running(&self) -> bool {
        self.active_state.is_running()
    }

    /// Start the background loop if it is not already running.
    pub fn start(self: &Arc<Self>) {
        if !self.background_state.can_start() {
            return;
        }
        self.background_state.set(RunState::Starting);
        self.power.init();
        let monitor = Arc::clone(self);
        if std::thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || monitor.background_loop())
            .is_err()
        {
            self.background_state.set(RunState::CantRun);
        }
    }

    /// Start the active-session loop; runs only while a session is active.
    pub fn start_active(self: &Arc<Self>) {
        if !self.active_state.can_start() {
            return;
        }
        self.active_state.set(RunState::Starting);
        let monitor = Arc::clone(self);
        if std::thread::Builder::new()
            .name("active-monitor".into())
            .spawn(move || monitor.active_loop())
            .is_err()
        {
            self.active_state.set(RunState::CantRun);
        }
    }

    pub fn stop(&self) {
        self.power.close();
        for (name, cell) in [
            ("background", &self.background_state),
            ("active", &self.active_state),
        ] {
            if cell.can_start() {
                continue;
            }
            cell.request_terminate();
            if !cell.wait_terminated(Duration::from_secs(1)) {
                tracing::warn!(loop_name = name, "monitor loop unresponsive at stop");
            }
        }
    }

    /// Sleep in small steps so a stop request lands promptly.
    fn nap(&self, cell: &LifecycleCell, total_ms: u64) -> bool {
        let mut slept = Duration::ZERO;
        let total = Duration::from_millis(total_ms);
        while slept < total {
            if !cell.is_running() {
                return false;
            }
            std::thread::sleep(SLEEP_STEP);
            slept += SLEEP_STEP;
        }
        cell.is_running()
    }

    fn background_loop(self: Arc<Self>) {
        self.background_state.set(RunState::Running);
        tracing::debug!("background monitor running");
        // let the failing caller unwind before poking its resource
        std::thread::sleep(Duration::from_millis(20));
        let interval = self.config.monitor.interval_ms.max(100);
        let mut last_check: u64 = 0;
        let mut healthy_streak: u32 = 0;
        while self.background_state.is_running() {
            if last_check == 0 || monotime::msec_since(last_check) >= interval {
                let modem_ok = self.check_modem();
                let gps_ok = self.check_gps();
                let registration_ok = self.check_registration();
                last_check = monotime::msec_now();
                if modem_ok && gps_ok && registration_ok {
                    healthy_streak += 1;
                    if healthy_streak >= HEALTHY_CHECKS_TO_IDLE {
                        tracing::debug!("all resources healthy, background monitor idling");
                        break;
                    }
                } else {
                    healthy_streak = 0;
                    tracing::debug!(modem_ok, gps_ok, registration_ok, "resource check");
                }
            }
            let sleep_ms = match self.power.read() {
                PowerState::Active => interval / 4,
                PowerState::Suspended => interval,
                PowerState::Unavailable => {
                    self.power.init();
                    interval / 2
                }
            };
            if !self.nap(&self.background_state, sleep_ms.max(100)) {
                break;
            }
        }
        self.background_state.set(RunState::Terminated);
        tracing::debug!("background monitor exited");
    }

    fn active_loop(self: Arc<Self>) {
        self.active_state.set(RunState::Running);
        tracing::debug!("active-session monitor running");
        let tick = self.config.monitor.active_interval_ms.max(100);
        while self.active_state.is_running() {
            self.session.enforce_service_limits();
            if !self.nap(&self.active_state, tick) {
                break;
            }
            if !self.session.is_active() {
                break;
            }
        }
        self.active_state.set(RunState::Terminated);
        tracing::debug!("active-session monitor exited");
    }

    /// Reopen the modem when its reader died, respecting the retry interval.
    fn check_modem(&self) -> bool {
        if !self.modem.keep_open.enabled() {
            return true;
        }
        if self.modem.reader_running() {
            return true;
        }
        if !self.modem.keep_open.due() {
            return false;
        }
        match self.modem.open() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "modem reopen failed");
                false
            }
        }
    }

    fn check_gps(&self) -> bool {
        if !self.gps.keep_open.enabled() {
            return true;
        }
        self.gps.maintain()
    }

    /// Re-register for unsolicited notifications after a long quiet window
    /// with no registration confirmation.
    fn check_registration(&self) -> bool {
        if !self.modem.keep_open.enabled() || !self.modem.reader_running() {
            return true;
        }
        if self.modem.registered_for_unsolicited() {
            return true;
        }
        let quiet = self.config.monitor.registration_quiet_ms;
        let quiet_rx = monotime::msec_since(self.modem.last_data_received()) > quiet;
        let quiet_tx = monotime::msec_since(self.modem.last_data_sent()) > quiet;
        let recent_unsol = monotime::msec_since(self.modem.unsolicited_activity_at()) < quiet;
        if quiet_rx && quiet_tx && !recent_unsol {
            self.modem.register_for_unsolicited()
        } else {
            tracing::debug!("skipping +CPOSR registration, channel recently active");
            true
        }
    }
}

impl SupervisorHook for HealthMonitor {
    fn ensure_running(&self) {
        if let Some(me) = self.me.upgrade() {
            me.start();
        }
    }

    fn session_started(&self) {
        if let Some(me) = self.me.upgrade() {
            me.start_active();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{MultSets, PosMeas, RequestRecord, RrlpMeas};
    use crate::xml::GppXmlCodec;

    fn test_rig() -> Arc<HealthMonitor> {
        let mut config = cposd_config::StackConfig::default();
        config.monitor.power_state_path = String::new();
        config.monitor.active_interval_ms = 100;
        let config = Arc::new(config);
        let session = Session::new(config.clone(), Arc::new(GppXmlCodec::new()));
        let modem = ModemChannel::new(config.clone(), Arc::new(GppXmlCodec::new()));
        let gps = GpsLink::new(config.clone());
        HealthMonitor::new(config, session.clone(), modem, gps)
    }

    #[test]
    fn active_loop_winds_down_without_session() {
        let monitor = test_rig();
        monitor.start_active();
        assert!(monitor.active_state.wait_terminated(Duration::from_secs(3)));
    }

    #[test]
    fn active_loop_runs_while_session_active() {
        let monitor = test_rig();
        let mut req = RequestRecord::new_pos_meas(PosMeas::Rrlp(RrlpMeas {
            resp_time_seconds: 60,
            mult_sets: MultSets::One,
            ..RrlpMeas::default()
        }));
        req.status.received_at = monotime::msec_now().max(1);
        monitor.session.store_request(req);

        monitor.start_active();
        std::thread::sleep(Duration::from_millis(300));
        assert!(monitor.active_running());

        // deactivate: stop postdating the request ends the session
        let mut stopped = monitor.session.request_snapshot();
        stopped.status.stop_sent_at = stopped.status.received_at + 1;
        monitor.session.store_request(stopped);
        assert!(monitor.active_state.wait_terminated(Duration::from_secs(3)));
    }

    #[test]
    fn stop_is_safe_when_never_started() {
        let monitor = test_rig();
        monitor.stop();
        assert!(!monitor.background_running());
    }
}
