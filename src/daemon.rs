//! Daemon assembly and lifecycle.
//!
//! Builds the session, modem channel, GPS link, debug pass-through listener
//! and health monitor, wires them together through their trait seams, and
//! owns the ordered shutdown. Construction does no I/O; `start` opens the
//! channels best-effort and leaves recovery to the health monitor.

use std::sync::{Arc, Weak};

use cposd_config::SharedConfig;

use crate::gpslink::GpsLink;
use crate::modem::{Await, ModemChannel};
use crate::monitor::HealthMonitor;
use crate::session::{ModemPort, PositionPort, Session, SupervisorHook};
use crate::sockets::{HandlerError, ReadHandler, ServerKind, SocketServer};
use crate::xml::GppXmlCodec;

/// Debug listener handler: every chunk from a connected peer goes raw to
/// the modem and to every other connected peer. The daemon neither inspects
/// nor modifies pass-through traffic.
struct PassThrough {
    modem: Arc<ModemChannel>,
    server: Weak<SocketServer>,
}

impl ReadHandler for PassThrough {
    fn on_data(&self, slot: usize, data: &[u8]) -> Result<(), HandlerError> {
        let _ = self
            .modem
            .send_command(data, Await::None, std::time::Duration::ZERO);
        if let Some(server) = self.server.upgrade() {
            let _ = server.write_to_all_except(data, Some(slot));
        }
        Ok(())
    }
}

pub struct Daemon {
    config: SharedConfig,
    pub session: Arc<Session>,
    pub modem: Arc<ModemChannel>,
    pub gps: Arc<GpsLink>,
    pub monitor: Arc<HealthMonitor>,
    debug_server: Option<Arc<SocketServer>>,
}

impl Daemon {
    pub fn new(config: SharedConfig) -> Self {
        let translator = Arc::new(GppXmlCodec::new());
        let session = Session::new(config.clone(), translator.clone());
        let modem = ModemChannel::new(config.clone(), translator);
        let gps = GpsLink::new(config.clone());
        let monitor = HealthMonitor::new(
            config.clone(),
            session.clone(),
            modem.clone(),
            gps.clone(),
        );

        modem.set_request_sink(session.clone());
        modem.set_supervisor(monitor.clone() as Arc<dyn SupervisorHook>);
        gps.set_sink(session.clone());
        session.attach(
            gps.clone() as Arc<dyn PositionPort>,
            modem.clone() as Arc<dyn ModemPort>,
            monitor.clone() as Arc<dyn SupervisorHook>,
        );

        let debug_server = config.debug_server.enabled.then(|| {
            let server = Arc::new(SocketServer::new(
                "modem-tap",
                ServerKind::TcpListener,
                config.debug_server.port,
                None,
                config.debug_server.max_connections,
                4096,
            ));
            server.set_handler(Arc::new(PassThrough {
                modem: modem.clone(),
                server: Arc::downgrade(&server),
            }));
            modem.set_debug_tap(server.clone());
            server
        });

        Self {
            config,
            session,
            modem,
            gps,
            monitor,
            debug_server,
        }
    }

    /// Bring the channels up. Individual failures are logged, not fatal;
    /// the health monitor keeps retrying with each resource's interval.
    pub fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.modem.open() {
            tracing::warn!(error = %e, "modem not available yet");
        }
        match self.gps.init() {
            Ok(()) => {
                if let Err(e) = self.gps.connect() {
                    tracing::warn!(error = %e, "positioning process not reachable yet");
                }
            }
            Err(e) => tracing::warn!(error = %e, "gps link init failed"),
        }
        if let Some(server) = &self.debug_server {
            let up = server.init().and_then(|_| server.open());
            match up {
                Ok(()) => tracing::info!(
                    port = self.config.debug_server.port,
                    "modem pass-through listener ready"
                ),
                Err(e) => tracing::warn!(error = %e, "pass-through listener failed"),
            }
        }
        self.monitor.start();
        Ok(())
    }

    /// Ordered shutdown: monitors first, then the modem, the GPS link and
    /// the debug listener.
    pub fn stop(&self) {
        tracing::info!("shutting down");
        self.monitor.stop();
        if self.session.is_active() {
            let _ = (self.gps.clone() as Arc<dyn PositionPort>).send_stop_all();
        }
        self.modem.close();
        self.gps.close();
        if let Some(server) = &self.debug_server {
            server.close();
        }
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn builds_and_stops_without_devices() {
        let mut config = cposd_config::StackConfig::default();
        config.modem.device = "/dev/null-does-not-exist".into();
        config.debug_server.enabled = false;
        config.monitor.power_state_path = String::new();
        let daemon = Daemon::new(Arc::new(config));
        // no modem, no GPS peer: start degrades gracefully
        daemon.start().unwrap();
        assert!(!daemon.modem.reader_running());
        daemon.stop();
    }

    #[test]
    fn debug_listener_accepts_and_broadcasts() {
        use std::io::{Read, Write};
        use std::net::TcpStream;
        use std::time::Duration;

        let mut config = cposd_config::StackConfig::default();
        config.modem.device = "/dev/null-does-not-exist".into();
        config.debug_server.port = 0;
        config.monitor.power_state_path = String::new();
        let daemon = Daemon::new(Arc::new(config));
        daemon.start().unwrap();

        let server = daemon.debug_server.as_ref().unwrap();
        let port = server.local_port();
        let mut a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut b = TcpStream::connect(("127.0.0.1", port)).unwrap();
        for _ in 0..100 {
            if server.connected_count() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        // bytes from one peer reach the other (modem write fails silently,
        // the device is absent)
        a.write_all(b"AT\r\n").unwrap();
        b.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"AT\r\n");

        daemon.stop();
    }
}
