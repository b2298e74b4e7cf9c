//! GPS link: the framed binary channel toward the positioning process.
//!
//! A single client connection (TCP or local-domain) managed through the
//! socket framework, plus the deframer and the record codec. Inbound frames
//! are dispatched to the session sinks; outbound records are stamped with
//! the protocol version, framed and written to the one live slot.

pub mod wire;

use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context};
use cposd_config::SharedConfig;

use crate::common::keep_open::KeepOpen;
use crate::common::lifecycle::RunState;
use crate::records::{
    self, decode_request, decode_response, encode_request, PosMeas, RequestKind, RequestRecord,
};
use crate::session::{PositionPort, ResponseSink};
use crate::sockets::{HandlerError, ReadHandler, ServerKind, SocketServer};
use self::wire::{Deframer, DeframeEvent, Direction, MsgType};

pub struct GpsLink {
    config: SharedConfig,
    server: Arc<SocketServer>,
    slot: Mutex<Option<usize>>,
    pub keep_open: KeepOpen,
    deframer: Mutex<Deframer>,
    sink: OnceLock<Arc<dyn ResponseSink>>,
}

impl GpsLink {
    pub fn new(config: SharedConfig) -> Arc<Self> {
        let kind = if config.gps.socket_path.is_some() {
            ServerKind::LocalClient
        } else {
            ServerKind::TcpClient
        };
        let server = Arc::new(SocketServer::new(
            "gps-link",
            kind,
            config.gps.port,
            config.gps.socket_path.as_ref().map(Into::into),
            1,
            config.gps.rx_buffer_size,
        ));
        let retry = config.gps.reconnect_retry_ms;
        let link = Arc::new(Self {
            config,
            server,
            slot: Mutex::new(None),
            keep_open: KeepOpen::new(retry),
            deframer: Mutex::new(Deframer::new()),
            sink: OnceLock::new(),
        });
        link.server.set_handler(link.clone() as Arc<dyn ReadHandler>);
        link
    }

    pub fn set_sink(&self, sink: Arc<dyn ResponseSink>) {
        let _ = self.sink.set(sink);
    }

    pub fn init(&self) -> anyhow::Result<()> {
        self.server.init().context("gps link socket init")
    }

    pub fn is_running(&self) -> bool {
        let slot = self.slot.lock().unwrap();
        slot.is_some_and(|i| self.server.slot_running(i))
    }

    /// Connect toward the positioning process; stale partial frames from a
    /// previous connection are dropped.
    pub fn connect(self: &Arc<Self>) -> anyhow::Result<usize> {
        self.keep_open.stamp_attempt();
        let index = self
            .server
            .client_open(&self.config.gps.host, self.config.gps.port)
            .context("connecting to positioning process")?;
        self.deframer.lock().unwrap().clear();
        *self.slot.lock().unwrap() = Some(index);
        Ok(index)
    }

    /// One supervisor pass over the connection slot: release a dead slot,
    /// reconnect when the retry interval allows, clean up a stuck one.
    /// Returns true when the link is healthy.
    pub fn maintain(self: &Arc<Self>) -> bool {
        let current = *self.slot.lock().unwrap();
        match current {
            Some(index) => match self.server.slot_state(index) {
                Some(RunState::Running) => true,
                Some(RunState::Off) | Some(RunState::Terminated) | None => {
                    *self.slot.lock().unwrap() = None;
                    false
                }
                _ => {
                    let _ = self.server.close_slot(index);
                    false
                }
            },
            None => {
                if !self.keep_open.due() {
                    return false;
                }
                match self.connect() {
                    Ok(index) => {
                        tracing::info!(slot = index, "gps link reconnected");
                        true
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "gps link reconnect failed");
                        false
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        self.keep_open.set_enabled(false);
        self.server.close();
        *self.slot.lock().unwrap() = None;
    }

    fn write_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let slot = *self.slot.lock().unwrap();
        let Some(index) = slot else {
            bail!("gps link not connected");
        };
        self.server
            .write_to_slot(index, frame)
            .context("gps link write")
    }

    fn dispatch(&self, event: DeframeEvent) {
        let Some(sink) = self.sink.get() else { return };
        match event {
            DeframeEvent::Frame { msg_type, payload, .. } => match msg_type {
                MsgType::MeasAbortReq => {
                    tracing::info!("measurement abort from positioning process");
                    sink.on_abort_request();
                }
                MsgType::PosMeasReq => {
                    let record = decode_request(&payload).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "position request rejected");
                        RequestRecord::error()
                    });
                    sink.on_position_request(record);
                }
                MsgType::PosMeasResp => {
                    let record = decode_response(&payload).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "position response rejected");
                        records::ResponseRecord::error()
                    });
                    sink.on_position_response(record);
                }
                MsgType::Query | MsgType::None => {
                    tracing::debug!(msg_type = ?msg_type, "ignoring frame");
                }
            },
            DeframeEvent::Query => {
                tracing::debug!("liveness query from peer");
            }
            DeframeEvent::Discarded { bytes } => {
                tracing::warn!(bytes, "malformed gps frame discarded, resynchronizing");
            }
        }
    }
}

impl ReadHandler for GpsLink {
    fn on_data(&self, _slot: usize, data: &[u8]) -> Result<(), HandlerError> {
        let events = self.deframer.lock().unwrap().push(data);
        for event in events {
            self.dispatch(event);
        }
        Ok(())
    }
}

impl PositionPort for GpsLink {
    fn send_position_request(&self, req: &RequestRecord) -> anyhow::Result<()> {
        let mut record = *req;
        record.version = records::MSG_VERSION;
        let frame = wire::encode_frame(
            Direction::ToGps,
            MsgType::PosMeasReq,
            &encode_request(&record),
        );
        self.write_frame(&frame)
    }

    fn send_abort(&self) -> anyhow::Result<()> {
        let frame = wire::encode_frame(Direction::ToGps, MsgType::MeasAbortReq, &[]);
        self.write_frame(&frame)
    }

    /// Ask the positioning process to stop everything (control message).
    fn send_stop_all(&self) -> anyhow::Result<()> {
        let record = RequestRecord {
            version: records::MSG_VERSION,
            kind: RequestKind::ControlMsg,
            pos_meas: PosMeas::StopGps,
            ..RequestRecord::default()
        };
        let frame = wire::encode_frame(
            Direction::ToGps,
            MsgType::PosMeasReq,
            &encode_request(&record),
        );
        self.write_frame(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{encode_response, ResponseKind, ResponseRecord, MSG_VERSION};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectSink {
        responses: StdMutex<Vec<ResponseRecord>>,
        requests: StdMutex<Vec<RequestRecord>>,
        aborts: StdMutex<usize>,
    }

    impl ResponseSink for CollectSink {
        fn on_position_response(&self, resp: ResponseRecord) {
            self.responses.lock().unwrap().push(resp);
        }
        fn on_abort_request(&self) {
            *self.aborts.lock().unwrap() += 1;
        }
        fn on_position_request(&self, req: RequestRecord) {
            self.requests.lock().unwrap().push(req);
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..300 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn link_to_fake_gps() -> (Arc<GpsLink>, Arc<CollectSink>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = cposd_config::StackConfig::default();
        config.gps.host = "127.0.0.1".into();
        config.gps.port = port;
        let link = GpsLink::new(Arc::new(config));
        let sink = Arc::new(CollectSink::default());
        link.set_sink(sink.clone());
        link.init().unwrap();
        link.connect().unwrap();
        let (peer, _) = listener.accept().unwrap();
        assert!(wait_for(|| link.is_running()));
        (link, sink, peer)
    }

    #[test]
    fn response_frame_reaches_sink() {
        let (_link, sink, mut peer) = link_to_fake_gps();
        let resp = ResponseRecord {
            version: MSG_VERSION,
            kind: ResponseKind::Location,
            ..ResponseRecord::default()
        };
        let frame = wire::encode_frame(
            Direction::FromGps,
            MsgType::PosMeasResp,
            &encode_response(&resp),
        );
        peer.write_all(&frame).unwrap();
        assert!(wait_for(|| !sink.responses.lock().unwrap().is_empty()));
        assert_eq!(sink.responses.lock().unwrap()[0].kind, ResponseKind::Location);
    }

    #[test]
    fn version_mismatch_becomes_error_record() {
        let (_link, sink, mut peer) = link_to_fake_gps();
        let mut resp = ResponseRecord::default();
        resp.version = MSG_VERSION + 7;
        let frame = wire::encode_frame(
            Direction::FromGps,
            MsgType::PosMeasResp,
            &encode_response(&resp),
        );
        peer.write_all(&frame).unwrap();
        assert!(wait_for(|| !sink.responses.lock().unwrap().is_empty()));
        assert_eq!(sink.responses.lock().unwrap()[0].kind, ResponseKind::Error);
    }

    #[test]
    fn abort_request_dispatched() {
        let (_link, sink, mut peer) = link_to_fake_gps();
        let frame = wire::encode_frame(Direction::FromGps, MsgType::MeasAbortReq, &[]);
        peer.write_all(&frame).unwrap();
        assert!(wait_for(|| *sink.aborts.lock().unwrap() == 1));
    }

    #[test]
    fn outbound_request_is_well_framed() {
        let (link, _sink, mut peer) = link_to_fake_gps();
        let req = RequestRecord::new_pos_meas(PosMeas::Abort);
        link.send_position_request(&req).unwrap();

        let mut collected = Vec::new();
        let mut chunk = [0u8; 512];
        peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut deframer = Deframer::new();
        loop {
            let n = peer.read(&mut chunk).unwrap();
            let events = deframer.push(&chunk[..n]);
            if !events.is_empty() {
                collected = events;
                break;
            }
        }
        match &collected[0] {
            DeframeEvent::Frame { direction, msg_type, payload } => {
                assert_eq!(*direction, Direction::ToGps);
                assert_eq!(*msg_type, MsgType::PosMeasReq);
                let back = decode_request(payload).unwrap();
                assert_eq!(back.pos_meas, PosMeas::Abort);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn maintain_releases_dead_slot() {
        let (link, _sink, peer) = link_to_fake_gps();
        assert!(link.maintain());
        drop(peer);
        assert!(wait_for(|| !link.is_running()));
        // first pass releases the slot; with the retry interval unexpired
        // no reconnect is attempted
        assert!(!link.maintain());
        assert!(!link.maintain());
        link.close();
    }
}
