//! Modem channel.
//!
//! Owns the serial device. A dedicated reader thread continuously ingests
//! bytes, feeds them to the AT-response scanner, and dispatches recognized
//! terminators (satisfying pending commands) and unsolicited +CPOSR
//! notifications (parsed and handed to the request sink). Command senders
//! block on a condvar with the command's timeout; the reader thread never
//! blocks on anything but the device.
//!
//! Every byte in either direction is mirrored to the debug pass-through
//! listener when one is attached.

pub mod port;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context};
use cposd_config::SharedConfig;
use serialport::SerialPort;

use crate::common::keep_open::KeepOpen;
use crate::common::lifecycle::{LifecycleCell, RunState};
use crate::common::monotime;
use crate::common::scanbuf::{find, ScanBuf};
use crate::scanner::{self, AckClass, ScanEvent};
use crate::session::{ModemPort, RequestSink, SupervisorHook};
use crate::sockets::SocketServer;
use crate::xml::XmlTranslator;

const CRLF: &[u8] = b"\r\n";
const READ_CHUNK: usize = 256;

pub const CMD_AT: &[u8] = b"AT\r\n";
pub const CMD_CPOSR_ENABLE: &[u8] = b"AT+CPOSR=1\r\n";
pub const CMD_CPOSR_QUERY: &[u8] = b"AT+CPOSR?\r\n";
const CPOS_PREAMBLE: &[u8] = b"\r\nAT+CPOS\r";

/// What a sender is waiting for after writing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Await {
    /// Fire and forget.
    None,
    /// Any CRLF in the stream (used between the +CPOS preamble and body).
    CrLf,
    /// An OK/ERROR-class terminator.
    Ack,
}

#[derive(Default)]
struct PendingCommand {
    await_kind: Option<Await>,
    response: Option<AckClass>,
}

pub struct ModemChannel {
    config: SharedConfig,
    translator: Arc<dyn XmlTranslator>,
    device: Mutex<Option<Box<dyn SerialPort>>>,
    reader_state: LifecycleCell,
    pub keep_open: KeepOpen,
    pending: Mutex<PendingCommand>,
    pending_cond: Condvar,
    registered: AtomicBool,
    registered_at: AtomicU64,
    unsol_received_at: AtomicU64,
    last_data_sent: AtomicU64,
    last_data_received: AtomicU64,
    request_sink: OnceLock<Arc<dyn RequestSink>>,
    supervisor: OnceLock<Arc<dyn SupervisorHook>>,
    debug_tap: OnceLock<Arc<SocketServer>>,
}

impl ModemChannel {
    pub fn new(config: SharedConfig, translator: Arc<dyn XmlTranslator>) -> Arc<Self> {
        let retry = config.modem.reopen_retry_ms;
        Arc::new(Self {
            config,
            translator,
            device: Mutex::new(None),
            reader_state: LifecycleCell::default(),
            keep_open: KeepOpen::new(retry),
            pending: Mutex::new(PendingCommand::default()),
            pending_cond: Condvar::new(),
            registered: AtomicBool::new(false),
            registered_at: AtomicU64::new(0),
            unsol_received_at: AtomicU64::new(0),
            last_data_sent: AtomicU64::new(0),
            last_data_received: AtomicU64::new(0),
            request_sink: OnceLock::new(),
            supervisor: OnceLock::new(),
            debug_tap: OnceLock::new(),
        })
    }

    pub fn set_request_sink(&self, sink: Arc<dyn RequestSink>) {
        let _ = self.request_sink.set(sink);
    }

    pub fn set_supervisor(&self, hook: Arc<dyn SupervisorHook>) {
        let _ = self.supervisor.set(hook);
    }

    pub fn set_debug_tap(&self, tap: Arc<SocketServer>) {
        let _ = self.debug_tap.set(tap);
    }

    pub fn reader_running(&self) -> bool {
        self.reader_state.is_running()
    }

    pub fn registered_for_unsolicited(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn last_data_received(&self) -> u64 {
        self.last_data_received.load(Ordering::Relaxed)
    }

    pub fn last_data_sent(&self) -> u64 {
        self.last_data_sent.load(Ordering::Relaxed)
    }

    pub fn unsolicited_activity_at(&self) -> u64 {
        self.unsol_received_at
            .load(Ordering::Relaxed)
            .max(self.registered_at.load(Ordering::Relaxed))
    }

    /// Open the device in raw mode, start the reader thread and register for
    /// unsolicited location notifications. Safe to call again after a
    /// failure; the health monitor does exactly that.
    pub fn open(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.reader_state.can_start() {
            return Ok(());
        }
        self.keep_open.stamp_attempt();
        {
            // reopen races the reader's error path on this handle
            let mut device = self.device.lock().unwrap();
            if device.is_none() {
                let port = port::open_port(
                    &self.config.modem.device,
                    self.config.modem.baud,
                    Duration::from_millis(self.config.modem.read_tick_ms),
                )
                .with_context(|| format!("opening modem device {}", self.config.modem.device))?;
                *device = Some(port);
            }
        }
        self.registered.store(false, Ordering::Release);
        self.registered_at.store(0, Ordering::Relaxed);
        self.unsol_received_at.store(0, Ordering::Relaxed);

        let reader = {
            let device = self.device.lock().unwrap();
            device
                .as_ref()
                .map(|d| d.try_clone())
                .transpose()
                .context("cloning modem handle for reader")?
        };
        let Some(reader) = reader else {
            bail!("modem device vanished before reader start");
        };

        self.reader_state.set(RunState::Starting);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
        let channel = Arc::clone(self);
        std::thread::Builder::new()
            .name("modem-rx".into())
            .spawn(move || channel.reader_loop(reader, ready_tx))
            .context("spawning modem reader")?;
        let _ = ready_rx.recv_timeout(Duration::from_secs(1));

        tracing::info!(device = %self.config.modem.device, "modem channel open");
        self.register_for_unsolicited();
        Ok(())
    }

    /// Register with the modem for +CPOSR notifications: probe with AT,
    /// enable unsolicited reporting, then query the registration status
    /// (the scanner records the answer). Returns the resulting status.
    pub fn register_for_unsolicited(&self) -> bool {
        let timeout = Duration::from_millis(self.config.modem.command_timeout_ms);
        let _ = self.send_command(CMD_AT, Await::Ack, timeout);
        self.registered.store(false, Ordering::Release);
        self.registered_at.store(0, Ordering::Relaxed);
        let _ = self.send_command(CMD_CPOSR_ENABLE, Await::Ack, timeout);
        let _ = self.send_command(CMD_CPOSR_QUERY, Await::Ack, timeout);
        let registered = self.registered_for_unsolicited();
        if !registered {
            tracing::warn!("+CPOSR registration not confirmed");
        }
        registered
    }

    /// Close the device and terminate the reader thread. Reopening later
    /// reuses the channel.
    pub fn close(&self) {
        self.keep_open.set_enabled(false);
        let reader_was_up = !self.reader_state.can_start();
        if reader_was_up {
            self.reader_state.request_terminate();
        }
        {
            let mut device = self.device.lock().unwrap();
            device.take();
        }
        if reader_was_up {
            let grace = Duration::from_millis(self.config.modem.read_tick_ms * 4 + 100);
            if !self.reader_state.wait_terminated(grace) {
                tracing::warn!("modem reader unresponsive at close");
                self.reader_state.set(RunState::Terminated);
            }
        }
        tracing::info!("modem channel closed");
    }

    /// Write a command to the device; when `await_kind` asks for it, block
    /// until the reader recognizes the response or `timeout` elapses.
    pub fn send_command(
        &self,
        bytes: &[u8],
        await_kind: Await,
        timeout: Duration,
    ) -> anyhow::Result<Option<AckClass>> {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.await_kind = (await_kind != Await::None).then_some(await_kind);
            pending.response = None;
        }
        let write_result = {
            let mut device = self.device.lock().unwrap();
            match device.as_mut() {
                Some(d) => d.write_all(bytes).and_then(|_| d.flush()),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "modem device closed",
                )),
            }
        };
        if let Err(e) = write_result {
            self.pending.lock().unwrap().await_kind = None;
            if let Some(s) = self.supervisor.get() {
                s.ensure_running();
            }
            return Err(e).context("modem write");
        }
        self.last_data_sent.store(monotime::msec_now(), Ordering::Relaxed);
        if let Some(tap) = self.debug_tap.get() {
            let _ = tap.write_to_all(bytes);
        }
        if await_kind == Await::None {
            return Ok(None);
        }

        let (mut pending, timed_out) = self
            .pending_cond
            .wait_timeout_while(self.pending.lock().unwrap(), timeout, |p| {
                p.await_kind.is_some()
            })
            .unwrap();
        if timed_out.timed_out() && pending.await_kind.is_some() {
            pending.await_kind = None;
            // partial unsolicited data stays in the reader's buffer
            bail!("modem response timeout after {:?}", timeout);
        }
        Ok(pending.response)
    }

    fn reader_loop(
        self: Arc<Self>,
        mut device: Box<dyn SerialPort>,
        ready_tx: crossbeam_channel::Sender<()>,
    ) {
        self.reader_state.set(RunState::Running);
        let _ = ready_tx.send(());
        let mut assembly = ScanBuf::with_capacity(self.config.modem.rx_buffer_size);
        let mut chunk = [0u8; READ_CHUNK];
        tracing::debug!("modem reader running");
        while self.reader_state.is_running() {
            match device.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => self.ingest(&mut assembly, &chunk[..n]),
                Err(e) if port::is_idle_read(&e) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "modem read failed, closing device");
                    let mut guard = self.device.lock().unwrap();
                    guard.take();
                    drop(guard);
                    if let Some(s) = self.supervisor.get() {
                        s.ensure_running();
                    }
                    break;
                }
            }
        }
        self.reader_state.set(RunState::Terminated);
        tracing::debug!("modem reader exited");
    }

    /// Append freshly read bytes and run the scanner until it stalls.
    fn ingest(&self, assembly: &mut ScanBuf, data: &[u8]) {
        self.last_data_received.store(monotime::msec_now(), Ordering::Relaxed);
        if let Some(tap) = self.debug_tap.get() {
            let _ = tap.write_to_all(data);
        }
        assembly.push(data);
        self.check_crlf_wait(assembly.as_slice());
        for event in scanner::drain_events(assembly) {
            self.handle_event(event);
        }
    }

    /// A sender waiting for a bare CRLF is satisfied before the scanner gets
    /// a chance to consume it.
    fn check_crlf_wait(&self, buf: &[u8]) {
        let mut pending = self.pending.lock().unwrap();
        if pending.await_kind == Some(Await::CrLf) && find(buf, CRLF).is_some() {
            pending.await_kind = None;
            pending.response = Some(AckClass::Ok);
            self.pending_cond.notify_all();
        }
    }

    fn handle_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::Ack { class, line } => {
                let (name, value) = scanner::split_name_value(&line);
                if name.starts_with(b"+CPOSR") {
                    let status = value
                        .and_then(|v| std::str::from_utf8(v).ok())
                        .and_then(|v| v.trim().parse::<i32>().ok())
                        .unwrap_or(0);
                    self.registered.store(status != 0, Ordering::Release);
                    self.registered_at.store(monotime::msec_now(), Ordering::Relaxed);
                    tracing::info!(status, "unsolicited registration status");
                } else if name.starts_with(b"RING") {
                    tracing::debug!("RING");
                }
                let mut pending = self.pending.lock().unwrap();
                if pending.await_kind == Some(Await::Ack) {
                    pending.await_kind = None;
                    pending.response = Some(class);
                    self.pending_cond.notify_all();
                }
            }
            ScanEvent::Unsolicited { xml } => {
                self.unsol_received_at.store(monotime::msec_now(), Ordering::Relaxed);
                match self.translator.parse_unsolicited(&xml) {
                    Ok(req) => {
                        tracing::info!(bytes = xml.len(), "unsolicited location request");
                        if let Some(sink) = self.request_sink.get() {
                            sink.on_network_request(req);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "unsolicited payload did not parse");
                    }
                }
            }
        }
    }
}

impl ModemPort for ModemChannel {
    /// `AT+CPOS<CR>` then the XML body terminated with Ctrl-Z, each leg with
    /// the XML-exchange timeout.
    fn send_position_response(&self, xml: &[u8]) -> anyhow::Result<AckClass> {
        let timeout = Duration::from_millis(self.config.modem.xml_command_timeout_ms);
        self.send_command(CPOS_PREAMBLE, Await::CrLf, timeout)
            .context("+CPOS preamble")?;
        let mut body = Vec::with_capacity(xml.len() + 1);
        body.extend_from_slice(xml);
        body.push(scanner::CTRL_Z);
        match self.send_command(&body, Await::Ack, timeout)? {
            Some(class) => Ok(class),
            None => bail!("no terminator for +CPOS body"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::PosMeas;
    use crate::session::RequestSink;
    use std::sync::Mutex as StdMutex;

    struct CollectSink {
        got: StdMutex<Vec<crate::records::RequestRecord>>,
    }

    impl RequestSink for CollectSink {
        fn on_network_request(&self, req: crate::records::RequestRecord) {
            self.got.lock().unwrap().push(req);
        }
    }

    fn channel_with_sink() -> (Arc<ModemChannel>, Arc<CollectSink>) {
        let config = Arc::new(cposd_config::StackConfig::default());
        let channel = ModemChannel::new(config, Arc::new(crate::xml::GppXmlCodec::new()));
        let sink = Arc::new(CollectSink {
            got: StdMutex::new(Vec::new()),
        });
        channel.set_request_sink(sink.clone());
        (channel, sink)
    }

    #[test]
    fn unsolicited_bytes_reach_request_sink() {
        let (channel, sink) = channel_with_sink();
        let mut buf = ScanBuf::with_capacity(8192);
        let mut data = Vec::new();
        data.extend_from_slice(b"\r\n+CPOSR: <pos><pos_meas><meas_abort/></pos_meas></pos>\r\n\r\n");
        channel.ingest(&mut buf, &data);
        let got = sink.got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].pos_meas, PosMeas::Abort);
    }

    #[test]
    fn registration_status_tracked_from_ok_line() {
        let (channel, _sink) = channel_with_sink();
        let mut buf = ScanBuf::with_capacity(8192);
        assert!(!channel.registered_for_unsolicited());
        channel.ingest(&mut buf, b"\r\n+CPOSR: 1\r\nOK\r\n");
        assert!(channel.registered_for_unsolicited());
        channel.ingest(&mut buf, b"\r\n+CPOSR: 0\r\nOK\r\n");
        assert!(!channel.registered_for_unsolicited());
    }

    #[test]
    fn chunked_unsolicited_survives_partial_reads() {
        let (channel, sink) = channel_with_sink();
        let mut buf = ScanBuf::with_capacity(8192);
        let data = b"\r\n+CPOSR: <pos><pos_meas><meas_abort/></pos_meas></pos>\r\n\r\n";
        for chunk in data.chunks(5) {
            channel.ingest(&mut buf, chunk);
        }
        assert_eq!(sink.got.lock().unwrap().len(), 1);
    }

    #[test]
    fn ack_satisfies_waiting_sender() {
        let (channel, _sink) = channel_with_sink();
        let feeder = Arc::clone(&channel);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            feeder.handle_event(ScanEvent::Ack {
                class: AckClass::Ok,
                line: Vec::new(),
            });
        });
        {
            let mut pending = channel.pending.lock().unwrap();
            pending.await_kind = Some(Await::Ack);
            pending.response = None;
        }
        let (pending, result) = channel
            .pending_cond
            .wait_timeout_while(
                channel.pending.lock().unwrap(),
                Duration::from_secs(2),
                |p| p.await_kind.is_some(),
            )
            .unwrap();
        assert!(!result.timed_out());
        assert_eq!(pending.response, Some(AckClass::Ok));
        drop(pending);
        t.join().unwrap();
    }
}
