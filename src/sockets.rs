//! Multi-connection socket framework.
//!
//! A `SocketServer` instance groups up to [`MAX_CONNECTIONS`] connection
//! slots of one kind: TCP listener, local-domain listener, TCP client or
//! local-domain client. Every live connection gets a dedicated reader thread
//! feeding one shared read handler; writes are synchronous and best-effort.
//! Both the GPS link (single client slot) and the debug pass-through
//! listener are built on this.
//!
//! Slot teardown is cooperative: the requester flips the slot to Terminate
//! and shuts the descriptor down to unblock the pending read; only the
//! reader thread itself releases the slot (Terminating -> Terminated), so a
//! slot is never reused while its thread still owns the buffer.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::common::lifecycle::{LifecycleCell, RunState};

pub const MAX_CONNECTIONS: usize = 4;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_STARTUP_GRACE: Duration = Duration::from_secs(1);
const SLOT_CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Returned by a read handler to end its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerError;

pub trait ReadHandler: Send + Sync {
    /// Called on the reader thread with each chunk; an error ends the
    /// connection.
    fn on_data(&self, slot: usize, data: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    TcpListener,
    LocalListener,
    TcpClient,
    LocalClient,
}

impl ServerKind {
    fn is_listener(self) -> bool {
        matches!(self, ServerKind::TcpListener | ServerKind::LocalListener)
    }
}

#[derive(Debug)]
pub enum SocketError {
    NotInitialized,
    NoFreeSlot,
    BadSlot(usize),
    ShortWrite { slot: usize },
    Io(std::io::Error),
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::NotInitialized => write!(f, "socket server not initialized"),
            SocketError::NoFreeSlot => write!(f, "no free connection slot"),
            SocketError::BadSlot(i) => write!(f, "invalid slot index {}", i),
            SocketError::ShortWrite { slot } => write!(f, "short write on slot {}", slot),
            SocketError::Io(e) => write!(f, "socket i/o error: {}", e),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        SocketError::Io(e)
    }
}

enum Conn {
    Tcp(TcpStream),
    Local(UnixStream),
}

impl Conn {
    fn try_clone(&self) -> std::io::Result<Conn> {
        Ok(match self {
            Conn::Tcp(s) => Conn::Tcp(s.try_clone()?),
            Conn::Local(s) => Conn::Local(s.try_clone()?),
        })
    }

    fn shutdown(&self) {
        let _ = match self {
            Conn::Tcp(s) => s.shutdown(Shutdown::Both),
            Conn::Local(s) => s.shutdown(Shutdown::Both),
        };
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            Conn::Local(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Conn::Tcp(s) => s.write_all(buf),
            Conn::Local(s) => s.write_all(buf),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Local(UnixListener),
}

struct Slot {
    state: LifecycleCell,
    /// Writer-side handle; the reader thread owns its own clone.
    conn: Mutex<Option<Conn>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: LifecycleCell::default(),
            conn: Mutex::new(None),
        }
    }
}

pub struct SocketServer {
    name: &'static str,
    kind: ServerKind,
    port: u16,
    local_path: Option<PathBuf>,
    max_connections: usize,
    rx_buffer_size: usize,
    initialized: AtomicBool,
    terminate: AtomicBool,
    listener: Mutex<Option<Listener>>,
    bound_port: AtomicU32,
    accept_state: LifecycleCell,
    slots: Vec<Slot>,
    handler: OnceLock<Arc<dyn ReadHandler>>,
}

impl SocketServer {
    pub fn new(
        name: &'static str,
        kind: ServerKind,
        port: u16,
        local_path: Option<PathBuf>,
        max_connections: usize,
        rx_buffer_size: usize,
    ) -> Self {
        let max_connections = max_connections.clamp(1, MAX_CONNECTIONS);
        Self {
            name,
            kind,
            port,
            local_path,
            max_connections,
            rx_buffer_size: rx_buffer_size.max(64),
            initialized: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            listener: Mutex::new(None),
            bound_port: AtomicU32::new(0),
            accept_state: LifecycleCell::default(),
            slots: (0..max_connections).map(|_| Slot::new()).collect(),
            handler: OnceLock::new(),
        }
    }

    /// All slots share one read handler, assigned once before `open`.
    pub fn set_handler(&self, handler: Arc<dyn ReadHandler>) {
        let _ = self.handler.set(handler);
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Create and bind the underlying socket. For local-domain listeners a
    /// stale path is unlinked first.
    pub fn init(&self) -> Result<(), SocketError> {
        match self.kind {
            ServerKind::TcpListener => {
                let listener = TcpListener::bind(("0.0.0.0", self.port))?;
                if let Ok(addr) = listener.local_addr() {
                    self.bound_port.store(addr.port() as u32, Ordering::Relaxed);
                }
                *self.listener.lock().unwrap() = Some(Listener::Tcp(listener));
            }
            ServerKind::LocalListener => {
                let path = self
                    .local_path
                    .clone()
                    .ok_or(SocketError::NotInitialized)?;
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                *self.listener.lock().unwrap() = Some(Listener::Local(listener));
            }
            ServerKind::TcpClient | ServerKind::LocalClient => {}
        }
        self.terminate.store(false, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(server = self.name, kind = ?self.kind, "socket server initialized");
        Ok(())
    }

    /// Port actually bound (useful when configured with port 0).
    pub fn local_port(&self) -> u16 {
        self.bound_port.load(Ordering::Relaxed) as u16
    }

    fn check_initialized(&self) -> Result<(), SocketError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SocketError::NotInitialized)
        }
    }

    /// Start the accept loop (listener kinds only).
    pub fn open(self: &Arc<Self>) -> Result<(), SocketError> {
        self.check_initialized()?;
        if !self.kind.is_listener() {
            return Ok(());
        }
        if !self.accept_state.can_start() {
            return Ok(());
        }
        self.accept_state.set(RunState::Starting);
        let server = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("{}-accept", self.name))
            .spawn(move || server.accept_loop())
            .map_err(SocketError::Io)?;
        Ok(())
    }

    fn accept_loop(self: Arc<Self>) {
        {
            let guard = self.listener.lock().unwrap();
            let Some(listener) = guard.as_ref() else {
                self.accept_state.set(RunState::CantRun);
                return;
            };
            let nb = match listener {
                Listener::Tcp(l) => l.set_nonblocking(true),
                Listener::Local(l) => l.set_nonblocking(true),
            };
            if let Err(e) = nb {
                tracing::error!(server = self.name, error = %e, "accept loop setup failed");
                self.accept_state.set(RunState::CantRun);
                return;
            }
        }
        self.accept_state.set(RunState::Running);
        tracing::debug!(server = self.name, "accept loop running");
        while !self.terminate.load(Ordering::Acquire) {
            let accepted = {
                let guard = self.listener.lock().unwrap();
                match guard.as_ref() {
                    Some(Listener::Tcp(l)) => match l.accept() {
                        Ok((s, _)) => Some(Ok(Conn::Tcp(s))),
                        Err(e) => Some(Err(e)),
                    },
                    Some(Listener::Local(l)) => match l.accept() {
                        Ok((s, _)) => Some(Ok(Conn::Local(s))),
                        Err(e) => Some(Err(e)),
                    },
                    None => None,
                }
            };
            match accepted {
                None => break,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Some(Err(e)) => {
                    tracing::warn!(server = self.name, error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Some(Ok(conn)) => {
                    let nb = match &conn {
                        Conn::Tcp(s) => s.set_nonblocking(false),
                        Conn::Local(s) => s.set_nonblocking(false),
                    };
                    if nb.is_err() {
                        continue;
                    }
                    match self.attach(conn) {
                        Ok(slot) => {
                            tracing::debug!(server = self.name, slot, "accepted connection");
                        }
                        Err(e) => {
                            // connection dropped on the floor; peer sees EOF
                            tracing::warn!(server = self.name, error = %e, "refusing connection");
                        }
                    }
                }
            }
        }
        self.accept_state.set(RunState::Terminated);
        tracing::debug!(server = self.name, "accept loop exited");
    }

    /// Synchronously connect toward a server (client kinds only) and start
    /// the slot's reader thread. Returns the slot index.
    pub fn client_open(self: &Arc<Self>, host: &str, port: u16) -> Result<usize, SocketError> {
        self.check_initialized()?;
        let conn = match self.kind {
            ServerKind::TcpClient => Conn::Tcp(TcpStream::connect((host, port))?),
            ServerKind::LocalClient => {
                let path = self
                    .local_path
                    .clone()
                    .ok_or(SocketError::NotInitialized)?;
                Conn::Local(UnixStream::connect(path)?)
            }
            _ => return Err(SocketError::NotInitialized),
        };
        let slot = self.attach(conn)?;
        tracing::info!(server = self.name, host, port, slot, "client connection established");
        Ok(slot)
    }

    /// Claim a free slot for `conn` and spawn its reader thread, waiting
    /// (bounded) for the reader to confirm startup.
    fn attach(self: &Arc<Self>, conn: Conn) -> Result<usize, SocketError> {
        // the writer-side clone is parked in the slot; the reader owns `conn`
        let index = self.claim_slot(&conn)?;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
        let server = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-rx-{}", self.name, index))
            .spawn(move || server.reader_loop(index, conn, ready_tx));
        if let Err(e) = spawned {
            self.release_slot(index);
            return Err(SocketError::Io(e));
        }
        if ready_rx.recv_timeout(READER_STARTUP_GRACE).is_err() {
            tracing::warn!(server = self.name, slot = index, "reader thread slow to start");
        }
        Ok(index)
    }

    fn claim_slot(&self, conn: &Conn) -> Result<usize, SocketError> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.conn.lock().unwrap();
            if slot.state.can_start() && guard.is_none() {
                let writer = conn.try_clone()?;
                slot.state.set(RunState::Starting);
                *guard = Some(writer);
                return Ok(i);
            }
        }
        Err(SocketError::NoFreeSlot)
    }

    fn release_slot(&self, index: usize) {
        let slot = &self.slots[index];
        let mut guard = slot.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            conn.shutdown();
        }
        slot.state.set(RunState::Terminated);
    }

    fn reader_loop(
        self: Arc<Self>,
        index: usize,
        mut conn: Conn,
        ready_tx: crossbeam_channel::Sender<()>,
    ) {
        let slot = &self.slots[index];
        slot.state.set(RunState::Running);
        let _ = ready_tx.send(());
        let mut buf = vec![0u8; self.rx_buffer_size];
        loop {
            if !slot.state.is_running() {
                break;
            }
            match conn.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(server = self.name, slot = index, "peer closed");
                    break;
                }
                Ok(n) => {
                    if let Some(handler) = self.handler.get() {
                        if handler.on_data(index, &buf[..n]).is_err() {
                            tracing::warn!(server = self.name, slot = index, "handler ended connection");
                            break;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(server = self.name, slot = index, error = %e, "read ended");
                    break;
                }
            }
        }
        slot.state.set(RunState::Terminating);
        conn.shutdown();
        drop(conn);
        if let Some(writer) = slot.conn.lock().unwrap().take() {
            writer.shutdown();
        }
        slot.state.set(RunState::Terminated);
    }

    pub fn slot_state(&self, index: usize) -> Option<RunState> {
        self.slots.get(index).map(|s| s.state.get())
    }

    pub fn slot_running(&self, index: usize) -> bool {
        self.slot_state(index) == Some(RunState::Running)
    }

    pub fn connected_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_running()).count()
    }

    pub fn write_to_slot(&self, index: usize, data: &[u8]) -> Result<(), SocketError> {
        self.check_initialized()?;
        let slot = self.slots.get(index).ok_or(SocketError::BadSlot(index))?;
        let mut guard = slot.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or(SocketError::BadSlot(index))?;
        conn.write_all(data)
            .map_err(|_| SocketError::ShortWrite { slot: index })
    }

    pub fn write_to_all(&self, data: &[u8]) -> Result<(), SocketError> {
        self.write_to_all_except(data, None)
    }

    /// Best-effort write to every connected slot except `skip`. A failed or
    /// short write is reported but does not stop the iteration.
    pub fn write_to_all_except(
        &self,
        data: &[u8],
        skip: Option<usize>,
    ) -> Result<(), SocketError> {
        self.check_initialized()?;
        if data.is_empty() {
            return Ok(());
        }
        let mut result = Ok(());
        for (i, slot) in self.slots.iter().enumerate() {
            if Some(i) == skip {
                continue;
            }
            let mut guard = slot.conn.lock().unwrap();
            if let Some(conn) = guard.as_mut() {
                if conn.write_all(data).is_err() {
                    result = Err(SocketError::ShortWrite { slot: i });
                }
            }
        }
        result
    }

    /// Request termination of one slot and wait briefly for its reader to
    /// finish. Proceeds regardless after the grace period.
    pub fn close_slot(&self, index: usize) -> Result<(), SocketError> {
        let slot = self.slots.get(index).ok_or(SocketError::BadSlot(index))?;
        if matches!(slot.state.get(), RunState::Off | RunState::Terminated) {
            return Ok(());
        }
        slot.state.request_terminate();
        if let Some(conn) = slot.conn.lock().unwrap().as_ref() {
            conn.shutdown();
        }
        if !slot.state.wait_terminated(SLOT_CLOSE_GRACE) {
            tracing::warn!(server = self.name, slot = index, "reader unresponsive, releasing slot anyway");
            self.release_slot(index);
        }
        Ok(())
    }

    /// Close the whole server: stop accepting, close every slot, unlink a
    /// local-domain path.
    pub fn close(&self) {
        self.terminate.store(true, Ordering::Release);
        {
            let mut guard = self.listener.lock().unwrap();
            guard.take();
        }
        if let Some(path) = &self.local_path {
            if self.kind == ServerKind::LocalListener {
                let _ = std::fs::remove_file(path);
            }
        }
        for i in 0..self.slots.len() {
            let _ = self.close_slot(i);
        }
        if self.kind.is_listener()
            && !self.accept_state.wait_terminated(Duration::from_millis(500))
        {
            tracing::warn!(server = self.name, "accept thread unresponsive at close");
        }
        self.initialized.store(false, Ordering::Release);
        tracing::debug!(server = self.name, "socket server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        data: StdMutex<Vec<(usize, Vec<u8>)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                data: StdMutex::new(Vec::new()),
            })
        }
    }

    impl ReadHandler for Recorder {
        fn on_data(&self, slot: usize, data: &[u8]) -> Result<(), HandlerError> {
            self.data.lock().unwrap().push((slot, data.to_vec()));
            Ok(())
        }
    }

    fn tcp_listener(max: usize) -> (Arc<SocketServer>, Arc<Recorder>) {
        let server = Arc::new(SocketServer::new(
            "test",
            ServerKind::TcpListener,
            0,
            None,
            max,
            4096,
        ));
        let recorder = Recorder::new();
        server.set_handler(recorder.clone());
        server.init().unwrap();
        server.open().unwrap();
        (server, recorder)
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

    #[test]
    fn slot_lifecycle_fill_refuse_reuse() {
        let (server, _rec) = tcp_listener(2);
        let port = server.local_port();

        let c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| server.connected_count() == 2));

        // third connection is refused: the peer observes EOF
        let mut c3 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        c3.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(c3.read(&mut byte).unwrap_or(0), 0);
        assert_eq!(server.connected_count(), 2);

        // closing one frees its slot for reuse
        drop(c1);
        assert!(wait_for(|| server.connected_count() == 1));
        let _c4 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| server.connected_count() == 2));

        drop(c2);
        server.close();
    }

    #[test]
    fn data_reaches_shared_handler() {
        let (server, rec) = tcp_listener(2);
        let port = server.local_port();
        let mut c = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| server.connected_count() == 1));
        c.write_all(b"hello").unwrap();
        assert!(wait_for(|| !rec.data.lock().unwrap().is_empty()));
        let got = rec.data.lock().unwrap();
        assert_eq!(got[0].1, b"hello");
        drop(got);
        server.close();
    }

    #[test]
    fn broadcast_skips_excluded_slot() {
        let (server, _rec) = tcp_listener(3);
        let port = server.local_port();
        let mut a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| server.connected_count() == 1));
        let mut b = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_for(|| server.connected_count() == 2));

        // slot indices are claimed in order
        server.write_to_all_except(b"ping", Some(0)).unwrap();
        b.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut one = [0u8; 1];
        assert!(a.read(&mut one).is_err());
        server.close();
    }

    #[test]
    fn client_connects_to_local_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cposd-test.sock");

        let listener = Arc::new(SocketServer::new(
            "local-srv",
            ServerKind::LocalListener,
            0,
            Some(path.clone()),
            1,
            1024,
        ));
        let rec = Recorder::new();
        listener.set_handler(rec.clone());
        listener.init().unwrap();
        listener.open().unwrap();

        let client = Arc::new(SocketServer::new(
            "local-cli",
            ServerKind::LocalClient,
            0,
            Some(path.clone()),
            1,
            1024,
        ));
        client.set_handler(Recorder::new());
        client.init().unwrap();
        let slot = client.client_open("", 0).unwrap();
        assert!(wait_for(|| client.slot_running(slot)));

        client.write_to_slot(slot, b"over local").unwrap();
        assert!(wait_for(|| !rec.data.lock().unwrap().is_empty()));
        assert_eq!(rec.data.lock().unwrap()[0].1, b"over local");

        client.close();
        listener.close();
        assert!(!path.exists());
    }

    #[test]
    fn clamps_connection_limit() {
        let s = SocketServer::new("clamp", ServerKind::TcpClient, 0, None, 99, 1024);
        assert_eq!(s.max_connections(), MAX_CONNECTIONS);
        let s = SocketServer::new("clamp", ServerKind::TcpClient, 0, None, 0, 1024);
        assert_eq!(s.max_connections(), 1);
    }
}
