//! Accept loop for control protocol clients.
//!
//! Binds a Unix-domain socket (the default) or a TCP socket and spawns
//! one server connection thread per accepted client. The accept poll uses
//! a short timeout so the shutdown flag is observed promptly; the socket
//! path is unlinked on teardown.

use std::net::TcpListener;
use std::os::fd::AsFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, error, info};

use crate::connection::{self, ConnectionCore, Socket, wait_readable};
use crate::dispatch::ServerDispatch;
use crate::error::{ConnectionError, Result};
use crate::logic::LogicLoop;
use crate::registry::{ThreadRegistry, WorkerKind};

/// Default Unix-domain socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/bbb_hvac";

/// Default TCP listen interface.
pub const DEFAULT_TCP_INTERFACE: &str = "127.0.0.1";

/// Default TCP port.
pub const DEFAULT_TCP_PORT: u16 = 6666;

/// Accept poll window in milliseconds.
const ACCEPT_POLL_MS: u16 = 100;

/// Where the listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Unix-domain socket at the given path.
    Unix(PathBuf),
    /// TCP socket on interface:port.
    Tcp(String, u16),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(host, port) => write!(f, "tcp:{host}:{port}"),
        }
    }
}

enum BoundListener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl BoundListener {
    fn accept(&self) -> std::io::Result<Socket> {
        match self {
            Self::Unix(listener, _) => listener.accept().map(|(s, _)| {
                let _ = s.set_nonblocking(true);
                Socket::Unix(s)
            }),
            Self::Tcp(listener) => listener.accept().map(|(s, _)| {
                let _ = s.set_nonblocking(true);
                Socket::Tcp(s)
            }),
        }
    }

    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        match self {
            Self::Unix(listener, _) => listener.as_fd(),
            Self::Tcp(listener) => listener.as_fd(),
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Binds the requested address and starts the accept loop thread.
///
/// # Errors
///
/// Bind failures and registry refusal surface here; the caller treats
/// them as fatal configuration errors.
pub fn start(
    registry: Arc<ThreadRegistry>,
    logic: Arc<LogicLoop>,
    addr: ListenAddr,
) -> Result<()> {
    let bound = match &addr {
        ListenAddr::Unix(path) => {
            let listener = UnixListener::bind(path).map_err(|e| ConnectionError::Setup {
                operation: "bind unix socket",
                source: e,
            })?;
            let _ = listener.set_nonblocking(true);
            BoundListener::Unix(listener, path.clone())
        }
        ListenAddr::Tcp(host, port) => {
            let listener =
                TcpListener::bind((host.as_str(), *port)).map_err(|e| ConnectionError::Setup {
                    operation: "bind tcp socket",
                    source: e,
                })?;
            let _ = listener.set_nonblocking(true);
            BoundListener::Tcp(listener)
        }
    };

    info!(addr = %addr, "listening for control connections");

    let stop = Arc::new(AtomicBool::new(false));
    let accept_registry = Arc::clone(&registry);

    registry.launch("SHIM_LISTENER", WorkerKind::Listener, stop, move |stop| {
        accept_loop(&bound, &accept_registry, &logic, &stop);
    })?;

    Ok(())
}

fn accept_loop(
    bound: &BoundListener,
    registry: &Arc<ThreadRegistry>,
    logic: &Arc<LogicLoop>,
    stop: &AtomicBool,
) {
    static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

    while !stop.load(Ordering::SeqCst) {
        match wait_readable(bound.as_fd(), ACCEPT_POLL_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                error!("listener poll failed: {e}");
                break;
            }
        }

        let socket = match bound.accept() {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                error!("accept() failed: {e}");
                break;
            }
        };

        let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
        let tag = format!("CLIENT[{seq}]");
        debug!(conn = %tag, "accepted control connection");

        let core = ConnectionCore::new(tag.clone(), socket);
        let mut dispatcher = ServerDispatch::new(Arc::clone(registry), Arc::clone(logic));
        let conn_stop = Arc::new(AtomicBool::new(false));

        let launched = registry.launch(&tag, WorkerKind::Connection, conn_stop, move |stop| {
            connection::serve(core, &mut dispatcher, &stop);
        });

        if let Err(e) = launched {
            error!(conn = %tag, "failed to spawn connection thread: {e}");
        }
    }

    debug!("listener loop ending");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::message::{Message, MessageType};
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn logic_fixture(dir: &tempfile::TempDir, registry: &Arc<ThreadRegistry>) -> Arc<LogicLoop> {
        let path = dir.path().join("configuration.cfg");
        std::fs::write(&path, "SP\tSPACE TEMP\t70.0\n").unwrap();
        LogicLoop::new(ConfigStore::load(&path).unwrap(), Arc::clone(registry))
    }

    #[test]
    fn test_hello_ping_pong_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("control.sock");

        let registry = Arc::new(ThreadRegistry::new());
        let logic = logic_fixture(&dir, &registry);

        start(
            Arc::clone(&registry),
            logic,
            ListenAddr::Unix(socket_path.clone()),
        )
        .unwrap();

        // Connect and run the scenario-1 handshake.
        let stream = UnixStream::connect(&socket_path).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        // Server leads with HELLO.
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let hello = Message::parse(&line).unwrap();
        assert_eq!(hello.mtype(), MessageType::Hello);
        assert_eq!(hello.part(0).unwrap(), "VERSION");

        // Reply HELLO, then PING; expect PONG within the keepalive budget.
        writer
            .write_all(Message::hello().to_frame().as_bytes())
            .unwrap();
        writer
            .write_all(Message::ping().to_frame().as_bytes())
            .unwrap();

        line.clear();
        reader.read_line(&mut line).unwrap();
        let pong = Message::parse(&line).unwrap();
        assert_eq!(pong.mtype(), MessageType::Pong);

        registry.stop_all();
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_listener_survives_client_drop() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("control.sock");

        let registry = Arc::new(ThreadRegistry::new());
        let logic = logic_fixture(&dir, &registry);
        start(
            Arc::clone(&registry),
            logic,
            ListenAddr::Unix(socket_path.clone()),
        )
        .unwrap();

        // A client that connects and immediately vanishes.
        drop(UnixStream::connect(&socket_path).unwrap());

        // The listener keeps accepting.
        std::thread::sleep(Duration::from_millis(200));
        let probe = UnixStream::connect(&socket_path);
        assert!(probe.is_ok());

        registry.stop_all();
    }
}
