//! Client side of the control protocol.
//!
//! [`ClientConnection`] connects to a logic core over the Unix-domain or
//! TCP socket, runs the shared connection event loop on its own thread,
//! and exposes `send`/`send_and_wait` to the embedding program (the shim,
//! the data logger). Request-response pairing uses a condition variable:
//! the caller holds the connection lock from send until it waits, so the
//! event loop cannot digest the reply before the waiter is ready for it.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::connection::{
    ConnectionCore, Dispatch, DispatchResult, SELECT_WINDOW_MS, Socket, wait_readable,
};
use crate::error::{ConnectionError, Result};
use crate::listener::ListenAddr;
use crate::message::{Message, MessageType};
use crate::sync::Guarded;

/// How long `send_and_wait` waits for the reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `connect` waits for version negotiation to complete.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side dispatcher: wakes request-response waiters for every
/// message the base handler leaves alone.
struct ClientDispatch {
    wake: Arc<Condvar>,
}

impl Dispatch for ClientDispatch {
    fn dispatch(&mut self, _core: &mut ConnectionCore, _message: &Message) -> Result<DispatchResult> {
        self.wake.notify_all();
        Ok(DispatchResult::Processed)
    }
}

/// A live client connection to a logic core.
pub struct ClientConnection {
    core: Arc<Guarded<ConnectionCore>>,
    wake: Arc<Condvar>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Connects, starts the event loop, and waits for HELLO negotiation.
    ///
    /// # Errors
    ///
    /// Transport failures and a negotiation that never completes.
    pub fn connect(addr: &ListenAddr) -> Result<Self> {
        let socket = match addr {
            ListenAddr::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| ConnectionError::Setup {
                    operation: "connect unix socket",
                    source: e,
                })?;
                let _ = stream.set_nonblocking(true);
                Socket::Unix(stream)
            }
            ListenAddr::Tcp(host, port) => {
                let stream =
                    TcpStream::connect((host.as_str(), *port)).map_err(|e| {
                        ConnectionError::Setup {
                            operation: "connect tcp socket",
                            source: e,
                        }
                    })?;
                let _ = stream.set_nonblocking(true);
                Socket::Tcp(stream)
            }
        };

        let core = ConnectionCore::new("CLIENT_CONTEXT", socket);
        let poll_handle = core.poll_handle()?;
        let core = Arc::new(Guarded::new("CLIENT_CONTEXT", core));
        let wake = Arc::new(Condvar::new());
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let core = Arc::clone(&core);
            let wake = Arc::clone(&wake);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("client-conn".to_string())
                .spawn(move || event_loop(&core, poll_handle, &wake, &stop))
                .map_err(|e| ConnectionError::Setup {
                    operation: "thread spawn",
                    source: e,
                })?
        };

        let client = Self {
            core,
            wake,
            stop,
            thread: Some(thread),
        };

        client.await_negotiation()?;
        debug!("connected to remote logic core");
        Ok(client)
    }

    fn await_negotiation(&self) -> Result<()> {
        let deadline = Instant::now() + NEGOTIATION_TIMEOUT;

        while Instant::now() < deadline {
            {
                let core = self.core.lock(&self.stop)?;
                if core.codec.is_negotiated() {
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        Err(ConnectionError::ReplyTimeout { label: "HELLO" }.into())
    }

    /// Sends a message without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Lock and transport failures propagate.
    pub fn send(&self, message: Message) -> Result<()> {
        let mut core = self.core.lock(&self.stop)?;
        core.send(message)
    }

    /// Sends a request and waits for the latest reply of the same type.
    ///
    /// Callers serialize their own request-response pairs; the connection
    /// lock held across send-and-wait provides that.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ReplyTimeout`] when nothing of the reply type
    /// arrives within the window.
    pub fn send_and_wait(&self, message: Message) -> Result<Message> {
        let reply_type = message.mtype();

        let mut core = self.core.lock(&self.stop)?;
        core.send(message)?;

        let (core, timed_out) = self.core.wait_timeout(core, &self.wake, REPLY_TIMEOUT);
        if timed_out {
            return Err(ConnectionError::ReplyTimeout {
                label: reply_type.label(),
            }
            .into());
        }

        core.codec
            .latest_inbound_of(reply_type)
            .cloned()
            .ok_or_else(|| {
                ConnectionError::ReplyTimeout {
                    label: reply_type.label(),
                }
                .into()
            })
    }

    /// Latest inbound message of `mtype`, if one has arrived.
    ///
    /// # Errors
    ///
    /// Lock failures propagate.
    pub fn latest_inbound(&self, mtype: MessageType) -> Result<Option<Message>> {
        let core = self.core.lock(&self.stop)?;
        Ok(core.codec.latest_inbound_of(mtype).cloned())
    }

    /// Stops the event loop and closes the connection.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection").finish_non_exhaustive()
    }
}

fn event_loop(
    core: &Guarded<ConnectionCore>,
    poll_handle: Socket,
    wake: &Arc<Condvar>,
    stop: &Arc<AtomicBool>,
) {
    let mut dispatcher = ClientDispatch {
        wake: Arc::clone(wake),
    };

    // Both ends lead with HELLO.
    {
        let Ok(mut core) = core.lock(stop) else {
            return;
        };
        if let Err(e) = core.send(Message::hello()) {
            error!("failed to send HELLO: {e}");
            core.close();
            return;
        }
    }

    while !stop.load(Ordering::SeqCst) {
        // Poll on the duplicate handle so waiters can use the lock.
        let readable = match wait_readable(poll_handle.as_fd(), SELECT_WINDOW_MS) {
            Ok(readable) => readable,
            Err(e) => {
                error!("client poll failed: {e}");
                break;
            }
        };

        if !readable {
            // The server originates keepalive PINGs; the base handler
            // answers them when they arrive. Nothing to do on a timeout.
            continue;
        }

        let Ok(mut core) = core.lock(stop) else {
            break;
        };
        if let Err(e) = core.handle_readable(&mut dispatcher) {
            debug!("client connection terminating: {e}");
            break;
        }
    }

    if let Ok(core) = core.lock(&AtomicBool::new(false)) {
        core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::listener;
    use crate::registry::ThreadRegistry;

    fn server_fixture(
        dir: &tempfile::TempDir,
    ) -> (Arc<ThreadRegistry>, std::path::PathBuf) {
        let config_path = dir.path().join("configuration.cfg");
        std::fs::write(&config_path, "SP\tSPACE TEMP\t70.0\nSP\tSPACE RH\t50.0\n").unwrap();

        let registry = Arc::new(ThreadRegistry::new());
        let logic = crate::logic::LogicLoop::new(
            ConfigStore::load(&config_path).unwrap(),
            Arc::clone(&registry),
        );

        let socket_path = dir.path().join("control.sock");
        listener::start(
            Arc::clone(&registry),
            logic,
            ListenAddr::Unix(socket_path.clone()),
        )
        .unwrap();

        (registry, socket_path)
    }

    #[test]
    fn test_connect_negotiates() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, socket_path) = server_fixture(&dir);

        let client = ClientConnection::connect(&ListenAddr::Unix(socket_path)).unwrap();
        client.disconnect();
        registry.stop_all();
    }

    #[test]
    fn test_send_and_wait_labels() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, socket_path) = server_fixture(&dir);

        let client = ClientConnection::connect(&ListenAddr::Unix(socket_path)).unwrap();
        let reply = client.send_and_wait(Message::get_labels("SP")).unwrap();

        assert_eq!(reply.mtype(), MessageType::GetLabels);
        assert_eq!(reply.parts().len(), 2);
        assert!(reply.part(0).unwrap().contains("SPACE RH"));

        client.disconnect();
        registry.stop_all();
    }

    #[test]
    fn test_send_and_wait_times_out_without_server_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, socket_path) = server_fixture(&dir);

        let client = ClientConnection::connect(&ListenAddr::Unix(socket_path)).unwrap();

        // SET_SP gets no reply; the wait must time out rather than hang.
        let err = client
            .send_and_wait(Message::set_sp("SPACE TEMP", 71.0))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::HvacError::Connection(ConnectionError::ReplyTimeout { .. })
        ));

        client.disconnect();
        registry.stop_all();
    }
}
