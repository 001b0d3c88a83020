//! Per-connection plumbing: socket abstraction, line reader, keepalive.
//!
//! [`ConnectionCore`] owns one socket plus its codec state and implements
//! the shared event-loop building blocks: HELLO on start, a poll with the
//! select window, base handling of PING/HELLO/PONG, and the keepalive
//! decision that drops a peer whose PONGs stop arriving. Role-specific
//! behavior is supplied through the [`Dispatch`] trait: the server-side
//! table lives in [`crate::dispatch`], the client-side condvar signaling
//! in [`crate::client`].

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error};

use crate::cache::Stamp;
use crate::error::{ConnectionError, ProtocolError, Result};
use crate::message::{Codec, Message, MessageType};

/// Base poll window in seconds.
pub const SELECT_TIME_SECS: u64 = 1;

/// Keepalive divider: PINGs go out every `divider` timeouts, and the poll
/// window is widened by one divider slice.
pub const PING_DIVIDER: u64 = 5;

/// Seconds a peer gets to answer a PING before the connection drops.
pub const MAX_PP_TIMEOUT_SECS: i64 = (SELECT_TIME_SECS * PING_DIVIDER) as i64;

/// The poll window: one base second plus one divider slice (200 ms).
pub const SELECT_WINDOW_MS: u16 =
    (SELECT_TIME_SECS * 1000 + SELECT_TIME_SECS * 1000 / PING_DIVIDER) as u16;

/// Read buffer for one socket drain.
const READ_BUF_SIZE: usize = 4096;

/// A connected stream socket, Unix-domain or TCP.
#[derive(Debug)]
pub enum Socket {
    /// Unix-domain stream.
    Unix(UnixStream),
    /// TCP stream.
    Tcp(TcpStream),
}

impl Socket {
    /// Borrow the descriptor for polling.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Unix(s) => s.as_fd(),
            Self::Tcp(s) => s.as_fd(),
        }
    }

    /// A second handle to the same socket (used to poll without a lock).
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Setup`] when the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = match self {
            Self::Unix(s) => s.try_clone().map(Self::Unix),
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
        };
        Ok(cloned.map_err(|e| ConnectionError::Setup {
            operation: "socket dup",
            source: e,
        })?)
    }

    /// Orderly shutdown of both directions; errors are ignored.
    pub fn shutdown(&self) {
        let _ = match self {
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Polls a descriptor for readability.
///
/// # Errors
///
/// [`ConnectionError::Poll`] when the poll call itself fails.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: u16) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(nix::Error::EINTR) => Ok(false),
        Err(e) => Err(ConnectionError::Poll { source: e }.into()),
    }
}

/// Line-buffering reader over a socket.
///
/// Collects bytes across reads and hands back complete newline-terminated
/// lines (terminator included, as the codec's length law expects).
#[derive(Debug, Default)]
pub struct SocketReader {
    partial: Vec<u8>,
}

impl SocketReader {
    /// Drains one read's worth of bytes and returns the complete lines.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] on end of stream, `Setup` on read
    /// failure.
    pub fn read_lines(&mut self, socket: &mut Socket) -> Result<Vec<String>> {
        let mut buf = [0u8; READ_BUF_SIZE];

        let n = match socket.read(&mut buf) {
            Ok(0) => return Err(ConnectionError::Closed.into()),
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                0
            }
            Err(e) => {
                return Err(ConnectionError::Setup {
                    operation: "socket read",
                    source: e,
                }
                .into());
            }
        };

        self.partial.extend_from_slice(&buf[..n]);

        let mut lines = Vec::new();
        while let Some(nl) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=nl).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        Ok(lines)
    }
}

/// What a dispatcher did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// The message was consumed.
    Processed,
    /// The message was not recognized; the caller decides what that means.
    Ignored,
}

/// Role-specific message handling plugged into the connection loop.
pub trait Dispatch {
    /// Handles one inbound message the base handler did not consume.
    ///
    /// An error returned from here terminates the connection; handlers
    /// that want to keep the peer alive reply with an ERROR message and
    /// return [`DispatchResult::Processed`] instead.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::HvacError`]; the connection closes on it.
    fn dispatch(&mut self, core: &mut ConnectionCore, message: &Message) -> Result<DispatchResult>;
}

/// One live connection: socket, codec state, keepalive bookkeeping.
#[derive(Debug)]
pub struct ConnectionCore {
    tag: String,
    socket: Socket,
    /// Codec rings and negotiation state for this connection.
    pub codec: Codec,
    reader: SocketReader,
    /// -1 before the initial PING, then consecutive poll timeouts.
    timeout_counter: i64,
}

impl ConnectionCore {
    /// Wraps an accepted or connected socket.
    pub fn new(tag: impl Into<String>, socket: Socket) -> Self {
        Self {
            tag: tag.into(),
            socket,
            codec: Codec::new(),
            reader: SocketReader::default(),
            timeout_counter: -1,
        }
    }

    /// Connection tag for logs.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// A pollable duplicate of the underlying socket.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Setup`] when duplication fails.
    pub fn poll_handle(&self) -> Result<Socket> {
        self.socket.try_clone()
    }

    /// Polls this connection's socket for the standard select window.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Poll`] when polling fails.
    pub fn poll(&self) -> Result<bool> {
        wait_readable(self.socket.as_fd(), SELECT_WINDOW_MS)
    }

    /// Sends one message through the codec.
    ///
    /// # Errors
    ///
    /// [`crate::error::MessageError`] on write failure.
    pub fn send(&mut self, message: Message) -> Result<()> {
        self.codec.send(&mut self.socket, message)?;
        Ok(())
    }

    /// Handles readable data: drains lines, parses, and feeds each message
    /// through the base handler then `dispatcher`.
    ///
    /// A line that fails to parse is logged and skipped; an error escaping
    /// the dispatcher propagates and terminates the connection.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] when the peer is gone, or any error the
    /// dispatcher surfaces.
    pub fn handle_readable(&mut self, dispatcher: &mut dyn Dispatch) -> Result<()> {
        if self.timeout_counter != -1 {
            self.timeout_counter = 0;
        }

        let lines = self.reader.read_lines(&mut self.socket)?;

        for line in lines {
            let message = match self.codec.parse_inbound(&line) {
                Ok(message) => message,
                Err(e) => {
                    // Malformed or unknown traffic earns an ERROR reply but
                    // keeps the connection open.
                    debug!(conn = %self.tag, "failed to parse message: {e}");
                    self.send(Message::error(2, e.to_string()))?;
                    continue;
                }
            };

            match self.process_base(&message) {
                Ok(DispatchResult::Ignored) => {
                    dispatcher.dispatch(self, &message)?;
                }
                Ok(DispatchResult::Processed) => {}
                Err(e) => {
                    // Sequence and negotiation violations are fatal, but
                    // the peer still learns why before the drop.
                    let _ = self.send(Message::error(2, e.to_string()));
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Base handling shared by every connection role.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Sequence`] for traffic before HELLO and for HELLO
    /// violations; both are fatal to the connection.
    fn process_base(&mut self, message: &Message) -> Result<DispatchResult> {
        if !self.codec.is_negotiated() && message.mtype() != MessageType::Hello {
            return Err(ProtocolError::Sequence {
                reason: "traffic before HELLO",
            }
            .into());
        }

        match message.mtype() {
            MessageType::Ping => {
                self.send(Message::pong())?;
                Ok(DispatchResult::Processed)
            }
            MessageType::Hello => {
                self.codec.process_hello(message)?;
                Ok(DispatchResult::Processed)
            }
            MessageType::Pong => {
                // Already recorded in the inbound ring for keepalive aging.
                Ok(DispatchResult::Processed)
            }
            _ => Ok(DispatchResult::Ignored),
        }
    }

    /// Keepalive bookkeeping for one poll timeout.
    ///
    /// Returns `true` when the connection should be dropped. The first
    /// timeout sends the initial PING; after `divider - 1` consecutive
    /// timeouts the latest PING/PONG ages decide between a fresh PING and
    /// a drop.
    ///
    /// # Errors
    ///
    /// Send failures propagate (and also mean the peer is unreachable).
    pub fn handle_timeout(&mut self) -> Result<bool> {
        if self.timeout_counter == -1 {
            self.timeout_counter = 0;
            return match self.send(Message::ping()) {
                Ok(()) => Ok(false),
                Err(e) => {
                    error!(conn = %self.tag, "failed to send initial ping: {e}");
                    Ok(true)
                }
            };
        }

        self.timeout_counter += 1;
        if self.timeout_counter < (PING_DIVIDER as i64 - 1) {
            return Ok(false);
        }
        self.timeout_counter = 0;

        let now = Stamp::now();
        let ping_sent = self
            .codec
            .latest_outgoing_ping()
            .and_then(|ping| ping.sent)
            .unwrap_or(now);

        match self.codec.latest_inbound_pong().and_then(|pong| pong.received) {
            None => {
                // Never seen a PONG, initial included.
                if now.secs - ping_sent.secs >= MAX_PP_TIMEOUT_SECS {
                    error!(
                        conn = %self.tag,
                        "dropping connection; no PONG response in the last {MAX_PP_TIMEOUT_SECS} seconds"
                    );
                    return Ok(true);
                }
                Ok(false)
            }
            Some(pong_received) => {
                if pong_received.secs - ping_sent.secs > MAX_PP_TIMEOUT_SECS {
                    error!(
                        conn = %self.tag,
                        "dropping connection; last PONG too old ({} seconds)",
                        pong_received.secs - ping_sent.secs
                    );
                    return Ok(true);
                }

                match self.send(Message::ping()) {
                    Ok(()) => Ok(false),
                    Err(e) => {
                        error!(conn = %self.tag, "failed to send ping: {e}");
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Closes the socket.
    pub fn close(&self) {
        self.socket.shutdown();
    }
}

/// Runs a server-side connection to completion.
///
/// Sends HELLO, then alternates polling with keepalive until the peer
/// drops, a dispatch error surfaces, or `stop` trips. Always closes the
/// socket on the way out.
pub fn serve(
    mut core: ConnectionCore,
    dispatcher: &mut dyn Dispatch,
    stop: &std::sync::atomic::AtomicBool,
) {
    if let Err(e) = core.send(Message::hello()) {
        error!(conn = %core.tag(), "failed to send HELLO: {e}");
        core.close();
        return;
    }

    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        let readable = match core.poll() {
            Ok(readable) => readable,
            Err(e) => {
                error!(conn = %core.tag(), "poll failed: {e}");
                break;
            }
        };

        let result = if readable {
            core.handle_readable(dispatcher).map(|()| false)
        } else {
            core.handle_timeout()
        };

        match result {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) => {
                debug!(conn = %core.tag(), "connection terminating: {e}");
                break;
            }
        }
    }

    core.close();
}
