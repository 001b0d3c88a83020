//! Error types for the HVAC systems library.

use thiserror::Error;

/// The main error type for all library operations.
///
/// Each subsystem owns its error enum; this type folds them together so
/// callers can propagate with `?` across subsystem boundaries.
#[derive(Error, Debug)]
pub enum HvacError {
    /// Mutex acquisition or release failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Configuration file load, save, or lookup failure.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Board state cache indexing failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Serial port or board communication failure.
    #[error("serial error: {0}")]
    Serial(#[from] SerialError),

    /// Malformed or out-of-sequence control protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message queue or message transmission failure.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Transport setup or loss.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Logic layer failure (unknown point names, bad setpoints).
    #[error("logic error: {0}")]
    Logic(#[from] LogicError),
}

/// Errors produced by the bounded-retry lock primitive.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be obtained within the attempt budget.
    #[error("[{tag}] failed to obtain lock after {attempts} attempts")]
    Exhausted {
        /// Tag of the guarded component.
        tag: String,
        /// Number of try-lock attempts made.
        attempts: u32,
    },

    /// The abort predicate tripped while waiting for the lock.
    #[error("[{tag}] lock wait aborted by shutdown flag")]
    Aborted {
        /// Tag of the guarded component.
        tag: String,
    },

    /// A previous holder panicked while holding the lock.
    #[error("[{tag}] lock poisoned by a panicked holder")]
    Poisoned {
        /// Tag of the guarded component.
        tag: String,
    },
}

/// Errors that can occur loading or mutating the configuration store.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration or overlay file could not be read or written.
    #[error("failed to access configuration file '{path}': {source}")]
    FileAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A named record does not exist in the store.
    #[error("no {kind} record named '{name}'")]
    NotFound {
        /// Record type token (SP, MAP, BOARD, ...).
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },
}

/// Errors produced by the board state cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A channel index at or beyond the channel count was supplied.
    ///
    /// This is a programmer error, not a runtime condition.
    #[error("channel {channel} is out of range (board has {limit} AI channels)")]
    ChannelOutOfRange {
        /// The offending channel index.
        channel: usize,
        /// Number of channels on the board.
        limit: usize,
    },
}

/// Errors produced by the serial worker and port plumbing.
#[derive(Error, Debug)]
pub enum SerialError {
    /// The UUCP lock file names a live process.
    #[error("port {device} is locked by live pid {pid}")]
    PortLocked {
        /// Device path.
        device: String,
        /// PID read from the lock file.
        pid: String,
    },

    /// The lock file could not be created.
    #[error("failed to write lock file '{path}': {source}")]
    LockFile {
        /// Lock file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The serial device could not be opened.
    #[error("failed to open {device}: {source}")]
    Open {
        /// Device path.
        device: String,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Applying termios attributes failed.
    #[error("failed to set attributes on {device}: {source}")]
    Attributes {
        /// Device path.
        device: String,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// A read or write on the open port failed.
    #[error("serial I/O failed: {source}")]
    Io {
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// An outgoing message would not fit the board-side buffer.
    #[error("message of {length} bytes exceeds the serial buffer")]
    MessageTooLarge {
        /// Length of the rejected message.
        length: usize,
    },
}

/// Errors raised while parsing or sequencing control protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No separator was found in the inbound line.
    #[error("no separator character in message buffer")]
    MissingSeparator,

    /// The leading length field is not a number.
    #[error("failed to convert '{field}' to a length")]
    BadLengthField {
        /// The offending field text.
        field: String,
    },

    /// The declared length does not match the byte length of the line.
    #[error("declared length {declared} does not match line length {actual}")]
    LengthMismatch {
        /// Length stated in the frame.
        declared: usize,
        /// Actual byte length of the line including the newline.
        actual: usize,
    },

    /// The TYPE field names no known message type.
    #[error("invalid message type: '{label}'")]
    UnknownType {
        /// The offending label.
        label: String,
    },

    /// The message carries the wrong number of parts for its type.
    #[error("{label} message expects {expected} parts, received {actual}")]
    Arity {
        /// Message type label.
        label: &'static str,
        /// Human description of the expected count ("2", ">= 1", ...).
        expected: &'static str,
        /// Actual part count.
        actual: usize,
    },

    /// A part could not be converted to the requested type.
    #[error("failed to parse part {index} ('{value}')")]
    BadPart {
        /// Zero-based part index.
        index: usize,
        /// The offending part text.
        value: String,
    },

    /// A message arrived before HELLO completed, or HELLO was not first.
    #[error("protocol sequence error: {reason}")]
    Sequence {
        /// What went wrong.
        reason: &'static str,
    },

    /// The peer requested a protocol version newer than we speak.
    #[error("requested protocol version {requested} exceeds supported version {supported}")]
    UnsupportedVersion {
        /// Version the peer asked for.
        requested: u32,
        /// Our maximum.
        supported: u32,
    },
}

/// Errors produced by the message queues and the framed send path.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The socket write did not complete within the retry budget.
    #[error("failed to write complete message after {attempts} attempts")]
    WriteExhausted {
        /// Number of write attempts made.
        attempts: u32,
    },

    /// The socket write itself failed.
    #[error("failed to write to peer socket: {source}")]
    Write {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A message was enqueued to a full queue in fail-on-overflow mode.
    #[error("message queue full ({capacity} messages)")]
    Overflow {
        /// Queue capacity.
        capacity: usize,
    },

    /// A message was popped from an empty queue.
    ///
    /// This is a programmer error, not a runtime condition.
    #[error("no messages available to pop")]
    Underflow,
}

/// Errors raised by transport setup and the per-connection event loop.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Socket creation, bind, connect, or accept failed.
    #[error("{operation} failed: {source}")]
    Setup {
        /// Which socket call failed.
        operation: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Closed,

    /// Polling the connection socket failed.
    #[error("poll on connection socket failed: {source}")]
    Poll {
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The keepalive exchange timed out.
    #[error("no PONG from peer within {timeout_secs} seconds")]
    KeepaliveExpired {
        /// The keepalive allowance.
        timeout_secs: u64,
    },

    /// A request-response wait elapsed without a reply.
    #[error("timed out waiting for a {label} reply")]
    ReplyTimeout {
        /// Expected reply type label.
        label: &'static str,
    },
}

/// Errors raised by the logic layer.
#[derive(Error, Debug)]
pub enum LogicError {
    /// A point name does not appear in the configuration map.
    #[error("no mapped point named '{name}'")]
    UnknownPoint {
        /// The name that was looked up.
        name: String,
    },

    /// The logic loop references a board with no live serial worker.
    #[error("no serial worker for board '{tag}'")]
    NoWorker {
        /// Board tag.
        tag: String,
    },
}

/// Convenience result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, HvacError>;
