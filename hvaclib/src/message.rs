//! Control protocol messages: framing, parsing, and bounded queues.
//!
//! Wire form of one message:
//!
//! ```text
//! <N>|<TYPE>|<part0>|<part1>|...\n
//! ```
//!
//! where `<N>` is the byte length of the entire line *including the length
//! field itself and the trailing newline*. Building a frame therefore
//! computes the length iteratively, since widening the length field can
//! change the total. The parser enforces the same law exactly.

use std::collections::VecDeque;
use std::io::Write;

use crate::cache::Stamp;
use crate::error::{MessageError, ProtocolError};

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Field separator inside a frame.
pub const SEP: char = '|';

/// Default depth of the per-connection message rings.
pub const QUEUE_SIZE: usize = 32;

/// Write attempts allowed for one frame before giving up.
const WRITE_ATTEMPTS: u32 = 100;

/// All supported message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Connection liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Version negotiation; must be the first message on a connection.
    Hello,
    /// Packed board snapshot request/response.
    ReadStatus,
    /// Raw AI ring request/response.
    ReadStatusRawAnalog,
    /// Set digital output bits.
    SetStatus,
    /// Set PMIC bits.
    SetPmicStatus,
    /// Configured label listing for one point kind.
    GetLabels,
    /// Setpoint mutation.
    SetSp,
    /// Error report.
    Error,
    /// L1 calibration read.
    GetL1CalVals,
    /// L2 calibration read.
    GetL2CalVals,
    /// L1 calibration write.
    SetL1CalVals,
    /// L2 calibration write.
    SetL2CalVals,
    /// Board boot counter read.
    GetBootCount,
    /// Key/value dump of every mapped point from the logic layer.
    ReadLogicStatus,
    /// Force an AI channel to a fixed value.
    ForceAiValue,
    /// Clear an AI force.
    UnforceAiValue,
}

impl MessageType {
    /// The wire label of this type.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Hello => "HELLO",
            Self::ReadStatus => "READ_STATUS",
            Self::ReadStatusRawAnalog => "READ_STATUS_RAW_ANALOG",
            Self::SetStatus => "SET_STATUS",
            Self::SetPmicStatus => "SET_PMIC_STATUS",
            Self::GetLabels => "GET_LABELS",
            Self::SetSp => "SET_SP",
            Self::Error => "ERROR",
            Self::GetL1CalVals => "GET_L1_CAL_VALS",
            Self::GetL2CalVals => "GET_L2_CAL_VALS",
            Self::SetL1CalVals => "SET_L1_CAL_VALS",
            Self::SetL2CalVals => "SET_L2_CAL_VALS",
            Self::GetBootCount => "GET_BOOT_COUNT",
            Self::ReadLogicStatus => "READ_LOGIC_STATUS",
            Self::ForceAiValue => "FORCE_AI_VALUE",
            Self::UnforceAiValue => "UNFORCE_AI_VALUE",
        }
    }

    /// Resolves a wire label.
    pub fn from_label(label: &str) -> Option<Self> {
        Some(match label {
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "HELLO" => Self::Hello,
            "READ_STATUS" => Self::ReadStatus,
            "READ_STATUS_RAW_ANALOG" => Self::ReadStatusRawAnalog,
            "SET_STATUS" => Self::SetStatus,
            "SET_PMIC_STATUS" => Self::SetPmicStatus,
            "GET_LABELS" => Self::GetLabels,
            "SET_SP" => Self::SetSp,
            "ERROR" => Self::Error,
            "GET_L1_CAL_VALS" => Self::GetL1CalVals,
            "GET_L2_CAL_VALS" => Self::GetL2CalVals,
            "SET_L1_CAL_VALS" => Self::SetL1CalVals,
            "SET_L2_CAL_VALS" => Self::SetL2CalVals,
            "GET_BOOT_COUNT" => Self::GetBootCount,
            "READ_LOGIC_STATUS" => Self::ReadLogicStatus,
            "FORCE_AI_VALUE" => Self::ForceAiValue,
            "UNFORCE_AI_VALUE" => Self::UnforceAiValue,
            _ => return None,
        })
    }
}

/// One protocol message with its lifecycle timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    mtype: MessageType,
    parts: Vec<String>,
    /// When the message object was created.
    pub created: Stamp,
    /// When the message was written to the wire, if it has been.
    pub sent: Option<Stamp>,
    /// When the message was read off the wire, if inbound.
    pub received: Option<Stamp>,
}

impl Message {
    /// A new outbound message.
    pub fn new(mtype: MessageType, parts: Vec<String>) -> Self {
        Self {
            mtype,
            parts,
            created: Stamp::now(),
            sent: None,
            received: None,
        }
    }

    /// The message type.
    pub fn mtype(&self) -> MessageType {
        self.mtype
    }

    /// The ordered string parts, type label excluded.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Part `index` as text.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BadPart`] when the index is out of range.
    pub fn part(&self, index: usize) -> Result<&str, ProtocolError> {
        self.parts
            .get(index)
            .map(String::as_str)
            .ok_or(ProtocolError::BadPart {
                index,
                value: String::from("<missing>"),
            })
    }

    /// Part `index` parsed as the requested number type.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::BadPart`] when missing or unparseable.
    pub fn part_num<T: std::str::FromStr>(&self, index: usize) -> Result<T, ProtocolError> {
        let text = self.part(index)?;
        text.parse().map_err(|_| ProtocolError::BadPart {
            index,
            value: text.to_string(),
        })
    }

    /// Renders the complete framed line, newline included.
    pub fn to_frame(&self) -> String {
        let mut payload = self.mtype.label().to_string();
        for part in &self.parts {
            payload.push(SEP);
            payload.push_str(part);
        }

        // The length field counts itself, so grow it until it settles.
        let mut total = payload.len() + 2; // separator + newline
        loop {
            let candidate = payload.len() + 2 + decimal_width(total);
            if candidate == total {
                break;
            }
            total = candidate;
        }

        format!("{total}{SEP}{payload}\n")
    }

    /// Parses one framed line (trailing newline included) and stamps it
    /// received.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] for malformed framing, unknown types, or
    /// arity violations.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let sep_idx = line.find(SEP).ok_or(ProtocolError::MissingSeparator)?;
        let length_field = &line[..sep_idx];

        let declared: usize = length_field
            .parse()
            .map_err(|_| ProtocolError::BadLengthField {
                field: length_field.to_string(),
            })?;

        if declared != line.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: line.len(),
            });
        }

        let body = line[sep_idx + 1..].trim_end_matches(['\n', '\r']);
        let mut fields = body.split(SEP).filter(|f| !f.is_empty());

        let label = fields.next().ok_or(ProtocolError::Sequence {
            reason: "no message type specified",
        })?;
        let mtype = MessageType::from_label(label).ok_or_else(|| ProtocolError::UnknownType {
            label: label.to_string(),
        })?;

        let parts: Vec<String> = fields.map(str::to_string).collect();
        check_arity(mtype, parts.len())?;

        Ok(Self {
            mtype,
            parts,
            created: Stamp::now(),
            sent: None,
            received: Some(Stamp::now()),
        })
    }

    // ── Constructors for the standard traffic ───────────────────────────

    /// HELLO carrying our protocol version.
    pub fn hello() -> Self {
        Self::new(
            MessageType::Hello,
            vec!["VERSION".to_string(), PROTOCOL_VERSION.to_string()],
        )
    }

    /// PING.
    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    /// PONG.
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, Vec::new())
    }

    /// ERROR with a numeric code and text.
    pub fn error(code: i32, text: impl Into<String>) -> Self {
        Self::new(MessageType::Error, vec![code.to_string(), text.into()])
    }

    /// READ_STATUS request for one board.
    pub fn read_status(board: &str) -> Self {
        Self::new(MessageType::ReadStatus, vec![board.to_string()])
    }

    /// READ_STATUS_RAW_ANALOG request for one board.
    pub fn read_raw_analog(board: &str) -> Self {
        Self::new(MessageType::ReadStatusRawAnalog, vec![board.to_string()])
    }

    /// SET_STATUS request.
    pub fn set_status(board: &str, bits: u8) -> Self {
        Self::new(
            MessageType::SetStatus,
            vec![board.to_string(), bits.to_string()],
        )
    }

    /// SET_PMIC_STATUS request.
    pub fn set_pmic_status(board: &str, bits: u8) -> Self {
        Self::new(
            MessageType::SetPmicStatus,
            vec![board.to_string(), bits.to_string()],
        )
    }

    /// GET_LABELS request for one point kind.
    pub fn get_labels(kind: &str) -> Self {
        Self::new(
            MessageType::GetLabels,
            vec![kind.to_string(), "REQ".to_string()],
        )
    }

    /// SET_SP request.
    pub fn set_sp(name: &str, value: f64) -> Self {
        Self::new(
            MessageType::SetSp,
            vec![name.to_string(), value.to_string()],
        )
    }

    /// READ_LOGIC_STATUS request.
    pub fn read_logic_status() -> Self {
        Self::new(MessageType::ReadLogicStatus, Vec::new())
    }

    /// FORCE_AI_VALUE request.
    pub fn force_ai(board: &str, channel: u8, value: u16) -> Self {
        Self::new(
            MessageType::ForceAiValue,
            vec![board.to_string(), channel.to_string(), value.to_string()],
        )
    }

    /// UNFORCE_AI_VALUE request.
    pub fn unforce_ai(board: &str, channel: u8) -> Self {
        Self::new(
            MessageType::UnforceAiValue,
            vec![board.to_string(), channel.to_string()],
        )
    }

    /// SET_L1_CAL_VALS / SET_L2_CAL_VALS request.
    pub fn set_cal_vals(level: u8, board: &str, vals: &[u16]) -> Self {
        let mtype = if level == 1 {
            MessageType::SetL1CalVals
        } else {
            MessageType::SetL2CalVals
        };
        let mut parts = vec![board.to_string()];
        parts.extend(vals.iter().map(u16::to_string));
        Self::new(mtype, parts)
    }

    /// GET_BOOT_COUNT request.
    pub fn get_boot_count(board: &str) -> Self {
        Self::new(MessageType::GetBootCount, vec![board.to_string()])
    }
}

fn decimal_width(mut n: usize) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

fn check_arity(mtype: MessageType, count: usize) -> Result<(), ProtocolError> {
    let (ok, expected) = match mtype {
        MessageType::Hello => (count == 2, "2"),
        MessageType::Ping | MessageType::Pong => (count == 0, "0"),
        MessageType::SetStatus | MessageType::SetPmicStatus => (count == 2, "2"),
        MessageType::ReadStatus | MessageType::ReadStatusRawAnalog => (count >= 1, ">= 1"),
        MessageType::SetL1CalVals | MessageType::SetL2CalVals => (count >= 1, ">= 1"),
        MessageType::ForceAiValue => (count == 3, "3"),
        MessageType::UnforceAiValue => (count == 2, "2"),
        MessageType::GetLabels => (count >= 2, ">= 2"),
        MessageType::Error => (count >= 2, ">= 2"),
        MessageType::SetSp => (count == 2, "2"),
        MessageType::GetL1CalVals
        | MessageType::GetL2CalVals
        | MessageType::GetBootCount => (count >= 1, ">= 1"),
        MessageType::ReadLogicStatus => (true, "any"),
    };

    if ok {
        Ok(())
    } else {
        Err(ProtocolError::Arity {
            label: mtype.label(),
            expected,
            actual: count,
        })
    }
}

/// Overflow behavior when enqueueing to a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Drop the oldest message to make room.
    LoseOverflow,
    /// Fail the enqueue.
    ErrorOverflow,
}

/// A bounded FIFO ring of messages.
#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl MessageQueue {
    /// A ring holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a message, applying `mode` on overflow.
    ///
    /// # Errors
    ///
    /// [`MessageError::Overflow`] in [`AppendMode::ErrorOverflow`] when full.
    pub fn add(&mut self, message: Message, mode: AppendMode) -> Result<(), MessageError> {
        if self.messages.len() >= self.capacity {
            match mode {
                AppendMode::LoseOverflow => {
                    self.messages.pop_front();
                }
                AppendMode::ErrorOverflow => {
                    return Err(MessageError::Overflow {
                        capacity: self.capacity,
                    });
                }
            }
        }

        self.messages.push_back(message);
        Ok(())
    }

    /// Removes and returns the oldest message.
    ///
    /// # Errors
    ///
    /// [`MessageError::Underflow`] when the ring is empty.
    pub fn pop_first(&mut self) -> Result<Message, MessageError> {
        self.messages.pop_front().ok_or(MessageError::Underflow)
    }

    /// The newest queued message of `mtype`, if any.
    pub fn latest_of_type(&self, mtype: MessageType) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.mtype() == mtype)
    }
}

/// Per-connection codec state: in/out rings plus negotiation status.
#[derive(Debug)]
pub struct Codec {
    /// Messages read off the wire.
    pub inbound: MessageQueue,
    /// Messages written to the wire.
    pub outbound: MessageQueue,
    negotiated: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Fresh codec state with the default ring depth.
    pub fn new() -> Self {
        Self {
            inbound: MessageQueue::new(QUEUE_SIZE),
            outbound: MessageQueue::new(QUEUE_SIZE),
            negotiated: false,
        }
    }

    /// Whether a supported HELLO has been processed on this connection.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Parses one line into the inbound ring and returns a copy.
    ///
    /// # Errors
    ///
    /// [`ProtocolError`] for malformed frames.
    pub fn parse_inbound(&mut self, line: &str) -> Result<Message, ProtocolError> {
        let message = Message::parse(line)?;
        // The ring is advisory history; losing the oldest entry is fine.
        let _ = self.inbound.add(message.clone(), AppendMode::LoseOverflow);
        Ok(message)
    }

    /// Validates an inbound HELLO and flips the negotiated flag.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Sequence`] when HELLO is not the first inbound
    /// message, [`ProtocolError::UnsupportedVersion`] for versions newer
    /// than ours.
    pub fn process_hello(&mut self, message: &Message) -> Result<(), ProtocolError> {
        if self.inbound.len() > 1 {
            return Err(ProtocolError::Sequence {
                reason: "HELLO must be the first message received",
            });
        }

        let requested: u32 = message.part_num(1)?;
        if requested > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                requested,
                supported: PROTOCOL_VERSION,
            });
        }

        self.negotiated = true;
        Ok(())
    }

    /// Frames and writes `message`, retrying on partial writes, then tags
    /// it sent and records it in the outbound ring.
    ///
    /// # Errors
    ///
    /// [`MessageError`] when the socket fails or the retry budget runs out.
    pub fn send(&mut self, writer: &mut dyn Write, mut message: Message) -> Result<(), MessageError> {
        let frame = message.to_frame();
        let bytes = frame.as_bytes();
        let mut written = 0usize;
        let mut attempts = 0u32;

        while written < bytes.len() {
            attempts += 1;
            if attempts > WRITE_ATTEMPTS {
                return Err(MessageError::WriteExhausted {
                    attempts: WRITE_ATTEMPTS,
                });
            }

            match writer.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Peer socket buffer full; give the kernel a moment.
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(MessageError::Write { source: e }),
            }
        }

        message.sent = Some(Stamp::now());
        let _ = self.outbound.add(message, AppendMode::LoseOverflow);
        Ok(())
    }

    /// Newest outbound PING, for keepalive aging.
    pub fn latest_outgoing_ping(&self) -> Option<&Message> {
        self.outbound.latest_of_type(MessageType::Ping)
    }

    /// Newest inbound PONG, for keepalive aging.
    pub fn latest_inbound_pong(&self) -> Option<&Message> {
        self.inbound.latest_of_type(MessageType::Pong)
    }

    /// Newest inbound message of `mtype`.
    pub fn latest_inbound_of(&self, mtype: MessageType) -> Option<&Message> {
        self.inbound.latest_of_type(mtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_law() {
        for message in [
            Message::ping(),
            Message::hello(),
            Message::read_status("BOARD1"),
            Message::set_status("BOARD1", 5),
            Message::set_cal_vals(1, "BOARD1", &[0, 1, 2, 3, 4, 5, 6, 7]),
            Message::error(42, "something broke"),
        ] {
            let frame = message.to_frame();
            let declared: usize = frame.split(SEP).next().unwrap().parse().unwrap();
            assert_eq!(declared, frame.len(), "law violated for {frame:?}");
        }
    }

    #[test]
    fn test_known_frames() {
        assert_eq!(Message::ping().to_frame(), "7|PING\n");
        assert_eq!(Message::hello().to_frame(), "19|HELLO|VERSION|1\n");
        assert_eq!(
            Message::set_status("BOARD1", 5).to_frame(),
            "23|SET_STATUS|BOARD1|5\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let original = Message::force_ai("BOARD1", 0, 2048);
        let parsed = Message::parse(&original.to_frame()).unwrap();

        assert_eq!(parsed.mtype(), MessageType::ForceAiValue);
        assert_eq!(parsed.parts(), original.parts());
        assert!(parsed.received.is_some());

        // build(parse(x)) == x
        assert_eq!(parsed.to_frame(), original.to_frame());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = Message::parse("99|PING\n").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::LengthMismatch { declared: 99, .. }
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        // Self-consistent length so only the type is at fault.
        let frame = "16|FROBNICATE|x\n";
        assert_eq!(frame.len(), 16);
        let err = Message::parse(frame).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType { .. }));
    }

    #[test]
    fn test_arity_enforced() {
        // SET_STATUS with one part.
        let frame = Message::new(MessageType::SetStatus, vec!["BOARD1".to_string()]).to_frame();
        let err = Message::parse(&frame).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Arity {
                label: "SET_STATUS",
                ..
            }
        ));

        // PING with a stray part.
        let frame = Message::new(MessageType::Ping, vec!["x".to_string()]).to_frame();
        assert!(Message::parse(&frame).is_err());
    }

    #[test]
    fn test_bad_length_field() {
        let err = Message::parse("abc|PING\n").unwrap_err();
        assert!(matches!(err, ProtocolError::BadLengthField { .. }));
    }

    #[test]
    fn test_queue_overflow_modes() {
        let mut queue = MessageQueue::new(2);
        queue.add(Message::ping(), AppendMode::LoseOverflow).unwrap();
        queue
            .add(Message::read_status("A"), AppendMode::LoseOverflow)
            .unwrap();

        // Drop-oldest keeps the ring bounded.
        queue
            .add(Message::read_status("B"), AppendMode::LoseOverflow)
            .unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_first().unwrap().part(0).unwrap(), "A");

        // Fail mode errors instead.
        queue.add(Message::ping(), AppendMode::LoseOverflow).unwrap();
        let err = queue.add(Message::pong(), AppendMode::ErrorOverflow).unwrap_err();
        assert!(matches!(err, MessageError::Overflow { capacity: 2 }));
    }

    #[test]
    fn test_queue_underflow() {
        let mut queue = MessageQueue::new(2);
        assert!(matches!(queue.pop_first(), Err(MessageError::Underflow)));
    }

    #[test]
    fn test_latest_of_type() {
        let mut queue = MessageQueue::new(8);
        queue.add(Message::ping(), AppendMode::LoseOverflow).unwrap();
        queue
            .add(Message::set_status("A", 1), AppendMode::LoseOverflow)
            .unwrap();
        queue
            .add(Message::set_status("B", 2), AppendMode::LoseOverflow)
            .unwrap();

        let latest = queue.latest_of_type(MessageType::SetStatus).unwrap();
        assert_eq!(latest.part(0).unwrap(), "B");
        assert!(queue.latest_of_type(MessageType::Pong).is_none());
    }

    #[test]
    fn test_hello_negotiation() {
        let mut codec = Codec::new();
        assert!(!codec.is_negotiated());

        let hello = codec.parse_inbound(&Message::hello().to_frame()).unwrap();
        codec.process_hello(&hello).unwrap();
        assert!(codec.is_negotiated());
    }

    #[test]
    fn test_hello_version_too_new() {
        let mut codec = Codec::new();
        let frame =
            Message::new(MessageType::Hello, vec!["VERSION".to_string(), "99".to_string()])
                .to_frame();
        let hello = codec.parse_inbound(&frame).unwrap();
        let err = codec.process_hello(&hello).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion {
                requested: 99,
                supported: PROTOCOL_VERSION
            }
        ));
    }

    #[test]
    fn test_hello_must_be_first() {
        let mut codec = Codec::new();
        codec.parse_inbound(&Message::ping().to_frame()).unwrap();
        let hello = codec.parse_inbound(&Message::hello().to_frame()).unwrap();
        assert!(matches!(
            codec.process_hello(&hello),
            Err(ProtocolError::Sequence { .. })
        ));
    }

    #[test]
    fn test_send_records_outbound() {
        let mut codec = Codec::new();
        let mut sink: Vec<u8> = Vec::new();

        codec.send(&mut sink, Message::ping()).unwrap();
        assert_eq!(sink, b"7|PING\n");
        let sent = codec.latest_outgoing_ping().unwrap();
        assert!(sent.sent.is_some());
    }
}
