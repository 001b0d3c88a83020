//! Serial I/O worker: framed exchange with one IO board.
//!
//! Two threads per board. The reader owns the serial line: it polls with a
//! short timeout, drains bytes into the reframe buffer, digests completed
//! records into the board state cache, issues periodic refresh commands,
//! and recovers a hung board by reopening the port and resetting it. The
//! writer blocks on the outgoing queue's condition variable, swaps the
//! queue contents out under the lock, releases it, and only then performs
//! the actual writes, so readers never stall writers and vice versa.
//!
//! Outgoing command wire form: `@ <len_hi> <len_lo> <cmd> [payload]` where
//! the length counts the command byte plus the payload.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::{AI_COUNT, BoardStateCache};
use crate::config::BoardDef;
use crate::error::{Result, SerialError};
use crate::frame::{self, LineEntry, LineTable, ReframeBuffer, SERIAL_BUF_SIZE};
use crate::port::SerialPort;
use crate::registry::{ThreadRegistry, WorkerKind};
use crate::sync::Guarded;

/// Poll timeout of the reader loop, in milliseconds.
const READ_POLL_MS: u16 = 1;

/// Sleep between reader iterations; lets callers grab the worker lock.
const READ_LOOP_SLEEP: Duration = Duration::from_micros(10);

/// Reader iterations between automatic state refreshes.
const REFRESH_INTERVAL: usize = 250;

/// Consecutive empty polls before the board is declared hung.
const HUNG_POLL_LIMIT: usize = 1000;

/// Writer condvar timeout; bounds shutdown latency of the writer thread.
const WRITE_WAIT: Duration = Duration::from_secs(2);

/// Outgoing queue depth; the oldest message is dropped on overflow.
const OUTGOING_QUEUE_DEPTH: usize = 32;

/// Commands understood by the board firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoardCommand {
    /// Hard-reset the board.
    ResetBoard = 0x00,
    /// Read all AI channels.
    GetAiStatus = 0x01,
    /// Read the DO bits.
    GetDoStatus = 0x02,
    /// Write the DO bits.
    SetDoStatus = 0x03,
    /// Read the PMIC bits.
    GetPmicStatus = 0x04,
    /// Write the PMIC bits.
    SetPmicStatus = 0x05,
    /// Read the L1 calibration table.
    GetL1CalVals = 0x06,
    /// Read the L2 calibration table.
    GetL2CalVals = 0x07,
    /// Write the L1 calibration table.
    SetL1CalVals = 0x08,
    /// Write the L2 calibration table.
    SetL2CalVals = 0x09,
    /// Read the boot counter.
    GetBootCount = 0x0A,
    /// Read board statistics (reserved).
    GetBoardStats = 0x0B,
    /// Confirm-output handshake (reserved).
    ConfirmOutput = 0x0C,
    /// Firmware-side failure report.
    SysFailure = 0xFF,
}

impl BoardCommand {
    /// Resolves a response command code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::ResetBoard,
            0x01 => Self::GetAiStatus,
            0x02 => Self::GetDoStatus,
            0x03 => Self::SetDoStatus,
            0x04 => Self::GetPmicStatus,
            0x05 => Self::SetPmicStatus,
            0x06 => Self::GetL1CalVals,
            0x07 => Self::GetL2CalVals,
            0x08 => Self::SetL1CalVals,
            0x09 => Self::SetL2CalVals,
            0x0A => Self::GetBootCount,
            0x0B => Self::GetBoardStats,
            0x0C => Self::ConfirmOutput,
            0xFF => Self::SysFailure,
            _ => return None,
        })
    }
}

/// Builds the outgoing wire form of one board command.
pub fn build_command(cmd: BoardCommand, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u16;
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.push(b'@');
    bytes.push((length >> 8) as u8);
    bytes.push((length & 0xFF) as u8);
    bytes.push(cmd as u8);
    bytes.extend_from_slice(payload);
    bytes
}

/// A queued outgoing message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Raw wire bytes.
    pub bytes: Vec<u8>,
    /// Monotonically assigned sequence id.
    pub id: u64,
    /// Cleared once the writer has put the message on the wire.
    pub is_new: bool,
}

/// Bounded FIFO of outgoing messages with a writer wakeup condvar.
#[derive(Debug)]
struct OutgoingQueue {
    messages: Mutex<VecDeque<OutgoingMessage>>,
    signal: Condvar,
    next_id: AtomicU64,
}

impl OutgoingQueue {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Enqueues bytes, dropping the oldest message when full.
    fn add(&self, bytes: Vec<u8>) {
        let message = OutgoingMessage {
            bytes,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            is_new: true,
        };

        let Ok(mut queue) = self.messages.lock() else {
            return;
        };
        if queue.len() >= OUTGOING_QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(message);
        self.signal.notify_one();
    }

    /// Waits for work and swaps the whole queue out under the lock.
    ///
    /// Returns an empty queue on timeout so the caller can re-check its
    /// stop flag.
    fn wait_batch(&self) -> VecDeque<OutgoingMessage> {
        let Ok(mut queue) = self.messages.lock() else {
            return VecDeque::new();
        };

        if queue.is_empty() {
            let Ok((guard, _timeout)) = self.signal.wait_timeout(queue, WRITE_WAIT) else {
                return VecDeque::new();
            };
            queue = guard;
        }

        std::mem::take(&mut *queue)
    }

    #[cfg(test)]
    fn take_pending(&self) -> VecDeque<OutgoingMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }
}

/// Mutable worker state, held under the worker's lock.
#[derive(Debug)]
struct WorkerState {
    cache: BoardStateCache,
    board_booted: bool,
    last_commanded_do: Option<u8>,
}

/// The serial worker for one board.
///
/// Public methods enqueue commands or copy cache state; the owning
/// threads are started by [`SerialWorker::spawn`].
#[derive(Debug)]
pub struct SerialWorker {
    tag: String,
    device: String,
    debug: bool,
    state: Guarded<WorkerState>,
    queue: OutgoingQueue,
    stop: Arc<AtomicBool>,
}

impl SerialWorker {
    /// A worker with no port attached yet; see [`SerialWorker::spawn`].
    pub fn new(board: &BoardDef) -> Arc<Self> {
        Arc::new(Self {
            tag: board.tag.clone(),
            device: board.device.clone(),
            debug: board.debug,
            state: Guarded::new(
                format!("SERIAL_IO[{}]", board.tag),
                WorkerState {
                    cache: BoardStateCache::new(),
                    board_booted: false,
                    last_commanded_do: None,
                },
            ),
            queue: OutgoingQueue::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Board tag this worker serves.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Opens and locks the serial port, then starts the reader and writer
    /// threads and registers the worker.
    ///
    /// # Errors
    ///
    /// Port open/lock failures and registry refusal surface here; a
    /// worker that fails to spawn holds no resources.
    pub fn spawn(self: &Arc<Self>, registry: &ThreadRegistry) -> Result<()> {
        info!(board = %self.tag, device = %self.device, "starting serial worker");

        let port = Arc::new(Mutex::new(SerialPort::open(&self.device)?));
        registry.register_serial(Arc::clone(self))?;

        let worker = Arc::clone(self);
        let reader_port = Arc::clone(&port);

        registry.launch(
            &self.tag,
            WorkerKind::Serial,
            Arc::clone(&self.stop),
            move |stop| {
                let writer = {
                    let writer_worker = Arc::clone(&worker);
                    let writer_port = Arc::clone(&reader_port);
                    let writer_stop = Arc::clone(&stop);
                    std::thread::Builder::new()
                        .name(format!("{}-writer", writer_worker.tag))
                        .spawn(move || writer_worker.writer_loop(&writer_port, &writer_stop))
                };

                worker.reader_loop(&reader_port, &stop);

                // The reader is the worker's spine: when it ends (shutdown
                // or an unrecoverable port), release the writer and die so
                // the supervisor can restart the pair.
                worker.stop.store(true, Ordering::SeqCst);
                if let Ok(handle) = writer {
                    let _ = handle.join();
                }
            },
        )?;

        Ok(())
    }

    // ── Reader side ─────────────────────────────────────────────────────

    fn reader_loop(&self, port: &Arc<Mutex<SerialPort>>, stop: &AtomicBool) {
        // Consecutive failed port recoveries before the worker gives up
        // and dies, handing the restart to the supervisor.
        const RECOVERY_LIMIT: u32 = 5;

        let mut buffer = ReframeBuffer::new();
        let mut table = LineTable::new();
        let mut loop_counter: usize = 0;
        let mut idle_polls: usize = 0;
        let mut failed_recoveries: u32 = 0;

        // Reset first so the board state is known.
        self.reset_board();

        while !stop.load(Ordering::SeqCst) {
            let drained = self.poll_and_drain(port, &mut buffer);

            match drained {
                Ok(true) => {
                    idle_polls = 0;
                    failed_recoveries = 0;
                }
                Ok(false) => {
                    idle_polls += 1;

                    if buffer.has_data() {
                        buffer.assemble(&mut table);
                    }
                    self.digest(&mut table, stop);

                    if loop_counter >= REFRESH_INTERVAL {
                        if loop_counter > REFRESH_INTERVAL {
                            warn!(board = %self.tag, counter = loop_counter, "delayed state refresh");
                        }
                        self.periodic_refresh(stop);
                        loop_counter = 0;
                    }
                }
                Err(e) => {
                    error!(board = %self.tag, "serial read failed: {e}");
                    idle_polls = HUNG_POLL_LIMIT; // force a recovery pass
                }
            }

            if idle_polls >= HUNG_POLL_LIMIT {
                if self.handle_hung_board(port, &mut buffer, stop) {
                    failed_recoveries = 0;
                } else {
                    failed_recoveries += 1;
                    if failed_recoveries >= RECOVERY_LIMIT {
                        error!(board = %self.tag, "port unrecoverable; worker dying for restart");
                        break;
                    }
                }
                idle_polls = 0;
            }

            loop_counter += 1;
            std::thread::sleep(READ_LOOP_SLEEP);
        }

        debug!(board = %self.tag, "reader loop ending");
    }

    /// Polls the port and drains pending bytes. Returns whether data moved.
    fn poll_and_drain(
        &self,
        port: &Arc<Mutex<SerialPort>>,
        buffer: &mut ReframeBuffer,
    ) -> std::result::Result<bool, SerialError> {
        let Ok(mut port) = port.lock() else {
            return Err(SerialError::Io {
                source: nix::Error::EOWNERDEAD,
            });
        };

        if !port.wait_readable(READ_POLL_MS)? {
            return Ok(false);
        }

        let mut moved = false;
        loop {
            let n = port.read_available(buffer.space())?;
            if n == 0 {
                break;
            }
            if self.debug {
                debug!(board = %self.tag, bytes = n, "drained serial bytes");
            }
            buffer.commit(n);
            moved = true;
        }

        Ok(moved)
    }

    /// Issues the periodic AI/DO/PMIC refresh once the board has booted.
    fn periodic_refresh(&self, stop: &AtomicBool) {
        let booted = self
            .state
            .lock(stop)
            .map(|state| state.board_booted)
            .unwrap_or(false);

        if booted {
            self.refresh_ai();
            self.refresh_do();
            self.refresh_pmic();
        } else {
            debug!(board = %self.tag, "waiting for board to reset");
        }
    }

    /// Processes every reassembled record into the state cache.
    fn digest(&self, table: &mut LineTable, stop: &AtomicBool) {
        let entries = table.drain();
        if entries.is_empty() {
            return;
        }

        let Ok(mut state) = self.state.lock(stop) else {
            error!(board = %self.tag, "failed to lock state for digest");
            return;
        };

        for entry in entries {
            match entry {
                LineEntry::Binary { cmd, status: _, payload } => {
                    self.digest_binary(&mut state, cmd, &payload);
                }
                LineEntry::Text(line) => {
                    debug!(board = %self.tag, line = %line, "board text");
                    if frame::is_protocol_notice(&line) {
                        let tokens = frame::notice_tokens(&line);
                        if frame::announces_boot(&tokens) {
                            debug!(board = %self.tag, "board reset sensed");
                            state.board_booted = true;
                        }
                    }
                }
            }
        }
    }

    fn digest_binary(&self, state: &mut WorkerState, cmd: u8, payload: &[u8]) {
        match BoardCommand::from_code(cmd) {
            Some(BoardCommand::GetAiStatus) => {
                if payload.len() % 2 != 0 {
                    error!(board = %self.tag, "AI payload length is not a multiple of two");
                    return;
                }
                for (channel, pair) in payload.chunks_exact(2).enumerate() {
                    let value = u16::from_be_bytes([pair[0], pair[1]]);
                    if let Err(e) = state.cache.add_ai(channel, value) {
                        error!(board = %self.tag, "dropping AI sample: {e}");
                    }
                }
            }
            Some(BoardCommand::GetDoStatus) => {
                if let Some(&bits) = payload.first() {
                    state.cache.add_do(bits);
                }
            }
            Some(BoardCommand::GetPmicStatus) => {
                if let Some(&bits) = payload.first() {
                    state.cache.add_pmic(bits);
                }
            }
            Some(BoardCommand::GetL1CalVals) => {
                Self::digest_cal(state, payload, true);
            }
            Some(BoardCommand::GetL2CalVals) => {
                Self::digest_cal(state, payload, false);
            }
            Some(BoardCommand::GetBootCount) => {
                if payload.len() >= 2 {
                    state
                        .cache
                        .set_boot_count(u16::from_be_bytes([payload[0], payload[1]]));
                }
            }
            Some(
                BoardCommand::ResetBoard
                | BoardCommand::SetDoStatus
                | BoardCommand::SetPmicStatus
                | BoardCommand::SetL1CalVals
                | BoardCommand::SetL2CalVals
                | BoardCommand::GetBoardStats
                | BoardCommand::ConfirmOutput,
            ) => {
                // Acknowledgements with no processable payload.
            }
            Some(BoardCommand::SysFailure) => {
                error!(board = %self.tag, "board reported a system failure");
            }
            None => {
                error!(board = %self.tag, cmd, "unrecognized command in response");
            }
        }
    }

    fn digest_cal(state: &mut WorkerState, payload: &[u8], level1: bool) {
        for (channel, pair) in payload.chunks_exact(2).enumerate().take(AI_COUNT) {
            let value = u16::from_be_bytes([pair[0], pair[1]]);
            let result = if level1 {
                state.cache.add_cal_l1(channel, value)
            } else {
                state.cache.add_cal_l2(channel, value)
            };
            if let Err(e) = result {
                error!("dropping calibration value: {e}");
            }
        }
    }

    /// Close, reopen, and reset a board that has stopped talking.
    /// Returns whether the port came back.
    fn handle_hung_board(
        &self,
        port: &Arc<Mutex<SerialPort>>,
        buffer: &mut ReframeBuffer,
        stop: &AtomicBool,
    ) -> bool {
        debug!(board = %self.tag, "handling hung board");

        if let Ok(mut state) = self.state.lock(stop) {
            state.board_booted = false;
        }
        buffer.reset();

        let reopened = match port.lock() {
            Ok(mut port) => match port.reopen() {
                Ok(()) => true,
                Err(e) => {
                    error!(board = %self.tag, "failed to reopen port: {e}");
                    false
                }
            },
            Err(_) => false,
        };

        self.reset_board();
        reopened
    }

    // ── Writer side ─────────────────────────────────────────────────────

    fn writer_loop(&self, port: &Arc<Mutex<SerialPort>>, stop: &AtomicBool) {
        debug!(board = %self.tag, "write event loop starting");

        while !stop.load(Ordering::SeqCst) {
            let mut batch = self.queue.wait_batch();

            while let Some(mut message) = batch.pop_front() {
                message.is_new = false;

                let Ok(mut port) = port.lock() else {
                    error!(board = %self.tag, "port lock poisoned; dropping message");
                    continue;
                };
                if let Err(e) = port.write_all_bounded(&message.bytes, stop) {
                    error!(board = %self.tag, id = message.id, "failed to write message: {e}");
                }
            }
        }

        debug!(board = %self.tag, "write event loop ending");
    }

    // ── Public control surface ──────────────────────────────────────────

    /// Enqueues raw command bytes for the writer thread.
    ///
    /// # Errors
    ///
    /// [`SerialError::MessageTooLarge`] when the frame cannot fit the
    /// board-side buffer.
    pub fn send_message(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() >= SERIAL_BUF_SIZE {
            return Err(SerialError::MessageTooLarge {
                length: bytes.len(),
            }
            .into());
        }

        self.queue.add(bytes);
        Ok(())
    }

    /// Hard-resets the board; refreshes stay gated until it re-announces.
    pub fn reset_board(&self) {
        if let Ok(mut state) = self.state.lock(&self.stop) {
            state.board_booted = false;
        }
        let _ = self.send_message(build_command(BoardCommand::ResetBoard, &[]));
    }

    /// Requests a fresh AI sweep.
    pub fn refresh_ai(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetAiStatus, &[]));
    }

    /// Requests the current DO bits.
    pub fn refresh_do(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetDoStatus, &[]));
    }

    /// Requests the current PMIC bits.
    pub fn refresh_pmic(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetPmicStatus, &[]));
    }

    /// Requests the L1 calibration table.
    pub fn refresh_cal_l1(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetL1CalVals, &[]));
    }

    /// Requests the L2 calibration table.
    pub fn refresh_cal_l2(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetL2CalVals, &[]));
    }

    /// Requests the boot counter.
    pub fn refresh_boot_count(&self) {
        let _ = self.send_message(build_command(BoardCommand::GetBootCount, &[]));
    }

    /// Writes the DO bits. A write equal to the last commanded byte is
    /// suppressed; the plant does not need identical commands re-sent.
    ///
    /// # Errors
    ///
    /// Lock failures surface as [`crate::error::LockError`].
    pub fn set_do(&self, bits: u8) -> Result<()> {
        let mut state = self.state.lock(&self.stop)?;
        if state.last_commanded_do == Some(bits) {
            return Ok(());
        }
        state.last_commanded_do = Some(bits);
        drop(state);

        self.send_message(build_command(BoardCommand::SetDoStatus, &[bits]))
    }

    /// Writes the PMIC bits. Never deduplicated: rewriting the current
    /// byte is the documented way to reset a faulted rail.
    ///
    /// # Errors
    ///
    /// [`SerialError::MessageTooLarge`] cannot occur here; queue errors
    /// propagate.
    pub fn set_pmic(&self, bits: u8) -> Result<()> {
        self.send_message(build_command(BoardCommand::SetPmicStatus, &[bits]))
    }

    /// Writes a calibration table (`level` 1 or 2), one `u16` per channel.
    ///
    /// # Errors
    ///
    /// Queue errors propagate.
    pub fn set_cal_vals(&self, level: u8, vals: &[u16]) -> Result<()> {
        let cmd = if level == 1 {
            BoardCommand::SetL1CalVals
        } else {
            BoardCommand::SetL2CalVals
        };

        let mut payload = Vec::with_capacity(vals.len() * 2);
        for val in vals {
            payload.extend_from_slice(&val.to_be_bytes());
        }

        self.send_message(build_command(cmd, &payload))
    }

    /// Forces AI `channel` to `value` in the cache; no board traffic.
    ///
    /// # Errors
    ///
    /// Lock and range errors propagate.
    pub fn force_ai(&self, channel: usize, value: u16) -> Result<bool> {
        let mut state = self.state.lock(&self.stop)?;
        Ok(state.cache.force_ai(channel, value)?)
    }

    /// Clears the force on AI `channel`.
    ///
    /// # Errors
    ///
    /// Lock and range errors propagate.
    pub fn unforce_ai(&self, channel: usize) -> Result<bool> {
        let mut state = self.state.lock(&self.stop)?;
        Ok(state.cache.unforce_ai(channel)?)
    }

    /// Drains the pending command queue for inspection (test use).
    #[cfg(test)]
    pub(crate) fn pending_commands(&self) -> VecDeque<OutgoingMessage> {
        self.queue.take_pending()
    }

    /// Copies the whole state cache out under the lock.
    ///
    /// The returned value is a snapshot at call time; it shares nothing
    /// with the live cache.
    ///
    /// # Errors
    ///
    /// Lock failures surface as [`crate::error::LockError`].
    pub fn snapshot(&self) -> Result<BoardStateCache> {
        let state = self.state.lock(&self.stop)?;
        Ok(state.cache.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_board(tag: &str) -> BoardDef {
        BoardDef {
            tag: tag.to_string(),
            device: "ttyTEST".to_string(),
            debug: false,
        }
    }

    #[test]
    fn test_build_command_wire_form() {
        // The literal frames the firmware expects.
        assert_eq!(
            build_command(BoardCommand::ResetBoard, &[]),
            vec![b'@', 0x00, 0x01, 0x00]
        );
        assert_eq!(
            build_command(BoardCommand::GetAiStatus, &[]),
            vec![b'@', 0x00, 0x01, 0x01]
        );
        assert_eq!(
            build_command(BoardCommand::SetDoStatus, &[0x05]),
            vec![b'@', 0x00, 0x02, 0x03, 0x05]
        );
    }

    #[test]
    fn test_set_do_deduplicates() {
        let worker = SerialWorker::new(&test_board("BOARD1"));

        // Reset queued at most by explicit calls; start clean.
        let _ = worker.queue.take_pending();

        worker.set_do(5).unwrap();
        worker.set_do(5).unwrap();
        worker.set_do(6).unwrap();

        let pending = worker.queue.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].bytes, vec![b'@', 0x00, 0x02, 0x03, 0x05]);
        assert_eq!(pending[1].bytes, vec![b'@', 0x00, 0x02, 0x03, 0x06]);
    }

    #[test]
    fn test_set_pmic_never_deduplicates() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let _ = worker.queue.take_pending();

        worker.set_pmic(0x0C).unwrap();
        worker.set_pmic(0x0C).unwrap();

        assert_eq!(worker.queue.take_pending().len(), 2);
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let _ = worker.queue.take_pending();

        for i in 0..(OUTGOING_QUEUE_DEPTH + 4) {
            worker
                .send_message(build_command(BoardCommand::GetAiStatus, &[i as u8]))
                .unwrap();
        }

        let pending = worker.queue.take_pending();
        assert_eq!(pending.len(), OUTGOING_QUEUE_DEPTH);
        // Ids keep counting even though the head was dropped.
        assert_eq!(pending.back().unwrap().id as usize, OUTGOING_QUEUE_DEPTH + 3);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let err = worker.send_message(vec![0u8; SERIAL_BUF_SIZE]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::HvacError::Serial(SerialError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_digest_ai_response_updates_cache() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let stop = AtomicBool::new(false);

        let mut payload = Vec::new();
        for channel in 0..AI_COUNT as u16 {
            payload.extend_from_slice(&(1000 + channel).to_be_bytes());
        }

        let mut table = LineTable::new();
        table.push(LineEntry::Binary {
            cmd: BoardCommand::GetAiStatus as u8,
            status: 1,
            payload,
        });
        table.push(LineEntry::Binary {
            cmd: BoardCommand::GetDoStatus as u8,
            status: 1,
            payload: vec![0x05],
        });
        table.push(LineEntry::Binary {
            cmd: BoardCommand::GetPmicStatus as u8,
            status: 1,
            payload: vec![0x03],
        });
        worker.digest(&mut table, &stop);

        let snapshot = worker.snapshot().unwrap();
        assert_eq!(snapshot.latest_ai()[0].value, 1000);
        assert_eq!(snapshot.latest_ai()[7].value, 1007);
        assert_eq!(snapshot.latest_do().value, 0x05);
        assert_eq!(snapshot.latest_pmic().value, 0x03);
    }

    #[test]
    fn test_boot_notice_gates_refresh() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let stop = AtomicBool::new(false);

        let mut table = LineTable::new();
        table.push(LineEntry::Text(
            "0001P|FROM IOCONTROLLER . IOCONTROLLER UP".to_string(),
        ));
        worker.digest(&mut table, &stop);

        let state = worker.state.lock(&stop).unwrap();
        assert!(state.board_booted);
    }

    #[test]
    fn test_force_and_snapshot() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        assert!(worker.force_ai(0, 2048).unwrap());
        assert_eq!(worker.snapshot().unwrap().latest_ai()[0].value, 2048);
        assert!(worker.unforce_ai(0).unwrap());
    }

    #[test]
    fn test_cal_command_payload_packing() {
        let worker = SerialWorker::new(&test_board("BOARD1"));
        let _ = worker.queue.take_pending();

        worker
            .set_cal_vals(1, &[0x0102, 0x0304, 0, 0, 0, 0, 0, 0x0A0B])
            .unwrap();

        let pending = worker.queue.take_pending();
        let bytes = &pending[0].bytes;
        assert_eq!(bytes[0], b'@');
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 17); // cmd + 16
        assert_eq!(bytes[3], BoardCommand::SetL1CalVals as u8);
        assert_eq!(&bytes[4..6], &[0x01, 0x02]);
        assert_eq!(&bytes[18..20], &[0x0A, 0x0B]);
    }
}
