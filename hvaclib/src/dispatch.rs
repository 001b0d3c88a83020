//! Server-side message dispatch: the table from client verbs to board and
//! logic operations.
//!
//! One dispatcher instance serves one client connection. Failures inside
//! a command (unknown board tag, bad argument) earn the client an ERROR
//! reply and keep the connection open; only protocol sequence violations
//! and transport faults terminate it.

use std::sync::Arc;

use tracing::warn;

use crate::cache::CacheEntry16;
use crate::config::PointType;
use crate::connection::{ConnectionCore, Dispatch, DispatchResult};
use crate::error::Result;
use crate::logic::LogicLoop;
use crate::message::{Message, MessageType};
use crate::registry::ThreadRegistry;
use crate::serial::SerialWorker;

/// ERROR code for a command that failed server-side.
const ERR_COMMAND: i32 = 1;

/// The per-client server dispatcher.
pub struct ServerDispatch {
    registry: Arc<ThreadRegistry>,
    logic: Arc<LogicLoop>,
}

impl ServerDispatch {
    /// A dispatcher bound to the process's registry and logic loop.
    pub fn new(registry: Arc<ThreadRegistry>, logic: Arc<LogicLoop>) -> Self {
        Self { registry, logic }
    }

    fn worker(&self, message: &Message) -> Result<Arc<SerialWorker>> {
        let tag = message.part(0)?;
        self.registry.serial_worker(tag)
    }

    /// Composes the packed READ_STATUS snapshot: 8 AI entries, the DO and
    /// PMIC entries, both calibration tables, and the boot counter.
    fn read_status_reply(&self, message: &Message) -> Result<Message> {
        let worker = self.worker(message)?;
        let snapshot = worker.snapshot()?;

        let mut parts = Vec::with_capacity(27);
        for entry in snapshot.latest_ai() {
            parts.push(entry.to_wire());
        }
        parts.push(snapshot.latest_do().to_wire());
        parts.push(snapshot.latest_pmic().to_wire());
        for entry in snapshot.latest_cal_l1() {
            parts.push(entry.to_wire());
        }
        for entry in snapshot.latest_cal_l2() {
            parts.push(entry.to_wire());
        }
        parts.push(CacheEntry16::new(snapshot.boot_count()).to_wire());

        Ok(Message::new(MessageType::ReadStatus, parts))
    }

    fn raw_analog_reply(&self, message: &Message) -> Result<Message> {
        let worker = self.worker(message)?;
        let snapshot = worker.snapshot()?;

        let mut parts = Vec::new();
        for sweep in snapshot.ai_ring() {
            for entry in sweep {
                parts.push(entry.to_wire());
            }
        }

        Ok(Message::new(MessageType::ReadStatusRawAnalog, parts))
    }

    fn cal_vals_reply(&self, message: &Message, level1: bool) -> Result<Message> {
        let worker = self.worker(message)?;
        let snapshot = worker.snapshot()?;

        // Ask the board for fresh values for the next reader.
        if level1 {
            worker.refresh_cal_l1();
        } else {
            worker.refresh_cal_l2();
        }

        let (mtype, table) = if level1 {
            (MessageType::GetL1CalVals, snapshot.latest_cal_l1())
        } else {
            (MessageType::GetL2CalVals, snapshot.latest_cal_l2())
        };

        Ok(Message::new(
            mtype,
            table.iter().map(|entry| entry.to_wire()).collect(),
        ))
    }

    fn boot_count_reply(&self, message: &Message) -> Result<Message> {
        let worker = self.worker(message)?;
        let snapshot = worker.snapshot()?;
        worker.refresh_boot_count();

        Ok(Message::new(
            MessageType::GetBootCount,
            vec![CacheEntry16::new(snapshot.boot_count()).to_wire()],
        ))
    }

    fn labels_reply(&self, message: &Message) -> Result<Message> {
        let kind_token = message.part(0)?;
        let kind = PointType::from_token(kind_token).ok_or_else(|| {
            crate::error::ProtocolError::BadPart {
                index: 0,
                value: kind_token.to_string(),
            }
        })?;

        Ok(Message::new(MessageType::GetLabels, self.logic.labels(kind)?))
    }

    fn logic_status_reply(&self) -> Result<Message> {
        let mut parts = Vec::new();
        for (name, status) in self.logic.logic_status()? {
            parts.push(name);
            parts.push(status.to_string());
        }
        Ok(Message::new(MessageType::ReadLogicStatus, parts))
    }

    /// Runs one command, translating its failure into an ERROR reply.
    fn run(
        &self,
        core: &mut ConnectionCore,
        message: &Message,
    ) -> Result<Option<Message>> {
        match message.mtype() {
            MessageType::GetLabels => Ok(Some(self.labels_reply(message)?)),
            MessageType::ReadStatus => Ok(Some(self.read_status_reply(message)?)),
            MessageType::ReadStatusRawAnalog => Ok(Some(self.raw_analog_reply(message)?)),
            MessageType::GetL1CalVals => Ok(Some(self.cal_vals_reply(message, true)?)),
            MessageType::GetL2CalVals => Ok(Some(self.cal_vals_reply(message, false)?)),
            MessageType::GetBootCount => Ok(Some(self.boot_count_reply(message)?)),
            MessageType::ReadLogicStatus => Ok(Some(self.logic_status_reply()?)),

            MessageType::SetStatus => {
                let worker = self.worker(message)?;
                worker.set_do(message.part_num::<u8>(1)?)?;
                Ok(None)
            }
            MessageType::SetPmicStatus => {
                let worker = self.worker(message)?;
                worker.set_pmic(message.part_num::<u8>(1)?)?;
                Ok(None)
            }
            MessageType::SetL1CalVals | MessageType::SetL2CalVals => {
                let worker = self.worker(message)?;
                let mut vals = Vec::with_capacity(message.parts().len() - 1);
                for index in 1..message.parts().len() {
                    vals.push(message.part_num::<u16>(index)?);
                }
                let level = if message.mtype() == MessageType::SetL1CalVals { 1 } else { 2 };
                worker.set_cal_vals(level, &vals)?;
                Ok(None)
            }
            MessageType::ForceAiValue => {
                let worker = self.worker(message)?;
                worker.force_ai(
                    message.part_num::<usize>(1)?,
                    message.part_num::<u16>(2)?,
                )?;
                Ok(None)
            }
            MessageType::UnforceAiValue => {
                let worker = self.worker(message)?;
                worker.unforce_ai(message.part_num::<usize>(1)?)?;
                Ok(None)
            }
            MessageType::SetSp => {
                self.logic
                    .set_sp(message.part(0)?, message.part_num::<f64>(1)?)?;
                Ok(None)
            }
            MessageType::Error => {
                warn!(conn = %core.tag(), message = ?message.parts(), "client sent an error message");
                Ok(None)
            }

            // Base-handled types never reach the dispatcher.
            MessageType::Ping | MessageType::Pong | MessageType::Hello => Ok(None),
        }
    }
}

impl Dispatch for ServerDispatch {
    fn dispatch(&mut self, core: &mut ConnectionCore, message: &Message) -> Result<DispatchResult> {
        match self.run(core, message) {
            Ok(Some(reply)) => {
                core.send(reply)?;
                Ok(DispatchResult::Processed)
            }
            Ok(None) => Ok(DispatchResult::Processed),
            Err(e) => {
                // The command failed; tell the client and keep serving.
                warn!(conn = %core.tag(), "command failed: {e}");
                core.send(Message::error(ERR_COMMAND, e.to_string()))?;
                Ok(DispatchResult::Processed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry8;
    use crate::config::{BoardDef, ConfigStore};
    use crate::connection::Socket;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    const TEST_CONFIG: &str = "BOARD\tBOARD1\tttyTEST\n\
AI\tBOARD1\t0\tSpace temperature\tICTD\tF\n\
AI\tBOARD1\t1\tSpace humidity\t420\t0\t100\n\
DO\tBOARD1\t0\tAHU fan\n\
DO\tBOARD1\t1\tAC compressor\n\
DO\tBOARD1\t2\tHeater\n\
SP\tSPACE TEMP\t70.0\n\
MAP\tSPACE_1_TEMP\tBOARD1\t0\tAI\n\
MAP\tSPACE_1_RH\tBOARD1\t1\tAI\n\
MAP\tAHU_FAN\tBOARD1\t0\tDO\n\
MAP\tAC_COMPRESSOR\tBOARD1\t1\tDO\n\
MAP\tAHU_HEATER\tBOARD1\t2\tDO\n";

    struct Fixture {
        dispatcher: ServerDispatch,
        core: ConnectionCore,
        peer: UnixStream,
        worker: Arc<SerialWorker>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configuration.cfg");
        std::fs::write(&path, TEST_CONFIG).unwrap();

        let registry = Arc::new(ThreadRegistry::new());
        let worker = SerialWorker::new(&BoardDef {
            tag: "BOARD1".to_string(),
            device: "ttyTEST".to_string(),
            debug: false,
        });
        registry.register_serial(Arc::clone(&worker)).unwrap();

        let config = ConfigStore::load(&path).unwrap();
        let logic = LogicLoop::new(config, Arc::clone(&registry));

        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        peer.set_nonblocking(true).unwrap();

        Fixture {
            dispatcher: ServerDispatch::new(registry, logic),
            core: ConnectionCore::new("test-client", Socket::Unix(ours)),
            peer,
            worker,
            _dir: dir,
        }
    }

    fn negotiate(fixture: &mut Fixture) {
        fixture
            .peer
            .write_all(Message::hello().to_frame().as_bytes())
            .unwrap();
        fixture.core.handle_readable(&mut fixture.dispatcher).unwrap();
        assert!(fixture.core.codec.is_negotiated());
    }

    fn send(fixture: &mut Fixture, message: Message) {
        fixture
            .peer
            .write_all(message.to_frame().as_bytes())
            .unwrap();
        fixture.core.handle_readable(&mut fixture.dispatcher).unwrap();
    }

    fn reply(fixture: &mut Fixture) -> Message {
        let mut buf = [0u8; 8192];
        let n = fixture.peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        let line = text.lines().next().unwrap();
        Message::parse(&format!("{line}\n")).unwrap()
    }

    #[test]
    fn test_force_and_read_status() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::force_ai("BOARD1", 0, 2048));
        send(&mut fixture, Message::read_status("BOARD1"));

        let status = reply(&mut fixture);
        assert_eq!(status.mtype(), MessageType::ReadStatus);
        // 8 AI + DO + PMIC + 8 L1 + 8 L2 + boot count.
        assert_eq!(status.parts().len(), 27);

        let first_ai = CacheEntry16::from_wire(status.part(0).unwrap()).unwrap();
        assert_eq!(first_ai.value, 2048);

        // Unforce: the next live sweep shows board values again.
        send(&mut fixture, Message::unforce_ai("BOARD1", 0));
        assert!(!fixture.worker.snapshot().unwrap().is_forced(0));
    }

    #[test]
    fn test_set_status_reaches_worker() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::set_status("BOARD1", 5));

        // The worker has the write queued; its cache reflects it after the
        // board echoes a refresh, which the tests simulate directly.
        let snapshot = fixture.worker.snapshot().unwrap();
        assert_eq!(snapshot.latest_do(), CacheEntry8::default());
    }

    #[test]
    fn test_unknown_board_earns_error_reply() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::read_status("NO_SUCH_BOARD"));
        let error = reply(&mut fixture);
        assert_eq!(error.mtype(), MessageType::Error);
        assert_eq!(error.part(0).unwrap(), "1");
    }

    #[test]
    fn test_get_labels() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::get_labels("DO"));
        let labels = reply(&mut fixture);
        assert_eq!(labels.mtype(), MessageType::GetLabels);
        assert_eq!(labels.parts().len(), 3);
        assert!(labels.part(0).unwrap().contains("AHU fan"));
    }

    #[test]
    fn test_set_sp_round_trips() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::set_sp("SPACE TEMP", 68.5));
        send(&mut fixture, Message::read_logic_status());

        let status = reply(&mut fixture);
        assert_eq!(status.mtype(), MessageType::ReadLogicStatus);
        // Pairs: every mapped point appears.
        assert_eq!(status.parts().len() % 2, 0);
    }

    #[test]
    fn test_raw_analog_ring() {
        let mut fixture = fixture();
        negotiate(&mut fixture);

        send(&mut fixture, Message::read_raw_analog("BOARD1"));
        let ring = reply(&mut fixture);
        assert_eq!(ring.mtype(), MessageType::ReadStatusRawAnalog);
        assert_eq!(
            ring.parts().len(),
            crate::cache::AI_COUNT * crate::cache::STATE_BUFFER_DEPTH
        );
    }
}
