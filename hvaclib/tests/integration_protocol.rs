//! End-to-end control protocol tests: a real listener, a real client
//! connection, and a board worker with no hardware behind it.

use std::sync::Arc;

use hvaclib::cache::CacheEntry16;
use hvaclib::config::BoardDef;
use hvaclib::listener::{self, ListenAddr};
use hvaclib::registry::ThreadRegistry;
use hvaclib::{ClientConnection, ConfigStore, LogicLoop, Message, MessageType, SerialWorker};

const CONFIG: &str = "BOARD\tBOARD1\tttyTEST\n\
AI\tBOARD1\t0\tSpace temperature\tICTD\tC\n\
DO\tBOARD1\t0\tAHU fan\n\
SP\tSPACE TEMP\t70.0\n\
SP\tSPACE RH\t50.0\n\
MAP\tSPACE_1_TEMP\tBOARD1\t0\tAI\n\
MAP\tAHU_FAN\tBOARD1\t0\tDO\n";

struct Plant {
    registry: Arc<ThreadRegistry>,
    worker: Arc<SerialWorker>,
    socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn start_plant() -> Plant {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("configuration.cfg");
    std::fs::write(&config_path, CONFIG).unwrap();

    let registry = Arc::new(ThreadRegistry::new());
    let worker = SerialWorker::new(&BoardDef {
        tag: "BOARD1".to_string(),
        device: "ttyTEST".to_string(),
        debug: false,
    });
    registry.register_serial(Arc::clone(&worker)).unwrap();

    let logic = LogicLoop::new(
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

    Plant {
        registry,
        worker,
        socket_path,
        _dir: dir,
    }
}

#[test]
fn test_force_read_unforce_cycle() {
    let plant = start_plant();
    let client = ClientConnection::connect(&ListenAddr::Unix(plant.socket_path.clone())).unwrap();

    // Force channel 0 to 2048 and observe it in the packed snapshot.
    client
        .send(Message::force_ai("BOARD1", 0, 2048))
        .unwrap();
    let status = client
        .send_and_wait(Message::read_status("BOARD1"))
        .unwrap();
    assert_eq!(status.mtype(), MessageType::ReadStatus);

    let first_ai = CacheEntry16::from_wire(status.part(0).unwrap()).unwrap();
    assert_eq!(first_ai.value, 2048);

    // Unforce; the worker reports the channel released.
    client.send(Message::unforce_ai("BOARD1", 0)).unwrap();
    // Give the server a beat to process the one-way command.
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(!plant.worker.snapshot().unwrap().is_forced(0));

    client.disconnect();
    plant.registry.stop_all();
}

#[test]
fn test_labels_and_logic_status() {
    let plant = start_plant();
    let client = ClientConnection::connect(&ListenAddr::Unix(plant.socket_path.clone())).unwrap();

    let labels = client.send_and_wait(Message::get_labels("SP")).unwrap();
    assert_eq!(labels.parts().len(), 2);

    let status = client
        .send_and_wait(Message::read_logic_status())
        .unwrap();
    // name/value pairs for both mapped points.
    assert_eq!(status.parts().len(), 4);
    assert!(status.parts().iter().any(|p| p == "SPACE_1_TEMP"));
    assert!(status.parts().iter().any(|p| p == "AHU_FAN"));

    client.disconnect();
    plant.registry.stop_all();
}

#[test]
fn test_bad_command_keeps_connection_alive() {
    let plant = start_plant();
    let client = ClientConnection::connect(&ListenAddr::Unix(plant.socket_path.clone())).unwrap();

    // Unknown board: the server answers ERROR instead of dropping us.
    let err = client
        .send_and_wait(Message::read_status("GHOST"))
        .unwrap_err();
    // The reply is typed ERROR, so waiting for READ_STATUS times out...
    assert!(matches!(
        err,
        hvaclib::HvacError::Connection(
            hvaclib::error::ConnectionError::ReplyTimeout { .. }
        )
    ));
    // ...but the ERROR itself is in the inbound ring.
    let error = client.latest_inbound(MessageType::Error).unwrap().unwrap();
    assert_eq!(error.part(0).unwrap(), "1");

    // The connection still works.
    let status = client
        .send_and_wait(Message::read_status("BOARD1"))
        .unwrap();
    assert_eq!(status.mtype(), MessageType::ReadStatus);

    client.disconnect();
    plant.registry.stop_all();
}

#[test]
fn test_tcp_transport() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("configuration.cfg");
    std::fs::write(&config_path, CONFIG).unwrap();

    let registry = Arc::new(ThreadRegistry::new());
    let logic = LogicLoop::new(
        ConfigStore::load(&config_path).unwrap(),
        Arc::clone(&registry),
    );

    // Bind an ephemeral port first to find a free one, then reuse it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    listener::start(
        Arc::clone(&registry),
        logic,
        ListenAddr::Tcp("127.0.0.1".to_string(), port),
    )
    .unwrap();

    let client =
        ClientConnection::connect(&ListenAddr::Tcp("127.0.0.1".to_string(), port)).unwrap();
    let labels = client.send_and_wait(Message::get_labels("SP")).unwrap();
    assert_eq!(labels.mtype(), MessageType::GetLabels);

    client.disconnect();
    registry.stop_all();
}
