//! Device server commands end to end over a running process core.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use irrad_core::{Commander, CoreConfig, ProcessCore, Subscription};
use irrad_server::daq::MockCurrentSource;
use irrad_server::stage::MockAxis;
use irrad_server::{DeviceServer, ScanStage};
use irrad_types::{ChannelKind, Command};

struct Server {
    cmd_addr: String,
    data_addr: String,
    event_addr: String,
    x: Arc<MockAxis>,
    y: Arc<MockAxis>,
    token: tokio_util::sync::CancellationToken,
    running: tokio::task::JoinHandle<irrad_core::CoreResult<()>>,
    _dir: tempfile::TempDir,
}

async fn start_server(name: &str, baseline: f64) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::new(name);
    config.run_dir = dir.path().to_path_buf();
    config.watch_interval = Duration::from_millis(50);

    let core = ProcessCore::bind(config).await.unwrap();
    let addr = |kind| format!("127.0.0.1:{}", core.port(kind).unwrap());
    let cmd_addr = addr(ChannelKind::Cmd);
    let data_addr = addr(ChannelKind::Data);
    let event_addr = addr(ChannelKind::Event);

    let x = Arc::new(MockAxis::new('x', 1.0));
    let y = Arc::new(MockAxis::new('y', 1.0));
    let stage = ScanStage::new(x.clone(), y.clone());
    let role = Arc::new(DeviceServer::new(
        name,
        core.cancellation_token(),
        stage,
        core.data_publisher(),
        core.event_publisher(),
        Arc::new(MockCurrentSource { baseline }),
        Duration::from_millis(20),
    ));
    role.scan_controller()
        .set_poll_interval(Duration::from_millis(10));

    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(role));
    Server {
        cmd_addr,
        data_addr,
        event_addr,
        x,
        y,
        token,
        running,
        _dir: dir,
    }
}

impl Server {
    async fn shutdown(self) {
        self.token.cancel();
        self.running.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn stage_commands_move_and_report() {
    let server = start_server("dut", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();

    let reply = commander
        .request(&Command::new(
            "stage",
            "move_abs",
            Some(json!({ "axis": "x", "value": 12.0 })),
        ))
        .await
        .unwrap();
    assert!(!reply.is_error());
    assert_eq!(reply.data.unwrap()["position"], 12.0);

    let reply = commander
        .request(&Command::new(
            "stage",
            "move_rel",
            Some(json!({ "axis": "x", "value": -2.0 })),
        ))
        .await
        .unwrap();
    assert_eq!(reply.data.unwrap()["position"], 10.0);

    let reply = commander
        .request(&Command::new("stage", "get_position", None))
        .await
        .unwrap();
    let data = reply.data.unwrap();
    assert_eq!(data["x"], 10.0);
    assert_eq!(data["y"], 0.0);

    let reply = commander
        .request(&Command::new("server", "motorstages", None))
        .await
        .unwrap();
    let data = reply.data.unwrap();
    assert_eq!(data["x"]["position"], 10.0);
    assert!(data["y"]["speed"].as_f64().unwrap() > 0.0);

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_are_error_replies() {
    let server = start_server("strict", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();

    for (target, cmd) in [("stage", "warp"), ("scan", "reticulate"), ("nosuch", "x")] {
        let reply = commander
            .request(&Command::new(target, cmd, None))
            .await
            .unwrap();
        assert!(reply.is_error(), "{target}/{cmd} must be rejected");
        assert_eq!(reply.reply, cmd);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn scan_runs_to_completion_via_commands() {
    let server = start_server("scanner", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();
    let mut data = Subscription::connect(&server.data_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let reply = commander
        .request(&Command::new(
            "scan",
            "prepare",
            Some(json!({
                "rel_start": [0.0, 0.0],
                "rel_end": [20.0, 8.0],
                "speed": 20.0,
                "row_sep": 4.0,
            })),
        ))
        .await
        .unwrap();
    assert!(!reply.is_error());
    assert_eq!(reply.data.unwrap()["n_rows"], 2);

    let reply = commander
        .request(&Command::new("scan", "scan_device", None))
        .await
        .unwrap();
    assert!(!reply.is_error());

    // Let a pass run, then finish gracefully.
    sleep(Duration::from_millis(100)).await;
    let reply = commander
        .request(&Command::new("scan", "finish", None))
        .await
        .unwrap();
    assert!(!reply.is_error());

    // The data channel carries the whole progress sequence.
    let mut saw_init = false;
    timeout(Duration::from_secs(5), async {
        loop {
            let packet = data.next_packet().await.unwrap().unwrap();
            if packet.meta.kind != "stage" {
                continue;
            }
            match packet.data["status"].as_str() {
                Some("scan_init") => saw_init = true,
                Some("scan_finished") => break,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(saw_init);

    server.shutdown().await;
}

#[tokio::test]
async fn disabling_an_event_is_broadcast() {
    let server = start_server("events", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();
    let mut events = Subscription::connect(&server.event_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let reply = commander
        .request(&Command::new(
            "event",
            "set_disabled",
            Some(json!({ "event": "BeamOff", "disabled": true })),
        ))
        .await
        .unwrap();
    assert!(!reply.is_error());

    let record = timeout(Duration::from_secs(2), events.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.server, "events");
    assert_eq!(record.event, "BeamOff");
    assert!(record.disabled);

    // Unknown event names never reach the registry.
    let reply = commander
        .request(&Command::new(
            "event",
            "set_disabled",
            Some(json!({ "event": "Gremlins", "disabled": true })),
        ))
        .await
        .unwrap();
    assert!(reply.is_error());

    server.shutdown().await;
}

#[tokio::test]
async fn start_command_begins_current_sampling() {
    let server = start_server("daq", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();
    let mut data = Subscription::connect(&server.data_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let reply = commander
        .request(&Command::new("server", "start", None))
        .await
        .unwrap();
    assert!(!reply.is_error());
    assert_eq!(reply.data.unwrap()["pid"], std::process::id());

    let packet = timeout(Duration::from_secs(2), async {
        loop {
            let packet = data.next_packet().await.unwrap().unwrap();
            if packet.meta.kind == "raw_data" {
                return packet;
            }
        }
    })
    .await
    .unwrap();
    assert!(packet.data["current"].as_f64().unwrap() > 0.0);

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_the_stage_to_park() {
    use irrad_server::stage::StageAxis;

    let server = start_server("parker", 50.0).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();

    // Put the raster origin away from the start corner.
    for (axis, value) in [("x", 5.0), ("y", 7.0)] {
        commander
            .request(&Command::new(
                "stage",
                "move_abs",
                Some(json!({ "axis": axis, "value": value })),
            ))
            .await
            .unwrap();
    }
    commander
        .request(&Command::new(
            "scan",
            "prepare",
            Some(json!({
                "rel_start": [0.0, -2.0],
                "rel_end": [20.0, 40.0],
                "speed": 20.0,
                "row_sep": 4.0,
            })),
        ))
        .await
        .unwrap();

    // Pause so the scan sits at a row boundary when shutdown arrives.
    commander
        .request(&Command::new("scan", "pause", None))
        .await
        .unwrap();
    commander
        .request(&Command::new("scan", "scan_device", None))
        .await
        .unwrap();
    sleep(Duration::from_millis(80)).await;

    server.token.cancel();
    timeout(Duration::from_secs(5), server.running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // By the time the process has exited, both axes are back at the origin.
    assert_eq!(server.x.position().await.unwrap(), 5);
    assert_eq!(server.y.position().await.unwrap(), 7);
}

#[tokio::test]
async fn low_beam_current_raises_beam_off() {
    // Baseline well below the 1 nA threshold.
    let server = start_server("lowbeam", 0.2).await;
    let mut commander = Commander::connect(&server.cmd_addr).await.unwrap();
    let mut events = Subscription::connect(&server.event_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    commander
        .request(&Command::new("server", "start", None))
        .await
        .unwrap();

    let record = timeout(Duration::from_secs(2), events.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.event, "BeamOff");
    assert!(record.active);

    server.shutdown().await;
}
