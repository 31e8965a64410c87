//! End-to-end tests of a running process core over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

use irrad_core::{
    Commander, CoreConfig, DescriptorFile, ProcessCore, Publisher, ReplyHandle, RoleHandler,
    Subscription,
};
use irrad_types::{ChannelKind, Command, DataPacket, EventRecord};

struct CountingRole {
    cmd_calls: AtomicUsize,
    overlapping: AtomicUsize,
    in_flight: AtomicUsize,
    events_seen: AtomicUsize,
}

impl CountingRole {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cmd_calls: AtomicUsize::new(0),
            overlapping: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            events_seen: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RoleHandler for CountingRole {
    async fn handle_cmd(
        &self,
        target: &str,
        cmd: &str,
        data: Option<Value>,
        reply: ReplyHandle,
    ) -> anyhow::Result<()> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        self.cmd_calls.fetch_add(1, Ordering::SeqCst);

        // Hold the slot long enough for a pipelined second command to
        // overlap if dispatch ever allowed it.
        sleep(Duration::from_millis(40)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match (target, cmd) {
            ("test", "echo") => reply.standard(data),
            ("test", "quiet") => {}
            _ => anyhow::bail!("unknown command '{cmd}' for '{target}'"),
        }
        Ok(())
    }

    async fn handle_data(&self, packet: DataPacket) -> Vec<DataPacket> {
        vec![DataPacket::new(
            "relay",
            "interpreted",
            json!({ "from": packet.meta.name }),
        )]
    }

    async fn handle_event(&self, _record: EventRecord) {
        self.events_seen.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(name: &str, run_dir: &std::path::Path) -> CoreConfig {
    let mut config = CoreConfig::new(name);
    config.run_dir = run_dir.to_path_buf();
    config.watch_interval = Duration::from_millis(50);
    config
}

fn addr_of(core: &ProcessCore, kind: ChannelKind) -> String {
    format!("127.0.0.1:{}", core.port(kind).unwrap())
}

#[tokio::test]
async fn every_command_gets_exactly_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("replies", dir.path())).await.unwrap();
    let cmd_addr = addr_of(&core, ChannelKind::Cmd);
    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(CountingRole::new()));

    let mut commander = Commander::connect(&cmd_addr).await.unwrap();

    let reply = commander
        .request(&Command::new("test", "echo", Some(json!(7))))
        .await
        .unwrap();
    assert_eq!(reply.reply, "echo");
    assert_eq!(reply.sender, "replies");
    assert_eq!(reply.data, Some(json!(7)));
    assert!(!reply.is_error());

    // Handler without an explicit reply still produces one.
    let reply = commander
        .request(&Command::new("test", "quiet", None))
        .await
        .unwrap();
    assert_eq!(reply.reply, "quiet");
    assert!(!reply.is_error());

    // Unknown command turns into an error reply, not silence.
    let reply = commander
        .request(&Command::new("test", "bogus", None))
        .await
        .unwrap();
    assert_eq!(reply.reply, "bogus");
    assert!(reply.is_error());

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_commands_are_rejected_before_the_handler() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("rejects", dir.path())).await.unwrap();
    let cmd_addr = addr_of(&core, ChannelKind::Cmd);
    let token = core.cancellation_token();
    let role = CountingRole::new();
    let running = tokio::spawn(core.run(role.clone()));

    let stream = TcpStream::connect(&cmd_addr).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    for bad in ["this is not json\n", "{\"data\": 1}\n"] {
        writer.write_all(bad.as_bytes()).await.unwrap();
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["reply"], "invalid");
    }

    assert_eq!(role.cmd_calls.load(Ordering::SeqCst), 0);

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn pipelined_commands_never_overlap_in_the_handler() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("serial", dir.path())).await.unwrap();
    let cmd_addr = addr_of(&core, ChannelKind::Cmd);
    let token = core.cancellation_token();
    let role = CountingRole::new();
    let running = tokio::spawn(core.run(role.clone()));

    let stream = TcpStream::connect(&cmd_addr).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Two commands in one write; the second must wait for the first reply.
    writer
        .write_all(
            b"{\"target\": \"test\", \"cmd\": \"quiet\"}\n{\"target\": \"test\", \"cmd\": \"quiet\"}\n",
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["reply"], "quiet");
    }

    assert_eq!(role.cmd_calls.load(Ordering::SeqCst), 2);
    assert_eq!(role.overlapping.load(Ordering::SeqCst), 0);

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn command_channel_survives_an_abrupt_disconnect() {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("sturdy", dir.path())).await.unwrap();
    let cmd_addr = addr_of(&core, ChannelKind::Cmd);
    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(CountingRole::new()));

    // A commander that sends half a line and resets the connection.
    let mut rude = TcpStream::connect(&cmd_addr).await.unwrap();
    rude.set_linger(Some(Duration::from_secs(0))).unwrap();
    rude.write_all(b"{\"target\": \"test\",").await.unwrap();
    drop(rude);
    sleep(Duration::from_millis(50)).await;

    // The next commander is still served.
    let mut commander = Commander::connect(&cmd_addr).await.unwrap();
    let reply = timeout(
        Duration::from_secs(2),
        commander.request(&Command::new("test", "echo", Some(json!(1)))),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.reply, "echo");
    assert!(!reply.is_error());

    // And so is one that vanishes before reading its reply.
    let mut impatient = Commander::connect(&cmd_addr).await.unwrap();
    drop(
        timeout(
            Duration::from_secs(2),
            impatient.request(&Command::new("test", "quiet", None)),
        )
        .await
        .unwrap(),
    );
    drop(impatient);
    sleep(Duration::from_millis(50)).await;

    let mut commander = Commander::connect(&cmd_addr).await.unwrap();
    let reply = commander
        .request(&Command::new("test", "quiet", None))
        .await
        .unwrap();
    assert!(!reply.is_error());

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn busy_flag_is_set_while_a_command_is_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("busy", dir.path())).await.unwrap();
    let cmd_addr = addr_of(&core, ChannelKind::Cmd);
    let busy = core.busy_flag();
    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(CountingRole::new()));

    assert!(!busy.load(Ordering::SeqCst));

    let mut commander = Commander::connect(&cmd_addr).await.unwrap();
    let request = tokio::spawn(async move {
        commander
            .request(&Command::new("test", "quiet", None))
            .await
            .unwrap()
    });

    // The handler sleeps 40 ms, so the flag is observable mid-flight.
    timeout(Duration::from_secs(2), async {
        while !busy.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("busy flag never set");

    let reply = request.await.unwrap();
    assert!(!reply.is_error());
    assert!(!busy.load(Ordering::SeqCst));

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn data_channel_fans_out_in_publish_order() {
    let dir = tempfile::tempdir().unwrap();
    let core = ProcessCore::bind(config("fanout", dir.path())).await.unwrap();
    let data_addr = addr_of(&core, ChannelKind::Data);
    let publisher: Publisher = core.data_publisher();
    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(CountingRole::new()));

    let mut subscription = Subscription::connect(&data_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    for i in 0..10 {
        publisher
            .publish_json(&DataPacket::new("fanout", "raw_data", json!({ "seq": i })))
            .unwrap();
    }

    for i in 0..10 {
        let packet = timeout(Duration::from_secs(2), subscription.next_packet())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(packet.meta.name, "fanout");
        assert_eq!(packet.data["seq"], i);
    }

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn descriptor_exists_while_running_and_is_removed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = config("lifecycle", dir.path());
    let descriptor_path = config.descriptor_path();

    let core = ProcessCore::bind(config).await.unwrap();
    let ports = core.ports().clone();
    let token = core.cancellation_token();
    let running = tokio::spawn(core.run(CountingRole::new()));

    let descriptor = DescriptorFile::read(&descriptor_path).unwrap();
    assert_eq!(descriptor.pid, std::process::id());
    assert_eq!(descriptor.name, "lifecycle");
    assert_eq!(descriptor.ports, ports);
    assert_eq!(descriptor.ports.len(), 4);

    token.cancel();
    running.await.unwrap().unwrap();
    assert!(!descriptor_path.exists());
}

#[tokio::test]
async fn second_instance_refuses_to_start_while_first_is_alive() {
    let dir = tempfile::tempdir().unwrap();
    let first = ProcessCore::bind(config("orphan", dir.path())).await.unwrap();
    let token = first.cancellation_token();
    let running = tokio::spawn(first.run(CountingRole::new()));
    sleep(Duration::from_millis(50)).await;

    // Same name, same run dir, default refuse policy.
    let second = ProcessCore::bind(config("orphan", dir.path())).await;
    assert!(matches!(
        second,
        Err(irrad_core::CoreError::OrphanAlive { pid, .. }) if pid == std::process::id()
    ));

    token.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn upstream_data_is_interpreted_and_republished() {
    let dir = tempfile::tempdir().unwrap();

    // Producer process publishing raw packets.
    let producer = ProcessCore::bind(config("producer", dir.path())).await.unwrap();
    let producer_data = addr_of(&producer, ChannelKind::Data);
    let producer_pub = producer.data_publisher();
    let producer_token = producer.cancellation_token();
    let producer_run = tokio::spawn(producer.run(CountingRole::new()));

    // Consumer process subscribed to the producer's data channel.
    let mut consumer_config = config("consumer", dir.path());
    consumer_config.upstream_data = vec![producer_data];
    let consumer = ProcessCore::bind(consumer_config).await.unwrap();
    let consumer_data = addr_of(&consumer, ChannelKind::Data);
    let consumer_token = consumer.cancellation_token();
    let consumer_run = tokio::spawn(consumer.run(CountingRole::new()));

    let mut subscription = Subscription::connect(&consumer_data).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    producer_pub
        .publish_json(&DataPacket::new("producer", "raw_data", json!({ "v": 1 })))
        .unwrap();

    let packet = timeout(Duration::from_secs(3), subscription.next_packet())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(packet.meta.name, "relay");
    assert_eq!(packet.meta.kind, "interpreted");
    assert_eq!(packet.data["from"], "producer");

    consumer_token.cancel();
    producer_token.cancel();
    consumer_run.await.unwrap().unwrap();
    producer_run.await.unwrap().unwrap();
}

#[tokio::test]
async fn upstream_events_reach_the_role_handler() {
    let dir = tempfile::tempdir().unwrap();

    let source = ProcessCore::bind(config("source", dir.path())).await.unwrap();
    let source_events = addr_of(&source, ChannelKind::Event);
    let source_pub = source.event_publisher();
    let source_token = source.cancellation_token();
    let source_run = tokio::spawn(source.run(CountingRole::new()));

    let mut sink_config = config("sink", dir.path());
    sink_config.upstream_events = vec![source_events];
    let sink = ProcessCore::bind(sink_config).await.unwrap();
    let sink_token = sink.cancellation_token();
    let role = CountingRole::new();
    let sink_run = tokio::spawn(sink.run(role.clone()));

    sleep(Duration::from_millis(200)).await;
    source_pub
        .publish_json(&EventRecord {
            server: "source".into(),
            event: "BeamOff".into(),
            active: true,
            disabled: false,
        })
        .unwrap();

    timeout(Duration::from_secs(3), async {
        while role.events_seen.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    sink_token.cancel();
    source_token.cancel();
    sink_run.await.unwrap().unwrap();
    source_run.await.unwrap().unwrap();
}
