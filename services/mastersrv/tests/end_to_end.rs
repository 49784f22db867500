//! Master/node round-trip tests
//!
//! Spins the real dispatch server and executor on an ephemeral port with
//! the simulated bus and GPIO backends, then drives them through the
//! master's sender exactly as the operator surface would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};

use loopsim_model::channel::{Channel, ChannelKind};
use loopsim_model::{Severity, SignalKind};
use mastersrv::sender::{GuiEvent, SenderManager};
use nodesrv::executor::Executor;
use nodesrv::gpio::{GpioBackend, SimGpioBackend};
use nodesrv::registry::ModuleRegistry;
use nodesrv::server::DispatchServer;
use nodesrv::spi::{SimSpiBus, SpiBus, STATUS_BYTE_LOOP_FAULT};
use nodesrv::state::NodeState;

struct TestNode {
    addr: SocketAddr,
    bus: Arc<SimSpiBus>,
    gpio: Arc<SimGpioBackend>,
    shutdown_tx: watch::Sender<bool>,
}

async fn spawn_node() -> TestNode {
    let bus = Arc::new(SimSpiBus::new());
    let gpio = Arc::new(SimGpioBackend::new());
    let registry = Arc::new(Mutex::new(ModuleRegistry::new(
        bus.clone() as Arc<dyn SpiBus>,
        gpio.clone() as Arc<dyn GpioBackend>,
    )));
    let state = Arc::new(NodeState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor = Executor::new(Arc::clone(&state), Arc::clone(&registry));
    tokio::spawn(executor.run(shutdown_rx.clone()));

    let listener = DispatchServer::bind("127.0.0.1:0".parse().unwrap()).expect("ephemeral bind");
    let addr = listener.local_addr().unwrap();
    let server = DispatchServer::new(state, registry, Duration::from_secs(2));
    tokio::spawn(server.run(listener, shutdown_rx));

    TestNode {
        addr,
        bus,
        gpio,
        shutdown_tx,
    }
}

fn master_for(addr: SocketAddr) -> (Arc<SenderManager>, mpsc::UnboundedReceiver<GuiEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = SenderManager::new(
        addr.ip().to_string(),
        addr.port(),
        Duration::from_secs(2),
        Duration::from_millis(20),
        tx,
    );
    Arc::clone(&sender).start();
    (sender, rx)
}

fn pressure_channel() -> Channel {
    Channel {
        name: "SPT".to_string(),
        slot: 14,
        pin: Some("GPIO13".to_string()),
        kind: ChannelKind::Ao,
        units: Some("PSI".to_string()),
        eng_low: 97.0,
        eng_high: 200.0,
        show_on_gui: true,
        calibration: None,
    }
}

fn level_channel() -> Channel {
    Channel {
        name: "UVT".to_string(),
        slot: 11,
        pin: Some("GPIO5".to_string()),
        kind: ChannelKind::Ai,
        units: Some("%".to_string()),
        eng_low: 100.0,
        eng_high: 0.0,
        show_on_gui: true,
        calibration: None,
    }
}

async fn next_data(rx: &mut mpsc::UnboundedReceiver<GuiEvent>) -> loopsim_model::DataEntry {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("queue open")
        {
            GuiEvent::Data(entry) => return entry,
            GuiEvent::Error(e) => panic!("unexpected error event: {e:?}"),
        }
    }
}

#[tokio::test]
async fn nominal_ao_command_round_trips_in_engineering_units() {
    let node = spawn_node().await;
    let (sender, mut rx) = master_for(node.addr);
    let channel = pressure_channel();

    // 148.5 PSI on [97, 200] is exactly 12.0 mA on the wire.
    sender
        .place_single_eng(&channel, 148.5, loopsim_model::epoch_now())
        .unwrap();

    let echo = next_data(&mut rx).await;
    assert_eq!(echo.kind, SignalKind::Ao);
    assert_eq!(echo.pin, "GPIO13");
    let ma = echo.value.as_number().unwrap();
    assert!((ma - 12.0).abs() < 1e-9, "echoed {ma} mA");

    // The node actually asserted that current on its DAC.
    let asserted = node.bus.last_write_ma().unwrap();
    assert!((asserted - 12.0).abs() < 0.001);

    sender.shutdown().await;
    let _ = node.shutdown_tx.send(true);
}

#[tokio::test]
async fn ai_poll_averages_and_converts_through_inverted_range() {
    let node = spawn_node().await;
    node.bus.set_loop_ma(12.0);
    let (sender, mut rx) = master_for(node.addr);
    let channel = level_channel();

    // The wire value of an AI poll is the boxcar length.
    sender
        .place_single_ma(&channel, 8.0, loopsim_model::epoch_now())
        .unwrap();

    let reading = next_data(&mut rx).await;
    assert_eq!(reading.kind, SignalKind::Ai);
    let ma = reading.value.as_number().unwrap();
    assert!((ma - 12.0).abs() < 0.01, "mean was {ma}");

    // Midscale on the inverted 100..0 range reads 50 %.
    let eng = channel.ma_to_eng(ma).unwrap();
    assert!((eng - 50.0).abs() < 0.1, "displayed {eng}");

    sender.shutdown().await;
    let _ = node.shutdown_tx.send(true);
}

#[tokio::test]
async fn ramp_delivers_first_steps_and_cancellation_stops_the_rest() {
    let node = spawn_node().await;
    let (sender, mut rx) = master_for(node.addr);
    let channel = pressure_channel();

    let placed = sender.place_ramp_ma(&channel, 4.0, 20.0, 2.0).unwrap();
    assert_eq!(placed, 9);

    // First step goes out immediately.
    let first = next_data(&mut rx).await;
    assert!((first.value.as_number().unwrap() - 4.0).abs() < 1e-9);

    // Cancel while the rest of the sweep is still scheduled.
    let removed = sender.cancel_by_pin("GPIO13");
    assert!(removed > 0, "expected future steps to be cancelled");
    assert_eq!(sender.pending(), 0);

    sender.shutdown().await;
    let _ = node.shutdown_tx.send(true);
}

#[tokio::test]
async fn transport_outage_requeues_outputs_until_the_node_returns() {
    // Reserve an address, then drop the listener to simulate the node
    // being offline.
    let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = parked.local_addr().unwrap();
    drop(parked);

    let (sender, mut rx) = master_for(addr);
    let channel = pressure_channel();
    sender
        .place_single_eng(&channel, 148.5, loopsim_model::epoch_now())
        .unwrap();

    // The failed exchange surfaces exactly one transport error and the
    // output entry goes back on the scheduler.
    match tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("error before timeout")
        .expect("queue open")
    {
        GuiEvent::Error(e) => assert_eq!(e.severity, Severity::High),
        GuiEvent::Data(d) => panic!("unexpected data event: {d:?}"),
    }

    sender.shutdown().await;
}

#[tokio::test]
async fn loop_fault_produces_nak_echo_and_high_error() {
    let node = spawn_node().await;
    node.bus.set_status_byte(STATUS_BYTE_LOOP_FAULT);
    let (sender, mut rx) = master_for(node.addr);
    let channel = pressure_channel();

    sender
        .place_single_eng(&channel, 148.5, loopsim_model::epoch_now())
        .unwrap();

    let mut saw_nak = false;
    let mut saw_loop_error = false;
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("queue open")
        {
            GuiEvent::Data(entry) => {
                assert!(entry.value.is_nak());
                saw_nak = true;
            },
            GuiEvent::Error(error) => {
                assert_eq!(error.severity, Severity::High);
                assert!(error.source.starts_with("ao"));
                assert!(error.description.contains("GPIO13"));
                saw_loop_error = true;
            },
        }
    }
    assert!(saw_nak && saw_loop_error);

    sender.shutdown().await;
    let _ = node.shutdown_tx.send(true);
}

#[tokio::test]
async fn do_and_di_round_trip_through_the_sim_board() {
    let node = spawn_node().await;
    let (sender, mut rx) = master_for(node.addr);

    let relay = Channel {
        name: "VLV".to_string(),
        slot: 12,
        pin: Some("GPIO6".to_string()),
        kind: ChannelKind::Do,
        units: None,
        eng_low: 0.0,
        eng_high: 1.0,
        show_on_gui: true,
        calibration: None,
    };
    sender
        .place_single_eng(&relay, 1.0, loopsim_model::epoch_now())
        .unwrap();

    let ack = next_data(&mut rx).await;
    assert_eq!(ack.kind, SignalKind::Do);
    assert_eq!(ack.value.as_number(), Some(1.0));
    assert_eq!(node.gpio.level(6), Some(true));

    let door = Channel {
        name: "DOOR".to_string(),
        slot: 16,
        pin: Some("GPIO16".to_string()),
        kind: ChannelKind::Di,
        units: None,
        eng_low: 0.0,
        eng_high: 1.0,
        show_on_gui: true,
        calibration: None,
    };
    node.gpio.set_level(16, true);
    sender
        .place_single_eng(&door, 0.0, loopsim_model::epoch_now())
        .unwrap();

    let reading = next_data(&mut rx).await;
    assert_eq!(reading.kind, SignalKind::Di);
    assert_eq!(reading.value.as_number(), Some(1.0));

    sender.shutdown().await;
    let _ = node.shutdown_tx.send(true);
}
